//! Test context providing a fully wired scheduler.

use crate::fixtures::{STREAM, TemplateFixture};
use crate::helpers::RecordingSink;
use horde_core::ids::{PoolId, StreamId};
use horde_notify::{LoggingSink, NotificationHub};
use horde_scheduler::{JobCollection, JobService, SchedulerConfig, TaskSource};
use horde_store::{
    MemoryCommitSource, MemoryGraphRepository, MemoryJobRepository, MemoryTemplateProvider,
    PoolConfig, StaticPoolDirectory,
};
use std::sync::Arc;

/// First change submitted to the test stream.
pub const LATEST_CHANGE: u32 = 1000;

/// Scheduler backed by in-memory stores.
///
/// Pools: `win-compile` serves `Win64` with agents online, `linux` serves
/// `Linux` with every agent offline, and `mac` serves `Mac` with no agents.
pub struct TestContext {
    pub jobs: Arc<MemoryJobRepository>,
    pub collection: Arc<JobCollection>,
    pub service: JobService,
    pub task_source: TaskSource,
    pub pools: Arc<StaticPoolDirectory>,
    pub commits: Arc<MemoryCommitSource>,
    pub sink: Arc<RecordingSink>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(SchedulerConfig::default()).await
    }

    pub async fn with_config(config: SchedulerConfig) -> Self {
        crate::init_test_logging();

        let commits = Arc::new(MemoryCommitSource::new());
        commits
            .submit(&StreamId::new(STREAM), LATEST_CHANGE, true)
            .await;

        let pools = Arc::new(StaticPoolDirectory::new(vec![
            pool("win-compile", "Win64", 4, 4),
            pool("linux", "Linux", 2, 0),
            pool("mac", "Mac", 0, 0),
        ]));

        let sink = Arc::new(RecordingSink::default());
        let hub = Arc::new(
            NotificationHub::new()
                .with_sink(sink.clone())
                .with_sink(Arc::new(LoggingSink)),
        );

        let jobs = Arc::new(MemoryJobRepository::new());
        let collection = Arc::new(JobCollection::new(
            jobs.clone(),
            Arc::new(MemoryGraphRepository::new()),
            hub.clone(),
            config,
        ));

        let templates = MemoryTemplateProvider::new()
            .with_template(TemplateFixture::INCREMENTAL, TemplateFixture::incremental())
            .with_template(TemplateFixture::BARE, TemplateFixture::bare())
            .with_template(TemplateFixture::TESTS, TemplateFixture::tests())
            .with_template(TemplateFixture::PACKAGING, TemplateFixture::packaging());
        let service = JobService::new(collection.clone(), Arc::new(templates), commits.clone());
        let task_source = TaskSource::new(collection.clone(), pools.clone(), commits.clone(), hub);

        Self {
            jobs,
            collection,
            service,
            task_source,
            pools,
            commits,
            sink,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        StreamId::new(STREAM)
    }
}

fn pool(id: &str, agent_type: &str, agents: u32, online: u32) -> PoolConfig {
    PoolConfig {
        id: PoolId::new(id),
        agent_types: vec![agent_type.to_string()],
        agents,
        online,
    }
}
