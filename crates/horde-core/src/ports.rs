//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduler and the systems
//! it runs alongside: storage, templates, source control and agent pools.

use crate::events::{JobScheduledPayload, LabelUpdatePayload, StepCompletePayload};
use crate::graph::Graph;
use crate::ids::*;
use crate::job::{ChainedJobTemplate, Job, Priority};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Storage for jobs, with conditional writes keyed on `Job::update_index`.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Store a new job.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Replace a job if the stored copy is still at `expected_update_index`.
    ///
    /// Returns false when another writer got there first.
    async fn try_replace(&self, expected_update_index: u64, job: &Job) -> Result<bool>;

    /// Jobs that still have batches left to run.
    async fn list_active(&self) -> Result<Vec<Job>>;
}

/// Content-addressed graph storage.
#[async_trait]
pub trait GraphRepository: Send + Sync {
    /// Store a graph, returning the shared copy if one with the same hash exists.
    async fn add(&self, graph: Graph) -> Result<Arc<Graph>>;

    async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<Graph>>>;
}

/// Template settings that affect how a job is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub name: String,
    pub hash: Option<ContentHash>,
    /// Agent type for the bootstrap node that generates the rest of the graph.
    pub initial_agent_type: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub chained_jobs: Vec<ChainedJobTemplate>,
    /// Change to build when a request does not name one; the first entry
    /// whose tags the job carries wins.
    #[serde(default)]
    pub change_queries: Vec<ConditionalChangeQuery>,
}

#[async_trait]
pub trait TemplateProvider: Send + Sync {
    async fn get_template(
        &self,
        stream_id: &StreamId,
        template_id: &TemplateId,
    ) -> Result<Option<TemplateConfig>>;
}

/// Which change a new job should build.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeQuery {
    #[default]
    Latest,
    /// Most recent change that touched code.
    LatestCode,
    /// Most recent change that touched content.
    LatestContent,
    Fixed {
        change: u32,
    },
    /// Most recent change on which a template (optionally one target of it) succeeded.
    LastSuccessful {
        template_id: TemplateId,
        target: Option<String>,
    },
}

/// A change query that only applies to jobs carrying all of `tags`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConditionalChangeQuery {
    #[serde(default)]
    pub tags: Vec<String>,
    pub query: ChangeQuery,
}

impl ConditionalChangeQuery {
    pub fn applies_to(&self, job_tags: &[String]) -> bool {
        self.tags.iter().all(|tag| job_tags.contains(tag))
    }
}

/// Picks the first query that applies to a job with the given tags.
pub fn select_change_query(
    queries: &[ConditionalChangeQuery],
    job_tags: &[String],
) -> ChangeQuery {
    queries
        .iter()
        .find(|query| query.applies_to(job_tags))
        .map(|query| query.query.clone())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedChange {
    pub change: u32,
    /// Last change at or before `change` that touched code.
    pub code_change: u32,
}

/// Source control as seen by the scheduler.
#[async_trait]
pub trait CommitSource: Send + Sync {
    async fn resolve(&self, stream_id: &StreamId, query: &ChangeQuery) -> Result<ResolvedChange>;

    /// Whether the shelved change behind a preflight still exists.
    async fn shelf_exists(&self, stream_id: &StreamId, change: u32) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStatus {
    pub agents: u32,
    pub online: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolLookup {
    Pool { pool_id: PoolId, status: PoolStatus },
    UnknownAgentType,
    /// The agent type names a pool that does not exist.
    UnknownPool(PoolId),
}

/// Maps agent types onto the pools that serve them.
#[async_trait]
pub trait PoolDirectory: Send + Sync {
    async fn resolve_pool(&self, stream_id: &StreamId, agent_type: &str) -> Result<PoolLookup>;
}

/// Receiver of job notifications.
///
/// Called inline after a job update has been stored, so implementations must
/// not block.
pub trait NotificationSink: Send + Sync {
    fn on_job_step_complete(&self, _event: &StepCompletePayload) {}

    fn on_job_scheduled(&self, _event: &JobScheduledPayload) {}

    fn on_label_update(&self, _event: &LabelUpdatePayload) {}
}
