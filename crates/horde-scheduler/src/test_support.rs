//! Mock ports shared by the unit tests in this crate.

use async_trait::async_trait;
use horde_core::events::{JobScheduledPayload, LabelUpdatePayload, StepCompletePayload};
use horde_core::graph::Graph;
use horde_core::ids::*;
use horde_core::job::{Job, JobState};
use horde_core::ports::*;
use horde_core::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct MockJobRepository {
    pub jobs: Mutex<HashMap<JobId, Job>>,
    /// Number of upcoming writes to fail as if another writer won.
    pub forced_conflicts: AtomicU32,
}

impl MockJobRepository {
    pub fn force_conflicts(&self, count: u32) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    /// Overwrite a stored job, simulating a concurrent writer.
    pub fn bump(&self, job_id: JobId) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&job_id) {
            job.update_index += 1;
        }
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn insert(&self, job: &Job) -> Result<()> {
        self.jobs.lock().unwrap().insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn try_replace(&self, expected_update_index: u64, job: &Job) -> Result<bool> {
        let pending = self.forced_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.forced_conflicts.store(pending - 1, Ordering::SeqCst);
            return Ok(false);
        }
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get(&job.id) {
            Some(stored) if stored.update_index == expected_update_index => {
                jobs.insert(job.id, job.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_active(&self) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|job| job.state() != JobState::Complete)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MockGraphRepository {
    pub graphs: Mutex<HashMap<ContentHash, Arc<Graph>>>,
}

#[async_trait]
impl GraphRepository for MockGraphRepository {
    async fn add(&self, graph: Graph) -> Result<Arc<Graph>> {
        let mut graphs = self.graphs.lock().unwrap();
        Ok(graphs
            .entry(graph.hash.clone())
            .or_insert_with(|| Arc::new(graph))
            .clone())
    }

    async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<Graph>>> {
        Ok(self.graphs.lock().unwrap().get(hash).cloned())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub steps: Mutex<Vec<StepCompletePayload>>,
    pub scheduled: Mutex<Vec<JobScheduledPayload>>,
    pub labels: Mutex<Vec<LabelUpdatePayload>>,
}

impl NotificationSink for RecordingSink {
    fn on_job_step_complete(&self, event: &StepCompletePayload) {
        self.steps.lock().unwrap().push(event.clone());
    }

    fn on_job_scheduled(&self, event: &JobScheduledPayload) {
        self.scheduled.lock().unwrap().push(event.clone());
    }

    fn on_label_update(&self, event: &LabelUpdatePayload) {
        self.labels.lock().unwrap().push(event.clone());
    }
}

/// Pools keyed by agent type.
#[derive(Default)]
pub struct MockPoolDirectory {
    pub pools: HashMap<String, PoolLookup>,
}

impl MockPoolDirectory {
    pub fn with_pool(mut self, agent_type: &str, pool: &str, online: u32) -> Self {
        self.pools.insert(
            agent_type.to_string(),
            PoolLookup::Pool {
                pool_id: PoolId::new(pool),
                status: PoolStatus {
                    agents: online.max(1),
                    online,
                },
            },
        );
        self
    }

    pub fn with_lookup(mut self, agent_type: &str, lookup: PoolLookup) -> Self {
        self.pools.insert(agent_type.to_string(), lookup);
        self
    }
}

#[async_trait]
impl PoolDirectory for MockPoolDirectory {
    async fn resolve_pool(&self, _stream_id: &StreamId, agent_type: &str) -> Result<PoolLookup> {
        Ok(self
            .pools
            .get(agent_type)
            .cloned()
            .unwrap_or(PoolLookup::UnknownAgentType))
    }
}

#[derive(Default)]
pub struct MockCommitSource {
    pub latest: u32,
    pub shelves: Vec<u32>,
}

#[async_trait]
impl CommitSource for MockCommitSource {
    async fn resolve(&self, _stream_id: &StreamId, query: &ChangeQuery) -> Result<ResolvedChange> {
        let change = match query {
            ChangeQuery::Fixed { change } => *change,
            _ => self.latest,
        };
        Ok(ResolvedChange {
            change,
            code_change: change,
        })
    }

    async fn shelf_exists(&self, _stream_id: &StreamId, change: u32) -> Result<bool> {
        Ok(self.shelves.contains(&change))
    }
}

#[derive(Default)]
pub struct MockTemplateProvider {
    pub templates: HashMap<String, TemplateConfig>,
}

#[async_trait]
impl TemplateProvider for MockTemplateProvider {
    async fn get_template(
        &self,
        _stream_id: &StreamId,
        template_id: &TemplateId,
    ) -> Result<Option<TemplateConfig>> {
        Ok(self.templates.get(template_id.as_str()).cloned())
    }
}
