//! In-memory implementation of JobRepository.

use async_trait::async_trait;
use horde_core::ids::JobId;
use horde_core::job::{Job, JobState};
use horde_core::ports::JobRepository;
use horde_core::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Jobs keyed by id. Replacements are conditional on the stored update index.
#[derive(Default)]
pub struct MemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn insert(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Database(format!("job {} already exists", job.id)));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn try_replace(&self, expected_update_index: u64, job: &Job) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&job.id).ok_or(Error::JobNotFound(job.id))?;
        if stored.update_index != expected_update_index {
            debug!(
                job_id = %job.id,
                expected = expected_update_index,
                stored = stored.update_index,
                "Rejected stale job write"
            );
            return Ok(false);
        }
        *stored = job.clone();
        Ok(true)
    }

    async fn list_active(&self) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().await;
        let mut active: Vec<Job> = jobs
            .values()
            .filter(|job| job.state() != JobState::Complete)
            .cloned()
            .collect();
        active.sort_by_key(|job| job.id);
        Ok(active)
    }
}
