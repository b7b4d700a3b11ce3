//! Queue of ready batches handed out to agents.

use crate::collection::JobCollection;
use chrono::Utc;
use horde_core::events::JobScheduledPayload;
use horde_core::ids::*;
use horde_core::job::{Job, JobStepBatchError, JobStepBatchState, LeaseAssignment, Priority};
use horde_core::ports::{CommitSource, NotificationSink, PoolDirectory, PoolLookup};
use horde_core::Result;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::time::{Duration, interval};
use tracing::{debug, error, info, warn};

/// A ready batch waiting for an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub priority: Priority,
    pub pool_id: PoolId,
}

impl QueueItem {
    fn key(&self) -> (JobId, BatchId) {
        (self.job_id, self.batch_id)
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then older jobs, then earlier batches
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.job_id.cmp(&self.job_id))
            .then_with(|| other.batch_id.cmp(&self.batch_id))
    }
}

#[derive(Default)]
struct TaskQueue {
    heap: BinaryHeap<QueueItem>,
    queued: HashSet<(JobId, BatchId)>,
}

impl TaskQueue {
    fn push(&mut self, item: QueueItem) -> bool {
        if !self.queued.insert(item.key()) {
            return false;
        }
        self.heap.push(item);
        true
    }

    /// Drop entries for batches that are no longer ready.
    fn retain(&mut self, ready: &HashSet<(JobId, BatchId)>) -> usize {
        let before = self.heap.len();
        self.heap.retain(|item| ready.contains(&item.key()));
        self.queued.retain(|key| ready.contains(key));
        before - self.heap.len()
    }

    /// Remove the best item any of the given pools can serve.
    fn pop_for(&mut self, pools: &[PoolId]) -> Option<QueueItem> {
        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(item) = self.heap.pop() {
            if pools.contains(&item.pool_id) {
                found = Some(item);
                break;
            }
            skipped.push(item);
        }
        self.heap.extend(skipped);
        if let Some(item) = &found {
            self.queued.remove(&item.key());
        }
        found
    }
}

/// Counts from one pass over the active jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub queued: usize,
    pub removed: usize,
    pub failed: usize,
}

/// A batch leased to an agent.
#[derive(Debug, Clone)]
pub struct TaskAssignment {
    pub job: Job,
    pub batch_id: BatchId,
    pub pool_id: PoolId,
    pub lease_id: LeaseId,
}

/// Keeps the queue of ready batches in step with the job collection.
pub struct TaskSource {
    collection: Arc<JobCollection>,
    pools: Arc<dyn PoolDirectory>,
    commits: Arc<dyn CommitSource>,
    sink: Arc<dyn NotificationSink>,
    queue: Mutex<TaskQueue>,
}

impl TaskSource {
    pub fn new(
        collection: Arc<JobCollection>,
        pools: Arc<dyn PoolDirectory>,
        commits: Arc<dyn CommitSource>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            collection,
            pools,
            commits,
            sink,
            queue: Mutex::new(TaskQueue::default()),
        }
    }

    /// Rebuild the queue from the active jobs.
    ///
    /// Batches that cannot be scheduled at all are failed here instead of
    /// being queued.
    pub async fn tick(&self) -> Result<TickSummary> {
        let already_queued: HashSet<(JobId, BatchId)> = self.queue.lock().await.queued.clone();

        let mut summary = TickSummary::default();
        let mut ready = HashSet::new();
        let mut fresh = Vec::new();

        for mut job in self.collection.list_active().await? {
            let graph = self.collection.get_graph(&job).await?;
            let batch_ids: Vec<BatchId> = job
                .batches
                .iter()
                .filter(|batch| batch.state == JobStepBatchState::Ready)
                .map(|batch| batch.id)
                .collect();

            for batch_id in batch_ids {
                if already_queued.contains(&(job.id, batch_id)) {
                    ready.insert((job.id, batch_id));
                    continue;
                }
                let Some(batch) = job.batch(batch_id) else {
                    continue;
                };
                if batch.state != JobStepBatchState::Ready {
                    continue;
                }
                let agent_type = graph
                    .groups
                    .get(batch.group_idx)
                    .map(|group| group.agent_type.clone())
                    .unwrap_or_default();

                let failure = match self.check_batch(&job, &agent_type).await? {
                    Ok((pool_id, online)) => {
                        ready.insert((job.id, batch_id));
                        fresh.push((
                            QueueItem {
                                job_id: job.id,
                                batch_id,
                                priority: job.priority,
                                pool_id,
                            },
                            online,
                        ));
                        continue;
                    }
                    Err(failure) => failure,
                };

                warn!(
                    job_id = %job.id,
                    batch_id = %batch_id,
                    agent_type = %agent_type,
                    error = ?failure,
                    "Batch cannot be scheduled"
                );
                summary.failed += 1;
                match self
                    .collection
                    .try_update_batch(&job, batch_id, None, Some(failure))
                    .await?
                {
                    Some(updated) => job = updated,
                    // Someone else changed the job; carry on from their copy
                    // and look at this batch again next tick.
                    None => match self.collection.get(job.id).await? {
                        Some(latest) if latest.graph_hash == graph.hash => job = latest,
                        _ => break,
                    },
                }
            }
        }

        let mut queue = self.queue.lock().await;
        summary.removed = queue.retain(&ready);
        let mut scheduled = Vec::new();
        for (item, online) in fresh {
            let payload = JobScheduledPayload {
                job_id: item.job_id,
                batch_id: item.batch_id,
                pool_id: item.pool_id.clone(),
                pool_has_agents_online: online,
                scheduled_at: Utc::now(),
            };
            if queue.push(item) {
                summary.queued += 1;
                scheduled.push(payload);
            }
        }
        drop(queue);

        for payload in &scheduled {
            debug!(
                job_id = %payload.job_id,
                batch_id = %payload.batch_id,
                pool = %payload.pool_id,
                "Queued batch"
            );
            self.sink.on_job_scheduled(payload);
        }
        Ok(summary)
    }

    /// Resolve the pool for a batch, or the error to fail it with.
    async fn check_batch(
        &self,
        job: &Job,
        agent_type: &str,
    ) -> Result<std::result::Result<(PoolId, bool), JobStepBatchError>> {
        if let Some(shelf) = job.preflight_change
            && !self.commits.shelf_exists(&job.stream_id, shelf).await?
        {
            return Ok(Err(JobStepBatchError::UnknownShelf));
        }

        Ok(match self.pools.resolve_pool(&job.stream_id, agent_type).await? {
            PoolLookup::UnknownAgentType => Err(JobStepBatchError::UnknownAgentType),
            PoolLookup::UnknownPool(_) => Err(JobStepBatchError::UnknownPool),
            PoolLookup::Pool { status, .. } if status.agents == 0 => {
                Err(JobStepBatchError::NoAgentsInPool)
            }
            PoolLookup::Pool { pool_id, status } => Ok((pool_id, status.online > 0)),
        })
    }

    /// Lease the best queued batch one of the agent's pools can run.
    pub async fn try_assign(
        &self,
        agent_id: &AgentId,
        pools: &[PoolId],
    ) -> Result<Option<TaskAssignment>> {
        loop {
            let Some(item) = self.queue.lock().await.pop_for(pools) else {
                return Ok(None);
            };

            let Some(job) = self.collection.get(item.job_id).await? else {
                continue;
            };
            let is_ready = job
                .batch(item.batch_id)
                .is_some_and(|batch| batch.state == JobStepBatchState::Ready);
            if !is_ready {
                debug!(job_id = %item.job_id, batch_id = %item.batch_id, "Dropping stale queue entry");
                continue;
            }

            let lease = LeaseAssignment::new(agent_id.clone()).with_pool(item.pool_id.clone());
            let lease_id = lease.lease_id;
            match self
                .collection
                .try_assign_lease(&job, item.batch_id, lease)
                .await?
            {
                Some(job) => {
                    info!(
                        job_id = %job.id,
                        batch_id = %item.batch_id,
                        agent_id = %agent_id,
                        lease_id = %lease_id,
                        "Assigned batch"
                    );
                    return Ok(Some(TaskAssignment {
                        job,
                        batch_id: item.batch_id,
                        pool_id: item.pool_id,
                        lease_id,
                    }));
                }
                None => {
                    debug!(job_id = %item.job_id, batch_id = %item.batch_id, "Lost race for batch");
                }
            }
        }
    }

    /// Queued items, best first.
    pub async fn snapshot(&self) -> Vec<QueueItem> {
        let queue = self.queue.lock().await;
        let mut items = queue.heap.clone().into_sorted_vec();
        items.reverse();
        items
    }

    /// Tick on an interval until shutdown.
    pub async fn run(&self, tick_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(tick_interval);

        info!(interval_ms = tick_interval.as_millis() as u64, "Starting task source");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(summary) => debug!(
                            queued = summary.queued,
                            removed = summary.removed,
                            failed = summary.failed,
                            "Task source tick"
                        ),
                        Err(e) => error!(error = %e, "Task source tick failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Task source shutting down");
                        break;
                    }
                }
            }
        }
    }
}
