//! Job storage with optimistic concurrency.
//!
//! Mutators take the caller's snapshot of a job, apply the change to a copy
//! and store it only if nobody else has written the job in the meantime.
//! A snapshot that lost the race yields `Ok(None)`; the caller reloads and
//! decides whether the change still makes sense.

use crate::config::SchedulerConfig;
use chrono::Utc;
use horde_core::events::{LabelUpdatePayload, StepCompletePayload};
use horde_core::graph::Graph;
use horde_core::ids::*;
use horde_core::job::{
    Job, JobStepBatchError, JobStepBatchState, JobStepState, LabelTrigger, LeaseAssignment,
    NewJob, StepUpdate,
};
use horde_core::label::{LabelOutcome, LabelState, LabelStatus};
use horde_core::ports::{GraphRepository, JobRepository, NotificationSink};
use horde_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

enum WriteOutcome {
    Applied(Job),
    Conflict,
    Rejected(Error),
}

/// Jobs and the graphs they run, behind conditional writes.
pub struct JobCollection {
    jobs: Arc<dyn JobRepository>,
    graphs: Arc<dyn GraphRepository>,
    sink: Arc<dyn NotificationSink>,
    config: SchedulerConfig,
}

impl JobCollection {
    pub fn new(
        jobs: Arc<dyn JobRepository>,
        graphs: Arc<dyn GraphRepository>,
        sink: Arc<dyn NotificationSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            jobs,
            graphs,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Store the graph and a new job running it.
    pub async fn create_job(&self, request: NewJob, graph: Graph) -> Result<Job> {
        let graph = self.graphs.add(graph).await?;
        let job = Job::new(request, &graph)?;
        self.jobs.insert(&job).await?;

        info!(
            job_id = %job.id,
            stream = %job.stream_id,
            template = %job.template_id,
            change = job.change,
            batches = job.batches.len(),
            "Created job"
        );
        Ok(job)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        self.jobs.get(job_id).await
    }

    pub async fn list_active(&self) -> Result<Vec<Job>> {
        self.jobs.list_active().await
    }

    pub async fn add_graph(&self, graph: Graph) -> Result<Arc<Graph>> {
        self.graphs.add(graph).await
    }

    /// The graph a job is currently running.
    pub async fn get_graph(&self, job: &Job) -> Result<Arc<Graph>> {
        self.graphs
            .get(&job.graph_hash)
            .await?
            .ok_or_else(|| Error::GraphNotFound(job.graph_hash.clone()))
    }

    pub async fn get_label_states(&self, job: &Job) -> Result<Vec<LabelStatus>> {
        let graph = self.get_graph(job).await?;
        Ok(job.label_states(&graph))
    }

    pub async fn try_assign_lease(
        &self,
        job: &Job,
        batch_id: BatchId,
        lease: LeaseAssignment,
    ) -> Result<Option<Job>> {
        let graph = self.get_graph(job).await?;
        let outcome = self
            .try_write(job, &graph, &graph, |next| {
                next.assign_lease(batch_id, lease, &graph)
            })
            .await?;
        Ok(applied(outcome))
    }

    pub async fn try_update_batch(
        &self,
        job: &Job,
        batch_id: BatchId,
        state: Option<JobStepBatchState>,
        error: Option<JobStepBatchError>,
    ) -> Result<Option<Job>> {
        let graph = self.get_graph(job).await?;
        let max_retries = self.config.max_incomplete_retries;
        let outcome = self
            .try_write(job, &graph, &graph, |next| {
                next.update_batch(batch_id, state, error, &graph, max_retries)
            })
            .await?;
        Ok(applied(outcome))
    }

    pub async fn try_update_step(
        &self,
        job: &Job,
        batch_id: BatchId,
        step_id: StepId,
        update: StepUpdate,
    ) -> Result<Option<Job>> {
        let graph = self.get_graph(job).await?;
        let outcome = self
            .try_write(job, &graph, &graph, |next| {
                next.update_step(batch_id, step_id, update, &graph)
            })
            .await?;
        Ok(applied(outcome))
    }

    /// Move a job onto a graph that extends the one it is running.
    pub async fn try_update_graph(&self, job: &Job, new_graph: &Graph) -> Result<Option<Job>> {
        let old_graph = self.get_graph(job).await?;
        let outcome = self
            .try_write(job, &old_graph, new_graph, |next| {
                next.update_graph(&old_graph, new_graph)
            })
            .await?;
        Ok(applied(outcome))
    }

    pub async fn try_cancel(&self, job: &Job, user: UserId) -> Result<Option<Job>> {
        let graph = self.get_graph(job).await?;
        let outcome = self
            .try_write(job, &graph, &graph, |next| next.cancel(user, &graph))
            .await?;
        if let WriteOutcome::Applied(next) = &outcome {
            info!(job_id = %next.id, "Cancelled job");
        }
        Ok(applied(outcome))
    }

    /// Register a one-shot trigger fired when a label completes.
    ///
    /// Returns `Ok(None)` if the label already has a trigger.
    pub async fn try_add_label_trigger(
        &self,
        job: &Job,
        label: &str,
        trigger_id: TriggerId,
    ) -> Result<Option<Job>> {
        let graph = self.get_graph(job).await?;
        if graph.find_label(label).is_none() {
            return Err(Error::LabelNotFound(label.to_string()));
        }
        if job.label_triggers.iter().any(|t| t.label == label) {
            return Ok(None);
        }

        let outcome = self
            .try_write(job, &graph, &graph, |next| {
                next.label_triggers.push(LabelTrigger {
                    label: label.to_string(),
                    trigger_id,
                });
                Ok(())
            })
            .await?;
        Ok(applied(outcome))
    }

    /// Record the job started for a chained job entry.
    ///
    /// Returns `Ok(None)` if the entry already has a job.
    pub async fn try_set_chained_job(
        &self,
        job: &Job,
        trigger: &str,
        template_id: &TemplateId,
        chained_job_id: JobId,
    ) -> Result<Option<Job>> {
        let Some(index) = job
            .chained_jobs
            .iter()
            .position(|c| c.trigger == trigger && &c.template_id == template_id)
        else {
            return Err(Error::TemplateNotFound(template_id.to_string()));
        };
        if job.chained_jobs[index].job_id.is_some() {
            return Ok(None);
        }

        let graph = self.get_graph(job).await?;
        let outcome = self
            .try_write(job, &graph, &graph, |next| {
                next.chained_jobs[index].job_id = Some(chained_job_id);
                Ok(())
            })
            .await?;
        Ok(applied(outcome))
    }

    /// Load, transform and conditionally store a job until the write sticks.
    ///
    /// Errors from `change`, including rejected transitions, are returned
    /// as-is.
    pub async fn update<F>(&self, job_id: JobId, change: F) -> Result<Job>
    where
        F: Fn(&mut Job, &Graph) -> Result<()> + Send + Sync,
    {
        let attempts = self.config.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            let job = self
                .jobs
                .get(job_id)
                .await?
                .ok_or(Error::JobNotFound(job_id))?;
            let graph = self.get_graph(&job).await?;

            match self
                .try_write(&job, &graph, &graph, |next| change(next, graph.as_ref()))
                .await?
            {
                WriteOutcome::Applied(next) => return Ok(next),
                WriteOutcome::Rejected(err) => return Err(err),
                WriteOutcome::Conflict => {
                    debug!(job_id = %job_id, attempt, "Job update conflicted, retrying");
                }
            }
        }

        warn!(job_id = %job_id, attempts, "Giving up on job update");
        Err(Error::UpdateConflict { job_id, attempts })
    }

    async fn try_write<F>(
        &self,
        current: &Job,
        old_graph: &Graph,
        new_graph: &Graph,
        change: F,
    ) -> Result<WriteOutcome>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut next = current.clone();
        match change(&mut next) {
            Ok(()) => {}
            Err(err) if err.is_rejection() => {
                debug!(job_id = %current.id, error = %err, "Job change rejected");
                return Ok(WriteOutcome::Rejected(err));
            }
            Err(err) => return Err(err),
        }

        next.update_index = current.update_index + 1;
        if !self.jobs.try_replace(current.update_index, &next).await? {
            debug!(
                job_id = %current.id,
                update_index = current.update_index,
                "Job changed since snapshot was taken"
            );
            return Ok(WriteOutcome::Conflict);
        }

        self.notify_changes(current, old_graph, &next, new_graph);
        Ok(WriteOutcome::Applied(next))
    }

    fn notify_changes(&self, old: &Job, old_graph: &Graph, new: &Job, new_graph: &Graph) {
        let now = Utc::now();

        for batch in &new.batches {
            for step in &batch.steps {
                if !matches!(step.state, JobStepState::Completed | JobStepState::Aborted) {
                    continue;
                }
                let previous = old.step(batch.id, step.id).map(|s| s.state);
                if previous == Some(step.state) {
                    continue;
                }
                let node_name = new_graph
                    .node(batch.node_ref(step))
                    .map(|node| node.name.clone())
                    .unwrap_or_default();
                debug!(
                    job_id = %new.id,
                    batch_id = %batch.id,
                    step_id = %step.id,
                    node = %node_name,
                    outcome = ?step.outcome,
                    "Step finished"
                );
                self.sink.on_job_step_complete(&StepCompletePayload {
                    job_id: new.id,
                    stream_id: new.stream_id.clone(),
                    batch_id: batch.id,
                    step_id: step.id,
                    node_name,
                    state: step.state,
                    outcome: step.outcome,
                    completed_at: step.finish_time.unwrap_or(now),
                });
            }
        }

        let before: HashMap<String, LabelStatus> = old
            .label_states(old_graph)
            .into_iter()
            .map(|status| (status.key.clone(), status))
            .collect();
        for status in new.label_states(new_graph) {
            let (old_state, old_outcome) = before
                .get(&status.key)
                .map(|s| (s.state, s.outcome))
                .unwrap_or((LabelState::Unspecified, LabelOutcome::Unspecified));
            if old_state == status.state && old_outcome == status.outcome {
                continue;
            }
            self.sink.on_label_update(&LabelUpdatePayload {
                job_id: new.id,
                stream_id: new.stream_id.clone(),
                label: status.key,
                old_state,
                old_outcome,
                new_state: status.state,
                new_outcome: status.outcome,
            });
        }
    }
}

fn applied(outcome: WriteOutcome) -> Option<Job> {
    match outcome {
        WriteOutcome::Applied(job) => Some(job),
        WriteOutcome::Conflict | WriteOutcome::Rejected(_) => None,
    }
}
