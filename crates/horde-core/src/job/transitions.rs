//! Externally requested changes to batches and steps.

use super::{
    Job, JobStepBatchError, JobStepBatchState, JobStepError, JobStepOutcome, JobStepState,
};
use crate::graph::Graph;
use crate::ids::*;
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Agent claim on a ready batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseAssignment {
    pub pool_id: Option<PoolId>,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub lease_id: LeaseId,
}

impl LeaseAssignment {
    pub fn new(agent_id: AgentId) -> Self {
        Self {
            pool_id: None,
            agent_id,
            session_id: SessionId::new(),
            lease_id: LeaseId::new(),
        }
    }

    pub fn with_pool(mut self, pool_id: PoolId) -> Self {
        self.pool_id = Some(pool_id);
        self
    }
}

/// Changes reported for a single step. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepUpdate {
    pub state: Option<JobStepState>,
    pub outcome: Option<JobStepOutcome>,
    pub error: Option<JobStepError>,
    pub log_id: Option<LogId>,
    pub retry_by: Option<UserId>,
    pub abort_by: Option<UserId>,
    pub paused: Option<bool>,
}

impl StepUpdate {
    pub fn running() -> Self {
        Self {
            state: Some(JobStepState::Running),
            ..Default::default()
        }
    }

    pub fn completed(outcome: JobStepOutcome) -> Self {
        Self {
            state: Some(JobStepState::Completed),
            outcome: Some(outcome),
            ..Default::default()
        }
    }

    pub fn retry(user: UserId) -> Self {
        Self {
            retry_by: Some(user),
            ..Default::default()
        }
    }

    pub fn abort(user: UserId) -> Self {
        Self {
            abort_by: Some(user),
            ..Default::default()
        }
    }

    pub fn with_state(mut self, state: JobStepState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_error(mut self, error: JobStepError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_log(mut self, log_id: LogId) -> Self {
        self.log_id = Some(log_id);
        self
    }

    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = Some(paused);
        self
    }
}

impl Job {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled_by.is_some()
    }

    /// Hands a ready batch to an agent.
    pub fn assign_lease(
        &mut self,
        batch_id: BatchId,
        lease: LeaseAssignment,
        graph: &Graph,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::JobCancelled);
        }
        let batch_idx = self.batch_index(batch_id)?;
        let batch = &mut self.batches[batch_idx];
        if batch.state != JobStepBatchState::Ready {
            return Err(Error::InvalidBatchTransition {
                batch_id,
                from: batch.state,
                to: JobStepBatchState::Starting,
            });
        }

        batch.state = JobStepBatchState::Starting;
        batch.pool_id = lease.pool_id;
        batch.agent_id = Some(lease.agent_id);
        batch.session_id = Some(lease.session_id);
        batch.lease_id = Some(lease.lease_id);
        self.refresh(graph);
        Ok(())
    }

    /// Applies a batch state report, or fails the batch with an error.
    ///
    /// A batch that finishes while steps are still outstanding is treated as
    /// incomplete.
    pub fn update_batch(
        &mut self,
        batch_id: BatchId,
        state: Option<JobStepBatchState>,
        error: Option<JobStepBatchError>,
        graph: &Graph,
        max_incomplete_retries: u32,
    ) -> Result<()> {
        let batch_idx = self.batch_index(batch_id)?;
        let current = self.batches[batch_idx].state;
        let invalid = |to| Error::InvalidBatchTransition {
            batch_id,
            from: current,
            to,
        };

        if current == JobStepBatchState::Complete {
            return Err(invalid(state.unwrap_or(JobStepBatchState::Complete)));
        }

        let error = match (state, error) {
            (None, None) => return Ok(()),
            (Some(JobStepBatchState::Running), None) if current == JobStepBatchState::Starting => {
                let batch = &mut self.batches[batch_idx];
                batch.state = JobStepBatchState::Running;
                batch.start_time = Some(Utc::now());
                self.refresh(graph);
                return Ok(());
            }
            (Some(JobStepBatchState::Complete), None) => {
                if current != JobStepBatchState::Running {
                    return Err(invalid(JobStepBatchState::Complete));
                }
                let unfinished = self.batches[batch_idx]
                    .steps
                    .iter()
                    .any(|step| !step.state.is_terminal());
                if !unfinished {
                    let batch = &mut self.batches[batch_idx];
                    batch.state = JobStepBatchState::Complete;
                    batch.finish_time = Some(Utc::now());
                    self.refresh(graph);
                    return Ok(());
                }
                JobStepBatchError::Incomplete
            }
            (None | Some(JobStepBatchState::Complete), Some(error)) => error,
            (Some(to), _) => return Err(invalid(to)),
        };

        self.fail_batch(batch_idx, error, max_incomplete_retries);
        self.refresh(graph);
        Ok(())
    }

    fn fail_batch(&mut self, batch_idx: usize, error: JobStepBatchError, max_incomplete_retries: u32) {
        if error == JobStepBatchError::Incomplete {
            self.fail_batch_incomplete(batch_idx, max_incomplete_retries);
            return;
        }

        let now = Utc::now();
        let batch = &mut self.batches[batch_idx];
        for step in batch.steps.iter_mut() {
            match (step.state, error) {
                (state, JobStepBatchError::Cancelled) if !state.is_terminal() => {
                    step.state = JobStepState::Aborted;
                    step.finish_time = Some(now);
                }
                (JobStepState::Running, _) => {
                    step.state = JobStepState::Completed;
                    step.outcome = JobStepOutcome::Failure;
                    step.finish_time = Some(now);
                }
                (JobStepState::Waiting | JobStepState::Ready, JobStepBatchError::NoLongerNeeded) => {
                    step.state = JobStepState::Skipped;
                    step.finish_time = Some(now);
                }
                (JobStepState::Waiting | JobStepState::Ready, _) => {
                    step.state = JobStepState::Skipped;
                    step.outcome = JobStepOutcome::Failure;
                    step.finish_time = Some(now);
                }
                _ => {}
            }
        }
        batch.state = JobStepBatchState::Complete;
        batch.error = Some(error);
        batch.finish_time = Some(now);
    }

    /// Applies an agent or user report to one step.
    pub fn update_step(
        &mut self,
        batch_id: BatchId,
        step_id: StepId,
        update: StepUpdate,
        graph: &Graph,
    ) -> Result<()> {
        let (batch_idx, step_idx) = self.step_index(batch_id, step_id)?;

        if let Some(state) = update.state {
            self.transition_step(batch_idx, step_idx, state, &update)?;
        } else if let Some(error) = update.error {
            self.batches[batch_idx].steps[step_idx].error = Some(error);
        }
        if let Some(log_id) = update.log_id {
            self.batches[batch_idx].steps[step_idx].log_id = Some(log_id);
        }
        if let Some(user) = update.abort_by {
            self.abort_step(batch_idx, step_idx, user)?;
        }
        if let Some(paused) = update.paused {
            self.pause_step(batch_idx, step_idx, paused)?;
        }
        if let Some(user) = update.retry_by {
            self.request_retry(batch_idx, step_idx, user, graph)?;
        }

        self.refresh(graph);
        Ok(())
    }

    fn transition_step(
        &mut self,
        batch_idx: usize,
        step_idx: usize,
        to: JobStepState,
        update: &StepUpdate,
    ) -> Result<()> {
        let batch_running = self.batches[batch_idx].state == JobStepBatchState::Running;
        let step = &mut self.batches[batch_idx].steps[step_idx];
        let from = step.state;
        let now = Utc::now();

        match (from, to) {
            (JobStepState::Ready, JobStepState::Running) if batch_running => {
                step.start_time = Some(now);
            }
            (JobStepState::Running, JobStepState::Completed) => {
                let outcome = update.outcome.unwrap_or_default();
                if outcome == JobStepOutcome::Unspecified {
                    return Err(Error::MissingOutcome(step.id));
                }
                step.outcome = outcome;
                step.finish_time = Some(now);
            }
            (JobStepState::Running, JobStepState::Aborted) => {
                step.outcome = update.outcome.unwrap_or_default();
                step.finish_time = Some(now);
            }
            (JobStepState::Waiting | JobStepState::Ready, JobStepState::Aborted)
            | (JobStepState::Waiting | JobStepState::Ready, JobStepState::Skipped) => {
                step.outcome = JobStepOutcome::Unspecified;
                step.finish_time = Some(now);
            }
            _ => {
                return Err(Error::InvalidStepTransition {
                    step_id: step.id,
                    from,
                    to,
                });
            }
        }

        step.state = to;
        if let Some(error) = update.error {
            step.error = Some(error);
        }
        Ok(())
    }

    fn abort_step(&mut self, batch_idx: usize, step_idx: usize, user: UserId) -> Result<()> {
        let step = &mut self.batches[batch_idx].steps[step_idx];
        match step.state {
            JobStepState::Waiting | JobStepState::Ready => {
                step.state = JobStepState::Aborted;
                step.outcome = JobStepOutcome::Unspecified;
                step.finish_time = Some(Utc::now());
            }
            JobStepState::Running => step.abort_requested = true,
            // An abort that raced with the step finishing is not an error.
            JobStepState::Aborted => {}
            from => {
                return Err(Error::InvalidStepTransition {
                    step_id: step.id,
                    from,
                    to: JobStepState::Aborted,
                });
            }
        }
        step.aborted_by.get_or_insert(user);
        Ok(())
    }

    fn pause_step(&mut self, batch_idx: usize, step_idx: usize, paused: bool) -> Result<()> {
        let step = &mut self.batches[batch_idx].steps[step_idx];
        if !step.state.is_pending() {
            return Err(Error::InvalidStepTransition {
                step_id: step.id,
                from: step.state,
                to: JobStepState::Waiting,
            });
        }
        if paused {
            step.error = Some(JobStepError::Paused);
        } else if step.error == Some(JobStepError::Paused) {
            step.error = None;
        }
        Ok(())
    }

    /// Cancels the whole job.
    ///
    /// Steps that have not started are aborted and batches no agent is
    /// running yet are completed. Running steps are asked to abort.
    pub fn cancel(&mut self, user: UserId, graph: &Graph) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::JobCancelled);
        }

        let now = Utc::now();
        for batch in self.batches.iter_mut() {
            for step in batch.steps.iter_mut() {
                match step.state {
                    JobStepState::Waiting | JobStepState::Ready => {
                        step.state = JobStepState::Aborted;
                        step.outcome = JobStepOutcome::Unspecified;
                        step.aborted_by = Some(user.clone());
                        step.finish_time = Some(now);
                    }
                    JobStepState::Running => {
                        step.abort_requested = true;
                        step.aborted_by = Some(user.clone());
                    }
                    _ => {}
                }
            }
            if batch.state.is_unclaimed() || batch.state == JobStepBatchState::Starting {
                batch.state = JobStepBatchState::Complete;
                batch.error = Some(JobStepBatchError::Cancelled);
                batch.finish_time = Some(now);
            }
        }

        self.cancelled_by = Some(user);
        self.refresh(graph);
        Ok(())
    }
}
