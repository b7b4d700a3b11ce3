//! Re-running steps: manual retries and recovery from lost agents.

use super::{Job, JobStepBatchError, JobStepBatchState, JobStepError, JobStepOutcome, JobStepState};
use crate::graph::{Graph, NodeRef};
use crate::ids::UserId;
use crate::{Error, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet};

impl Job {
    /// Marks a finished step for retry and queues it, plus everything
    /// downstream that was skipped because of it.
    pub(crate) fn request_retry(
        &mut self,
        batch_idx: usize,
        step_idx: usize,
        user: UserId,
        graph: &Graph,
    ) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::JobCancelled);
        }

        let batch = &self.batches[batch_idx];
        let step = &batch.steps[step_idx];
        let node_ref = batch.node_ref(step);

        let is_latest = self
            .latest_step(node_ref)
            .is_some_and(|(_, latest)| latest.id == step.id);
        if !is_latest || step.retried_by.is_some() {
            return Err(Error::StepSuperseded(step.id));
        }
        let allow_retry = graph.node(node_ref).is_some_and(|node| node.allow_retry);
        if !allow_retry || !step.state.is_terminal() {
            return Err(Error::RetryNotAllowed(step.id));
        }

        self.batches[batch_idx].steps[step_idx].retried_by = Some(user);
        self.expand_retries(graph);
        Ok(())
    }

    /// Creates new steps for every node whose latest step was marked for
    /// retry, and for skipped nodes downstream of them.
    ///
    /// New steps always go into batches created here; batches that already
    /// exist may be in any state.
    pub(crate) fn expand_retries(&mut self, graph: &Graph) {
        let latest = self.latest_step_locations();

        let mut requeue: HashSet<NodeRef> = latest
            .iter()
            .filter(|(_, (b, s))| self.batches[*b].steps[*s].retried_by.is_some())
            .map(|(node_ref, _)| *node_ref)
            .collect();
        if requeue.is_empty() {
            return;
        }

        for (node_ref, node) in graph.nodes() {
            if requeue.contains(&node_ref) {
                continue;
            }
            let Some(&(b, s)) = latest.get(&node_ref) else {
                continue;
            };
            if self.batches[b].steps[s].state == JobStepState::Skipped
                && node.dependencies().any(|(dep, _)| requeue.contains(&dep))
            {
                requeue.insert(node_ref);
            }
        }

        let mut new_batches: HashMap<usize, usize> = HashMap::new();
        for node_ref in graph.node_refs().filter(|node_ref| requeue.contains(node_ref)) {
            let batch_idx = match new_batches.get(&node_ref.group_idx) {
                Some(&batch_idx) => batch_idx,
                None => {
                    let batch_idx = self.push_batch(node_ref.group_idx);
                    new_batches.insert(node_ref.group_idx, batch_idx);
                    batch_idx
                }
            };
            let step = self.new_step(node_ref.node_idx);
            self.insert_step(batch_idx, step);
        }
    }

    /// Completes a batch whose agent went away.
    ///
    /// Steps that were running fail as incomplete and are re-run in a new
    /// batch until they have been lost more than `max_retries` times in a
    /// row. Steps that never started move to the new batch as they are.
    pub(crate) fn fail_batch_incomplete(&mut self, batch_idx: usize, max_retries: u32) {
        let now = Utc::now();
        let group_idx = self.batches[batch_idx].group_idx;

        let batch = &mut self.batches[batch_idx];
        let (mut moved, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut batch.steps)
            .into_iter()
            .partition(|step| step.state.is_pending());
        batch.steps = kept;

        let mut lost = Vec::new();
        for step in batch.steps.iter_mut() {
            if step.state == JobStepState::Running {
                step.state = JobStepState::Completed;
                step.outcome = JobStepOutcome::Failure;
                step.error = Some(JobStepError::Incomplete);
                step.finish_time = Some(now);
                lost.push(step.node_idx);
            }
        }
        batch.state = JobStepBatchState::Complete;
        batch.error = Some(JobStepBatchError::Incomplete);
        batch.finish_time = Some(now);

        for node_idx in lost {
            let attempts = self.consecutive_incomplete_attempts(NodeRef::new(group_idx, node_idx));
            if attempts <= max_retries as usize {
                moved.push(self.new_step(node_idx));
            }
        }
        if moved.is_empty() {
            return;
        }

        for step in moved.iter_mut() {
            step.state = JobStepState::Waiting;
        }
        moved.sort_by_key(|step| step.node_idx);
        let new_idx = self.push_batch(group_idx);
        self.batches[new_idx].steps = moved;
    }

    /// Number of most recent attempts at a node that were lost along with
    /// their agent, without a finished run or a manual retry in between.
    pub(crate) fn consecutive_incomplete_attempts(&self, node_ref: NodeRef) -> usize {
        self.steps_for_node(node_ref)
            .into_iter()
            .rev()
            .take_while(|(_, step)| {
                step.error == Some(JobStepError::Incomplete) && step.retried_by.is_none()
            })
            .count()
    }
}
