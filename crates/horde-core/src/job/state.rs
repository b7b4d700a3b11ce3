//! Derivation of step and batch states from the dependency graph.

use super::{Job, JobStepBatchError, JobStepBatchState, JobStepError, JobStepOutcome, JobStepState};
use crate::graph::{DependencyKind, Graph, Node, NodeRef};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// What a pending step's dependencies allow it to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Waiting,
    Skipped(JobStepOutcome),
}

impl Job {
    /// Re-derives step states, batch states and the label completion latch.
    ///
    /// Every mutation of a job ends here.
    pub(crate) fn refresh(&mut self, graph: &Graph) {
        let now = Utc::now();
        self.update_step_states(graph, now);
        self.update_batch_states(graph, now);
        self.latch_completed_labels(graph);
        self.updated_at = now;
    }

    fn update_step_states(&mut self, graph: &Graph, now: DateTime<Utc>) {
        let latest = self.latest_step_locations();

        // Graph order is topological, so a single pass sees every upstream
        // change before its dependents are evaluated.
        for (node_ref, node) in graph.nodes() {
            let Some(&(batch_idx, step_idx)) = latest.get(&node_ref) else {
                continue;
            };
            if !self.batches[batch_idx].steps[step_idx].state.is_pending() {
                continue;
            }

            let readiness = self.evaluate_dependencies(node, &latest);
            let step = &mut self.batches[batch_idx].steps[step_idx];
            let paused = step.error == Some(JobStepError::Paused);
            match readiness {
                Readiness::Skipped(outcome) => {
                    step.state = JobStepState::Skipped;
                    step.outcome = outcome;
                    step.finish_time = Some(now);
                }
                Readiness::Ready if !paused => step.state = JobStepState::Ready,
                _ => step.state = JobStepState::Waiting,
            }
        }
    }

    fn evaluate_dependencies(
        &self,
        node: &Node,
        latest: &HashMap<NodeRef, (usize, usize)>,
    ) -> Readiness {
        let mut blocked = false;
        let mut skip: Option<JobStepOutcome> = None;

        for (dep_ref, kind) in node.dependencies() {
            // Dependencies outside the job's node set impose nothing.
            let Some(&(batch_idx, step_idx)) = latest.get(&dep_ref) else {
                continue;
            };
            let dep = &self.batches[batch_idx].steps[step_idx];
            match (dep.state, kind) {
                (JobStepState::Completed, DependencyKind::Input)
                    if dep.outcome == JobStepOutcome::Failure =>
                {
                    merge_skip(&mut skip, JobStepOutcome::Failure)
                }
                (JobStepState::Completed, _) => {}
                (JobStepState::Skipped, _) => {
                    let inherited = if dep.outcome == JobStepOutcome::Failure {
                        JobStepOutcome::Failure
                    } else {
                        JobStepOutcome::Unspecified
                    };
                    merge_skip(&mut skip, inherited)
                }
                (JobStepState::Aborted, DependencyKind::Input) => {
                    merge_skip(&mut skip, JobStepOutcome::Unspecified)
                }
                (JobStepState::Aborted, DependencyKind::Order) => {}
                _ => blocked = true,
            }
        }

        match skip {
            Some(outcome) => Readiness::Skipped(outcome),
            None if blocked => Readiness::Waiting,
            None => Readiness::Ready,
        }
    }

    fn update_batch_states(&mut self, graph: &Graph, now: DateTime<Utc>) {
        let latest = self.latest_step_locations();

        let changes: Vec<(usize, JobStepBatchState)> = self
            .batches
            .iter()
            .enumerate()
            .filter(|(_, batch)| batch.state.is_unclaimed())
            .filter_map(|(batch_idx, batch)| {
                let next = if batch.steps.iter().all(|step| step.state.is_terminal()) {
                    JobStepBatchState::Complete
                } else if self.is_batch_ready(batch_idx, graph, &latest) {
                    JobStepBatchState::Ready
                } else {
                    JobStepBatchState::Waiting
                };
                (next != batch.state).then_some((batch_idx, next))
            })
            .collect();

        for (batch_idx, state) in changes {
            let batch = &mut self.batches[batch_idx];
            batch.state = state;
            match state {
                JobStepBatchState::Complete => {
                    batch.error = Some(JobStepBatchError::NoLongerNeeded);
                    batch.finish_time = Some(now);
                }
                JobStepBatchState::Ready => batch.ready_time = Some(now),
                _ => batch.ready_time = None,
            }
        }
    }

    /// An unclaimed batch can be handed to an agent once nothing outside the
    /// batch holds up its pending steps, or once a run-early step can start.
    fn is_batch_ready(
        &self,
        batch_idx: usize,
        graph: &Graph,
        latest: &HashMap<NodeRef, (usize, usize)>,
    ) -> bool {
        let batch = &self.batches[batch_idx];
        let mut unblocked = true;

        for step in batch.steps.iter().filter(|step| step.state.is_pending()) {
            let Some(node) = graph.node(batch.node_ref(step)) else {
                continue;
            };
            if node.run_early && step.state == JobStepState::Ready {
                return true;
            }
            if step.error == Some(JobStepError::Paused) {
                unblocked = false;
            }
            for (dep_ref, _) in node.dependencies() {
                if let Some(&(dep_batch_idx, dep_step_idx)) = latest.get(&dep_ref)
                    && dep_batch_idx != batch_idx
                    && !self.batches[dep_batch_idx].steps[dep_step_idx]
                        .state
                        .is_terminal()
                {
                    unblocked = false;
                }
            }
        }
        unblocked
    }
}

fn merge_skip(skip: &mut Option<JobStepOutcome>, outcome: JobStepOutcome) {
    *skip = Some(match *skip {
        Some(JobStepOutcome::Failure) => JobStepOutcome::Failure,
        _ => outcome,
    });
}
