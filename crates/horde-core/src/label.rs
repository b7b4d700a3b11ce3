//! Label status derived from the steps of a job.

use crate::graph::{Graph, Label, NodeRef};
use crate::job::{Job, JobStep, JobStepBatch, JobStepOutcome};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelState {
    /// None of the label's nodes are part of the job.
    #[default]
    Unspecified,
    Running,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelOutcome {
    #[default]
    Unspecified,
    Success,
    Warnings,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelStatus {
    pub key: String,
    pub state: LabelState,
    pub outcome: LabelOutcome,
}

impl Job {
    /// Status of every label in the graph, in graph order.
    pub fn label_states(&self, graph: &Graph) -> Vec<LabelStatus> {
        let latest = self.steps_by_node();
        graph
            .labels
            .iter()
            .map(|label| {
                let key = label.key();
                let computed = compute_label(label, &latest);
                let (state, outcome) = match (computed, self.completed_labels.get(&key)) {
                    // A retried label reports its last completion until it settles again.
                    ((LabelState::Running, _), Some(&latched)) => (LabelState::Complete, latched),
                    (computed, _) => computed,
                };
                LabelStatus {
                    key,
                    state,
                    outcome,
                }
            })
            .collect()
    }

    pub fn label_state(&self, graph: &Graph, key: &str) -> Option<LabelStatus> {
        self.label_states(graph)
            .into_iter()
            .find(|status| status.key == key)
    }

    /// Whether every required node of a label has a finished latest step.
    ///
    /// Unlike [`Job::label_states`] this ignores the completion latch, so it is
    /// false while a retry of a completed label is pending.
    pub fn label_settled(&self, graph: &Graph, key: &str) -> bool {
        let Some(label) = graph.labels.iter().find(|label| label.key() == key) else {
            return false;
        };
        let latest = self.steps_by_node();
        compute_label(label, &latest).0 == LabelState::Complete
    }

    /// Records labels that have completed so later retries cannot reopen them.
    pub(crate) fn latch_completed_labels(&mut self, graph: &Graph) {
        let latest = self.steps_by_node();
        let settled: Vec<(String, LabelOutcome)> = graph
            .labels
            .iter()
            .filter_map(|label| match compute_label(label, &latest) {
                (LabelState::Complete, outcome) => Some((label.key(), outcome)),
                _ => None,
            })
            .collect();
        self.completed_labels.extend(settled);
    }
}

fn compute_label(
    label: &Label,
    latest: &HashMap<NodeRef, (&JobStepBatch, &JobStep)>,
) -> (LabelState, LabelOutcome) {
    let included = if label.included_nodes.is_empty() {
        &label.required_nodes
    } else {
        &label.included_nodes
    };

    let required: Vec<&JobStep> = label
        .required_nodes
        .iter()
        .filter_map(|node_ref| latest.get(node_ref).map(|(_, step)| *step))
        .collect();
    let included: Vec<&JobStep> = included
        .iter()
        .filter_map(|node_ref| latest.get(node_ref).map(|(_, step)| *step))
        .collect();

    if required.is_empty() && included.is_empty() {
        return (LabelState::Unspecified, LabelOutcome::Unspecified);
    }

    let state = if required.iter().any(|step| !step.state.is_terminal()) {
        LabelState::Running
    } else {
        LabelState::Complete
    };

    let worst = included
        .iter()
        .map(|step| step.outcome)
        .fold(JobStepOutcome::Unspecified, JobStepOutcome::worst);
    let outcome = match worst {
        JobStepOutcome::Failure => LabelOutcome::Failure,
        JobStepOutcome::Warnings => LabelOutcome::Warnings,
        _ => LabelOutcome::Success,
    };

    (state, outcome)
}
