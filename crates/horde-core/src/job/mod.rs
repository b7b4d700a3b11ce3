//! Job, batch and step types.
//!
//! A job executes one graph. Its batches mirror the graph's groups as they are
//! actually scheduled: the batch list only ever grows, as retries, lost agents
//! and graph extensions add new batches.

mod retry;
mod state;
mod transitions;
mod update;

pub use transitions::{LeaseAssignment, StepUpdate};

use crate::graph::{Graph, NodeRef};
use crate::ids::*;
use crate::label::LabelOutcome;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Number of times a step may be re-run automatically after its agent failed to finish it.
pub const DEFAULT_MAX_INCOMPLETE_RETRIES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Critical = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStepState {
    Waiting,
    Ready,
    Running,
    Completed,
    Skipped,
    Aborted,
}

impl JobStepState {
    /// Not yet started.
    pub fn is_pending(&self) -> bool {
        matches!(self, JobStepState::Waiting | JobStepState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStepState::Completed | JobStepState::Skipped | JobStepState::Aborted
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStepOutcome {
    #[default]
    Unspecified,
    Success,
    Warnings,
    Failure,
}

impl JobStepOutcome {
    fn severity(self) -> u8 {
        match self {
            JobStepOutcome::Unspecified => 0,
            JobStepOutcome::Success => 1,
            JobStepOutcome::Warnings => 2,
            JobStepOutcome::Failure => 3,
        }
    }

    /// The more severe of two outcomes.
    pub fn worst(self, other: JobStepOutcome) -> JobStepOutcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStepError {
    /// The agent executing the step went away before it finished.
    Incomplete,
    /// Held by a user; the step will not become ready until resumed.
    Paused,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStepBatchState {
    Waiting,
    Ready,
    Starting,
    Running,
    Complete,
}

impl JobStepBatchState {
    /// No agent has claimed the batch yet.
    pub fn is_unclaimed(&self) -> bool {
        matches!(self, JobStepBatchState::Waiting | JobStepBatchState::Ready)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStepBatchError {
    Incomplete,
    Cancelled,
    NoLongerNeeded,
    UnknownAgentType,
    UnknownPool,
    NoAgentsInPool,
    UnknownShelf,
    ExecutionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStep {
    pub id: StepId,
    pub node_idx: usize,
    pub state: JobStepState,
    pub outcome: JobStepOutcome,
    pub error: Option<JobStepError>,
    pub retried_by: Option<UserId>,
    #[serde(default)]
    pub abort_requested: bool,
    pub aborted_by: Option<UserId>,
    pub log_id: Option<LogId>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl JobStep {
    pub(crate) fn new(id: StepId, node_idx: usize) -> Self {
        Self {
            id,
            node_idx,
            state: JobStepState::Waiting,
            outcome: JobStepOutcome::Unspecified,
            error: None,
            retried_by: None,
            abort_requested: false,
            aborted_by: None,
            log_id: None,
            start_time: None,
            finish_time: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStepBatch {
    pub id: BatchId,
    pub group_idx: usize,
    pub state: JobStepBatchState,
    pub error: Option<JobStepBatchError>,
    pub pool_id: Option<PoolId>,
    pub agent_id: Option<AgentId>,
    pub session_id: Option<SessionId>,
    pub lease_id: Option<LeaseId>,
    pub ready_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub steps: Vec<JobStep>,
}

impl JobStepBatch {
    pub(crate) fn new(id: BatchId, group_idx: usize) -> Self {
        Self {
            id,
            group_idx,
            state: JobStepBatchState::Waiting,
            error: None,
            pool_id: None,
            agent_id: None,
            session_id: None,
            lease_id: None,
            ready_time: None,
            start_time: None,
            finish_time: None,
            steps: Vec::new(),
        }
    }

    pub fn step(&self, step_id: StepId) -> Option<&JobStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    pub fn node_ref(&self, step: &JobStep) -> NodeRef {
        NodeRef::new(self.group_idx, step.node_idx)
    }
}

/// Trigger id registered against a label, fired once when the label completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelTrigger {
    pub label: String,
    pub trigger_id: TriggerId,
}

/// Job to start once a label (or node) of this job completes successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainedJobTemplate {
    /// Label key or node name.
    pub trigger: String,
    pub template_id: TemplateId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainedJob {
    pub trigger: String,
    pub template_id: TemplateId,
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Running,
    Complete,
}

/// Everything needed to create a job, apart from the graph itself.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    /// Id to create the job under; a fresh one is allocated when unset.
    pub id: Option<JobId>,
    pub stream_id: StreamId,
    pub template_id: TemplateId,
    pub template_hash: Option<ContentHash>,
    pub name: String,
    pub change: u32,
    pub code_change: u32,
    pub preflight_change: Option<u32>,
    pub arguments: Vec<String>,
    pub started_by_user: Option<UserId>,
    pub priority: Priority,
    /// Node names or label keys to run. Empty runs the whole graph.
    pub targets: Vec<String>,
    pub chained_jobs: Vec<ChainedJobTemplate>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub stream_id: StreamId,
    pub template_id: TemplateId,
    pub template_hash: Option<ContentHash>,
    pub graph_hash: ContentHash,
    pub name: String,
    pub change: u32,
    pub code_change: u32,
    pub preflight_change: Option<u32>,
    pub arguments: Vec<String>,
    pub started_by_user: Option<UserId>,
    pub priority: Priority,
    #[serde(default)]
    pub tags: Vec<String>,
    pub batches: Vec<JobStepBatch>,
    pub label_triggers: Vec<LabelTrigger>,
    pub chained_jobs: Vec<ChainedJob>,
    /// Labels that have reached completion at least once, with the outcome
    /// they last completed with.
    pub completed_labels: BTreeMap<String, LabelOutcome>,
    pub cancelled_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Version for optimistic concurrency; bumped on every persisted change.
    pub update_index: u64,
    next_sub_resource_id: u16,
}

impl Job {
    /// Creates a job and its initial batches for the requested targets.
    pub fn new(request: NewJob, graph: &Graph) -> Result<Self> {
        let selected = select_nodes(graph, &request.targets)?;
        let now = Utc::now();

        let mut job = Job {
            id: request.id.unwrap_or_else(JobId::new),
            stream_id: request.stream_id,
            template_id: request.template_id,
            template_hash: request.template_hash,
            graph_hash: graph.hash.clone(),
            name: request.name,
            change: request.change,
            code_change: request.code_change,
            preflight_change: request.preflight_change,
            arguments: request.arguments,
            started_by_user: request.started_by_user,
            priority: request.priority,
            tags: request.tags,
            batches: Vec::new(),
            label_triggers: Vec::new(),
            chained_jobs: request
                .chained_jobs
                .into_iter()
                .map(|chained| ChainedJob {
                    trigger: chained.trigger,
                    template_id: chained.template_id,
                    job_id: None,
                })
                .collect(),
            completed_labels: BTreeMap::new(),
            cancelled_by: None,
            created_at: now,
            updated_at: now,
            update_index: 0,
            next_sub_resource_id: 1,
        };

        for node_ref in graph.node_refs().filter(|node_ref| selected.contains(node_ref)) {
            job.place_step(node_ref);
        }
        job.refresh(graph);
        Ok(job)
    }

    pub fn batch(&self, batch_id: BatchId) -> Option<&JobStepBatch> {
        self.batches.iter().find(|batch| batch.id == batch_id)
    }

    pub fn step(&self, batch_id: BatchId, step_id: StepId) -> Option<&JobStep> {
        self.batch(batch_id).and_then(|batch| batch.step(step_id))
    }

    /// All attempts at a node, oldest first.
    pub fn steps_for_node(&self, node_ref: NodeRef) -> Vec<(&JobStepBatch, &JobStep)> {
        self.batches
            .iter()
            .filter(|batch| batch.group_idx == node_ref.group_idx)
            .flat_map(|batch| {
                batch
                    .steps
                    .iter()
                    .filter(move |step| step.node_idx == node_ref.node_idx)
                    .map(move |step| (batch, step))
            })
            .collect()
    }

    /// The most recent attempt at a node.
    pub fn latest_step(&self, node_ref: NodeRef) -> Option<(&JobStepBatch, &JobStep)> {
        self.steps_for_node(node_ref).pop()
    }

    /// Latest step for every node in the job, keyed by node.
    pub fn steps_by_node(&self) -> HashMap<NodeRef, (&JobStepBatch, &JobStep)> {
        self.latest_step_locations()
            .into_iter()
            .map(|(node_ref, (b, s))| (node_ref, (&self.batches[b], &self.batches[b].steps[s])))
            .collect()
    }

    /// The next step an agent running this batch should execute, if it can start now.
    pub fn next_step(&self, batch_id: BatchId) -> Option<StepId> {
        let batch = self.batch(batch_id)?;
        if batch.state != JobStepBatchState::Running {
            return None;
        }
        batch
            .steps
            .iter()
            .find(|step| !step.state.is_terminal())
            .filter(|step| step.state == JobStepState::Ready && !step.abort_requested)
            .map(|step| step.id)
    }

    pub fn state(&self) -> JobState {
        if self
            .batches
            .iter()
            .all(|batch| batch.state == JobStepBatchState::Complete)
        {
            JobState::Complete
        } else if self.batches.iter().any(|batch| {
            matches!(
                batch.state,
                JobStepBatchState::Starting | JobStepBatchState::Running
            ) || batch.steps.iter().any(|step| step.state.is_terminal())
        }) {
            JobState::Running
        } else {
            JobState::Waiting
        }
    }

    /// Worst outcome over the latest attempt of every node.
    pub fn outcome(&self) -> JobStepOutcome {
        self.steps_by_node()
            .values()
            .map(|(_, step)| step.outcome)
            .fold(JobStepOutcome::Unspecified, JobStepOutcome::worst)
    }

    pub(crate) fn batch_index(&self, batch_id: BatchId) -> Result<usize> {
        self.batches
            .iter()
            .position(|batch| batch.id == batch_id)
            .ok_or(Error::BatchNotFound(batch_id))
    }

    pub(crate) fn step_index(&self, batch_id: BatchId, step_id: StepId) -> Result<(usize, usize)> {
        let batch_idx = self.batch_index(batch_id)?;
        let step_idx = self.batches[batch_idx]
            .steps
            .iter()
            .position(|step| step.id == step_id)
            .ok_or(Error::StepNotFound { batch_id, step_id })?;
        Ok((batch_idx, step_idx))
    }

    /// Maps each node to the (batch, step) indices of its latest attempt.
    pub(crate) fn latest_step_locations(&self) -> HashMap<NodeRef, (usize, usize)> {
        let mut latest = HashMap::new();
        for (batch_idx, batch) in self.batches.iter().enumerate() {
            for (step_idx, step) in batch.steps.iter().enumerate() {
                latest.insert(batch.node_ref(step), (batch_idx, step_idx));
            }
        }
        latest
    }

    fn allocate_id(&mut self) -> u16 {
        let id = self.next_sub_resource_id;
        self.next_sub_resource_id = self.next_sub_resource_id.wrapping_add(1).max(1);
        id
    }

    pub(crate) fn new_step(&mut self, node_idx: usize) -> JobStep {
        let id = StepId::new(self.allocate_id());
        JobStep::new(id, node_idx)
    }

    /// Appends an empty batch for a group and returns its index.
    pub(crate) fn push_batch(&mut self, group_idx: usize) -> usize {
        let id = BatchId::new(self.allocate_id());
        self.batches.push(JobStepBatch::new(id, group_idx));
        self.batches.len() - 1
    }

    /// Inserts a step into a batch, keeping steps in node order.
    pub(crate) fn insert_step(&mut self, batch_idx: usize, step: JobStep) {
        let steps = &mut self.batches[batch_idx].steps;
        let position = steps
            .iter()
            .position(|existing| existing.node_idx > step.node_idx)
            .unwrap_or(steps.len());
        steps.insert(position, step);
    }

    /// Adds a fresh step for a node, reusing an unclaimed batch of its group when possible.
    pub(crate) fn place_step(&mut self, node_ref: NodeRef) {
        let existing = self.batches.iter().rposition(|batch| {
            batch.group_idx == node_ref.group_idx
                && batch.state.is_unclaimed()
                && !batch.steps.iter().any(|step| step.node_idx == node_ref.node_idx)
        });
        let batch_idx = match existing {
            Some(batch_idx) => batch_idx,
            None => self.push_batch(node_ref.group_idx),
        };
        let step = self.new_step(node_ref.node_idx);
        self.insert_step(batch_idx, step);
    }
}

/// Resolves target names to the set of nodes to run, including their input dependencies.
fn select_nodes(graph: &Graph, targets: &[String]) -> Result<HashSet<NodeRef>> {
    if targets.is_empty() {
        return Ok(graph.node_refs().collect());
    }

    let mut pending = Vec::new();
    for target in targets {
        if let Some(node_ref) = graph.find_node(target) {
            pending.push(node_ref);
        } else if let Some(label_idx) = graph.find_label(target) {
            pending.extend(graph.labels[label_idx].required_nodes.iter().copied());
        } else {
            return Err(Error::UnknownNode(target.clone()));
        }
    }

    let mut selected = HashSet::new();
    while let Some(node_ref) = pending.pop() {
        if selected.insert(node_ref)
            && let Some(node) = graph.node(node_ref)
        {
            pending.extend(node.input_dependencies.iter().copied());
        }
    }
    Ok(selected)
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::graph::{Graph, Node, NodeGroup, NodeRef};
    use std::collections::BTreeMap;

    pub fn node(name: &str, inputs: &[(usize, usize)], order: &[(usize, usize)]) -> Node {
        Node {
            name: name.to_string(),
            input_dependencies: inputs.iter().map(|(g, n)| NodeRef::new(*g, *n)).collect(),
            order_dependencies: order.iter().map(|(g, n)| NodeRef::new(*g, *n)).collect(),
            inputs: vec![],
            outputs: vec![],
            run_early: false,
            allow_retry: true,
            annotations: BTreeMap::new(),
        }
    }

    pub fn group(agent_type: &str, nodes: Vec<Node>) -> NodeGroup {
        NodeGroup {
            agent_type: agent_type.to_string(),
            nodes,
        }
    }

    /// [Step1], [Step2 <- Step1, Step3 <- Step2]
    pub fn chain_graph() -> Graph {
        Graph::from_parts(
            vec![
                group("Win64", vec![node("Step1", &[], &[])]),
                group(
                    "Win64",
                    vec![node("Step2", &[(0, 0)], &[]), node("Step3", &[(1, 0)], &[])],
                ),
            ],
            vec![],
            vec![],
        )
    }
}
