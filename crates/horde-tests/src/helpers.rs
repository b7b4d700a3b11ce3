//! Helpers for driving jobs the way agents and users do.

use crate::context::TestContext;
use anyhow::Context;
use horde_core::events::{JobScheduledPayload, LabelUpdatePayload, StepCompletePayload};
use horde_core::graph::Graph;
use horde_core::ids::*;
use horde_core::job::{
    Job, JobStep, JobStepBatchState, JobStepOutcome, JobStepState, LeaseAssignment, NewJob,
    StepUpdate,
};
use horde_core::ports::NotificationSink;
use horde_scheduler::{GraphBuilder, NewGroup, NewLabel};
use std::sync::Mutex;

/// Notification sink that keeps everything it is sent.
#[derive(Default)]
pub struct RecordingSink {
    steps: Mutex<Vec<StepCompletePayload>>,
    scheduled: Mutex<Vec<JobScheduledPayload>>,
    labels: Mutex<Vec<LabelUpdatePayload>>,
}

impl RecordingSink {
    pub fn completed_steps(&self) -> Vec<StepCompletePayload> {
        self.steps.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn scheduled(&self) -> Vec<JobScheduledPayload> {
        self.scheduled.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn label_updates(&self) -> Vec<LabelUpdatePayload> {
        self.labels.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl NotificationSink for RecordingSink {
    fn on_job_step_complete(&self, event: &StepCompletePayload) {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push(event.clone());
        }
    }

    fn on_job_scheduled(&self, event: &JobScheduledPayload) {
        if let Ok(mut scheduled) = self.scheduled.lock() {
            scheduled.push(event.clone());
        }
    }

    fn on_label_update(&self, event: &LabelUpdatePayload) {
        if let Ok(mut labels) = self.labels.lock() {
            labels.push(event.clone());
        }
    }
}

/// Create a job running a freshly built graph.
pub async fn create_job(
    ctx: &TestContext,
    groups: Vec<NewGroup>,
    labels: Vec<NewLabel>,
) -> anyhow::Result<Job> {
    let graph = GraphBuilder::new().build(groups, labels, vec![])?;
    let job = ctx
        .collection
        .create_job(
            NewJob {
                stream_id: ctx.stream_id(),
                template_id: TemplateId::new("test"),
                name: "Test Job".to_string(),
                change: crate::context::LATEST_CHANGE,
                code_change: crate::context::LATEST_CHANGE,
                ..Default::default()
            },
            graph,
        )
        .await?;
    Ok(job)
}

pub async fn reload(ctx: &TestContext, job_id: JobId) -> anyhow::Result<Job> {
    ctx.collection
        .get(job_id)
        .await?
        .with_context(|| format!("job {job_id} not found"))
}

/// The latest step for a node, with the batch it belongs to.
pub fn latest_step<'a>(job: &'a Job, graph: &Graph, name: &str) -> Option<(BatchId, &'a JobStep)> {
    let node_ref = graph.find_node(name)?;
    job.latest_step(node_ref).map(|(batch, step)| (batch.id, step))
}

/// State and outcome of the latest step for a node.
pub fn step_state(job: &Job, graph: &Graph, name: &str) -> (JobStepState, JobStepOutcome) {
    latest_step(job, graph, name)
        .map(|(_, step)| (step.state, step.outcome))
        .unwrap_or_else(|| panic!("no step for {name}"))
}

/// Node names of a batch's steps, in order.
pub fn batch_nodes(job: &Job, graph: &Graph, batch_idx: usize) -> Vec<String> {
    let batch = &job.batches[batch_idx];
    batch
        .steps
        .iter()
        .filter_map(|step| graph.node(batch.node_ref(step)))
        .map(|node| node.name.clone())
        .collect()
}

/// Lease a ready batch to an agent and mark it running.
pub async fn start_batch(ctx: &TestContext, job_id: JobId, batch_id: BatchId) -> anyhow::Result<Job> {
    let max_retries = ctx.collection.config().max_incomplete_retries;
    ctx.collection
        .update(job_id, |job, graph| {
            job.assign_lease(batch_id, LeaseAssignment::new(AgentId::new("test-agent")), graph)
        })
        .await?;
    let job = ctx
        .collection
        .update(job_id, |job, graph| {
            job.update_batch(batch_id, Some(JobStepBatchState::Running), None, graph, max_retries)
        })
        .await?;
    Ok(job)
}

/// Run one step of a running batch to completion.
pub async fn run_step(
    ctx: &TestContext,
    job_id: JobId,
    batch_id: BatchId,
    step_id: StepId,
    outcome: JobStepOutcome,
) -> anyhow::Result<Job> {
    ctx.service
        .update_step(job_id, batch_id, step_id, StepUpdate::running())
        .await?;
    let job = ctx
        .service
        .update_step(job_id, batch_id, step_id, StepUpdate::completed(outcome))
        .await?;
    Ok(job)
}

/// Run a ready batch the way an agent would: every step that becomes ready is
/// run in order, then the batch is reported complete.
///
/// Steps default to `Success`; `outcomes` overrides that by node name.
pub async fn run_batch(
    ctx: &TestContext,
    job_id: JobId,
    batch_id: BatchId,
    outcomes: &[(&str, JobStepOutcome)],
) -> anyhow::Result<Job> {
    let mut job = start_batch(ctx, job_id, batch_id).await?;
    let graph = ctx.collection.get_graph(&job).await?;

    loop {
        let batch = job.batch(batch_id).context("batch disappeared")?;
        let Some(step) = batch.steps.iter().find(|s| s.state == JobStepState::Ready) else {
            break;
        };
        let name = graph
            .node(batch.node_ref(step))
            .map(|node| node.name.as_str())
            .context("step without a node")?;
        let step_id = step.id;
        let outcome = outcomes
            .iter()
            .find(|(node, _)| *node == name)
            .map(|(_, outcome)| *outcome)
            .unwrap_or(JobStepOutcome::Success);
        job = run_step(ctx, job_id, batch_id, step_id, outcome).await?;
    }

    finish_batch(ctx, job_id, batch_id).await
}

/// Report a running batch complete.
pub async fn finish_batch(ctx: &TestContext, job_id: JobId, batch_id: BatchId) -> anyhow::Result<Job> {
    let max_retries = ctx.collection.config().max_incomplete_retries;
    let job = ctx
        .collection
        .update(job_id, |job, graph| {
            job.update_batch(batch_id, Some(JobStepBatchState::Complete), None, graph, max_retries)
        })
        .await?;
    Ok(job)
}

const MAX_BATCHES: usize = 64;

/// Run every batch that is ready, in order, until none are left.
pub async fn run_ready_batches(
    ctx: &TestContext,
    job_id: JobId,
    outcomes: &[(&str, JobStepOutcome)],
) -> anyhow::Result<Job> {
    let mut job = reload(ctx, job_id).await?;
    for _ in 0..MAX_BATCHES {
        let Some(batch_id) = job
            .batches
            .iter()
            .find(|batch| batch.state == JobStepBatchState::Ready)
            .map(|batch| batch.id)
        else {
            return Ok(job);
        };
        job = run_batch(ctx, job_id, batch_id, outcomes).await?;
    }
    anyhow::bail!("job {job_id} still has ready batches after {MAX_BATCHES} runs")
}
