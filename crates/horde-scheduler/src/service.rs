//! Job lifecycle operations built on the job collection.

use crate::collection::JobCollection;
use crate::graph_builder::{GraphBuilder, NewArtifact, NewGroup, NewLabel};
use horde_core::graph::Graph;
use horde_core::ids::*;
use horde_core::job::{Job, JobStepOutcome, JobStepState, NewJob, Priority, StepUpdate};
use horde_core::label::{LabelOutcome, LabelState};
use horde_core::ports::{ChangeQuery, CommitSource, TemplateProvider, select_change_query};
use horde_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parameters for starting a job from a template.
#[derive(Debug, Clone, Default)]
pub struct StartJobRequest {
    /// Id to create the job under, for callers that reserve it up front.
    pub job_id: Option<JobId>,
    pub stream_id: StreamId,
    pub template_id: TemplateId,
    /// Change to build; defaults to the template's change queries.
    pub change: Option<ChangeQuery>,
    pub tags: Vec<String>,
    pub preflight_change: Option<u32>,
    /// Overrides the template name.
    pub name: Option<String>,
    pub started_by: Option<UserId>,
    /// Overrides the template priority.
    pub priority: Option<Priority>,
    pub arguments: Vec<String>,
    pub targets: Vec<String>,
}

/// The scheduler service.
pub struct JobService {
    collection: Arc<JobCollection>,
    templates: Arc<dyn TemplateProvider>,
    commits: Arc<dyn CommitSource>,
    builder: GraphBuilder,
}

impl JobService {
    pub fn new(
        collection: Arc<JobCollection>,
        templates: Arc<dyn TemplateProvider>,
        commits: Arc<dyn CommitSource>,
    ) -> Self {
        Self {
            collection,
            templates,
            commits,
            builder: GraphBuilder::new(),
        }
    }

    pub fn collection(&self) -> &Arc<JobCollection> {
        &self.collection
    }

    /// Start a new job.
    ///
    /// Templates with an initial agent type start from a single setup node
    /// whose agent extends the graph; others start empty and wait for
    /// [`JobService::extend_graph`].
    pub async fn start_job(&self, request: StartJobRequest) -> Result<Job> {
        let template = self
            .templates
            .get_template(&request.stream_id, &request.template_id)
            .await?
            .ok_or_else(|| Error::TemplateNotFound(request.template_id.to_string()))?;

        let query = request
            .change
            .unwrap_or_else(|| select_change_query(&template.change_queries, &request.tags));
        let resolved = self.commits.resolve(&request.stream_id, &query).await?;
        debug!(
            template = %request.template_id,
            ?query,
            change = resolved.change,
            "Resolved change query"
        );

        let graph = match &template.initial_agent_type {
            Some(agent_type) => self.builder.initial_graph(agent_type)?,
            None => Graph::empty(),
        };

        let mut arguments = template.arguments.clone();
        arguments.extend(request.arguments);

        let job = NewJob {
            id: request.job_id,
            stream_id: request.stream_id,
            template_id: request.template_id,
            template_hash: template.hash.clone(),
            name: request.name.unwrap_or_else(|| template.name.clone()),
            change: resolved.change,
            code_change: resolved.code_change,
            preflight_change: request.preflight_change,
            arguments,
            started_by_user: request.started_by,
            priority: request.priority.unwrap_or(template.priority),
            targets: request.targets,
            chained_jobs: template.chained_jobs.clone(),
            tags: request.tags,
        };
        self.collection.create_job(job, graph).await
    }

    /// Append groups, labels and artifacts to a job's graph.
    pub async fn extend_graph(
        &self,
        job_id: JobId,
        groups: Vec<NewGroup>,
        labels: Vec<NewLabel>,
        artifacts: Vec<NewArtifact>,
    ) -> Result<Job> {
        let attempts = self.collection.config().max_update_attempts.max(1);
        for attempt in 1..=attempts {
            let job = self
                .collection
                .get(job_id)
                .await?
                .ok_or(Error::JobNotFound(job_id))?;
            let old_graph = self.collection.get_graph(&job).await?;
            let new_graph = self.builder.append(
                &old_graph,
                groups.clone(),
                labels.clone(),
                artifacts.clone(),
            )?;
            let new_graph = self.collection.add_graph(new_graph).await?;

            if let Some(job) = self.collection.try_update_graph(&job, &new_graph).await? {
                info!(
                    job_id = %job_id,
                    graph = %new_graph.hash,
                    nodes = new_graph.node_count(),
                    "Extended job graph"
                );
                return Ok(job);
            }
            debug!(job_id = %job_id, attempt, "Graph update conflicted, retrying");
        }
        Err(Error::UpdateConflict { job_id, attempts })
    }

    /// Apply a step report and start any chained jobs it unblocks.
    pub async fn update_step(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        update: StepUpdate,
    ) -> Result<Job> {
        let job = self
            .collection
            .update(job_id, |job, graph| {
                job.update_step(batch_id, step_id, update.clone(), graph)
            })
            .await?;
        self.trigger_chained_jobs(&job).await?;
        Ok(job)
    }

    pub async fn retry_step(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        user: UserId,
    ) -> Result<Job> {
        info!(job_id = %job_id, batch_id = %batch_id, step_id = %step_id, user = %user, "Retrying step");
        self.update_step(job_id, batch_id, step_id, StepUpdate::retry(user))
            .await
    }

    pub async fn abort_step(
        &self,
        job_id: JobId,
        batch_id: BatchId,
        step_id: StepId,
        user: UserId,
    ) -> Result<Job> {
        info!(job_id = %job_id, batch_id = %batch_id, step_id = %step_id, user = %user, "Aborting step");
        self.update_step(job_id, batch_id, step_id, StepUpdate::abort(user))
            .await
    }

    pub async fn cancel_job(&self, job_id: JobId, user: UserId) -> Result<Job> {
        self.collection
            .update(job_id, |job, graph| job.cancel(user.clone(), graph))
            .await
    }

    /// Start chained jobs whose trigger completed without failing.
    ///
    /// Each chained job is started at most once per job: the entry is
    /// claimed with a reserved job id before the job is created, and callers
    /// that lose the claim leave the job to the winner.
    pub async fn trigger_chained_jobs(&self, job: &Job) -> Result<Vec<JobId>> {
        if job.chained_jobs.iter().all(|chained| chained.job_id.is_some()) {
            return Ok(Vec::new());
        }

        let graph = self.collection.get_graph(job).await?;

        let mut started = Vec::new();
        let mut current = job.clone();
        for chained in job.chained_jobs.iter().filter(|c| c.job_id.is_none()) {
            if !trigger_succeeded(job, &graph, &chained.trigger) {
                continue;
            }

            let chained_job_id = JobId::new();
            let Some(claimed) = self
                .claim_chained_job(current, &chained.trigger, &chained.template_id, chained_job_id)
                .await?
            else {
                current = self
                    .collection
                    .get(job.id)
                    .await?
                    .ok_or(Error::JobNotFound(job.id))?;
                continue;
            };
            current = claimed;

            let request = StartJobRequest {
                job_id: Some(chained_job_id),
                stream_id: current.stream_id.clone(),
                template_id: chained.template_id.clone(),
                change: Some(ChangeQuery::Fixed {
                    change: current.change,
                }),
                preflight_change: current.preflight_change,
                started_by: current.started_by_user.clone(),
                tags: current.tags.clone(),
                ..Default::default()
            };
            if let Err(err) = self.start_job(request).await {
                warn!(
                    job_id = %job.id,
                    chained_job_id = %chained_job_id,
                    trigger = %chained.trigger,
                    error = %err,
                    "Failed to start chained job, releasing claim"
                );
                self.release_chained_job(job.id, chained_job_id).await?;
                return Err(err);
            }
            info!(
                job_id = %job.id,
                chained_job_id = %chained_job_id,
                trigger = %chained.trigger,
                template = %chained.template_id,
                "Started chained job"
            );
            started.push(chained_job_id);
        }
        Ok(started)
    }

    /// Reserve a chained job entry for `chained_job_id`.
    ///
    /// Returns `Ok(None)` when the trigger has not succeeded on the latest
    /// copy of the job or another caller already holds the entry.
    async fn claim_chained_job(
        &self,
        mut current: Job,
        trigger: &str,
        template_id: &TemplateId,
        chained_job_id: JobId,
    ) -> Result<Option<Job>> {
        let attempts = self.collection.config().max_update_attempts.max(1);
        for _ in 0..attempts {
            let graph = self.collection.get_graph(&current).await?;
            if !trigger_succeeded(&current, &graph, trigger) {
                return Ok(None);
            }
            if let Some(job) = self
                .collection
                .try_set_chained_job(&current, trigger, template_id, chained_job_id)
                .await?
            {
                return Ok(Some(job));
            }

            current = self
                .collection
                .get(current.id)
                .await?
                .ok_or(Error::JobNotFound(current.id))?;
            let claimed = current
                .chained_jobs
                .iter()
                .any(|c| c.trigger == trigger && &c.template_id == template_id && c.job_id.is_some());
            if claimed {
                debug!(job_id = %current.id, trigger, "Chained job already claimed");
                return Ok(None);
            }
        }
        Err(Error::UpdateConflict {
            job_id: current.id,
            attempts,
        })
    }

    async fn release_chained_job(&self, job_id: JobId, chained_job_id: JobId) -> Result<()> {
        self.collection
            .update(job_id, |job, _| {
                for chained in job.chained_jobs.iter_mut() {
                    if chained.job_id == Some(chained_job_id) {
                        chained.job_id = None;
                    }
                }
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// A trigger names a label key or a node.
///
/// A label only counts once every required step has finished, so a pending
/// retry of a completed label holds its chained jobs back.
fn trigger_succeeded(job: &Job, graph: &Graph, trigger: &str) -> bool {
    if graph.find_label(trigger).is_some() {
        return job.label_settled(graph, trigger)
            && job.label_state(graph, trigger).is_some_and(|status| {
                status.state == LabelState::Complete && status.outcome != LabelOutcome::Failure
            });
    }
    graph
        .find_node(trigger)
        .and_then(|node_ref| job.latest_step(node_ref))
        .is_some_and(|(_, step)| {
            step.state == JobStepState::Completed && step.outcome != JobStepOutcome::Failure
        })
}
