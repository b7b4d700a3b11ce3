//! Job lifecycle through the job service.

use horde_core::Error;
use horde_core::ids::{BatchId, JobId, StepId, TemplateId, UserId};
use horde_core::job::{Job, JobState, JobStepOutcome, JobStepState, Priority, StepUpdate};
use horde_core::label::{LabelOutcome, LabelState};
use horde_core::ports::ChangeQuery;
use horde_scheduler::{NewGroup, NewLabel, NewNode, SETUP_NODE_NAME};
use horde_tests::*;
use pretty_assertions::assert_eq;

fn editor_groups() -> Vec<NewGroup> {
    vec![
        NewGroup::new(
            "Win64",
            vec![NewNode::new("Compile Editor").after(SETUP_NODE_NAME)],
        ),
        NewGroup::new(
            "Win64",
            vec![NewNode::new("Cook Game").after("Compile Editor")],
        ),
    ]
}

#[tokio::test]
async fn test_start_job_from_template() {
    let ctx = TestContext::new().await;
    let job = ctx
        .service
        .start_job(TemplateFixture::request(TemplateFixture::INCREMENTAL))
        .await
        .unwrap();

    assert_eq!(job.name, "Incremental Build");
    assert_eq!(job.priority, Priority::High);
    assert_eq!(job.change, horde_tests::context::LATEST_CHANGE);
    assert_eq!(job.arguments, vec!["-Target=Editor".to_string()]);
    assert_eq!(job.chained_jobs.len(), 1);

    let graph = ctx.collection.get_graph(&job).await.unwrap();
    assert_eq!(batch_nodes(&job, &graph, 0), vec![SETUP_NODE_NAME]);
}

#[tokio::test]
async fn test_start_job_at_fixed_change() {
    let ctx = TestContext::new().await;
    let stream = ctx.stream_id();
    ctx.commits.submit(&stream, 1010, false).await;

    let mut request = TemplateFixture::request(TemplateFixture::BARE);
    request.change = Some(ChangeQuery::Fixed { change: 1010 });
    request.name = Some("Custom".to_string());
    let job = ctx.service.start_job(request).await.unwrap();

    assert_eq!(job.name, "Custom");
    assert_eq!(job.change, 1010);
    assert_eq!(job.code_change, horde_tests::context::LATEST_CHANGE);
    assert!(job.batches.is_empty());
}

#[tokio::test]
async fn test_start_job_errors() {
    let ctx = TestContext::new().await;
    let err = ctx
        .service
        .start_job(TemplateFixture::request("nightly"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound(_)));

    let mut request = TemplateFixture::request(TemplateFixture::BARE);
    request.change = Some(ChangeQuery::LastSuccessful {
        template_id: TemplateId::new(TemplateFixture::INCREMENTAL),
        target: None,
    });
    let err = ctx.service.start_job(request).await.unwrap_err();
    assert!(matches!(err, Error::ChangeResolution(_)));
}

#[tokio::test]
async fn test_extend_graph_rejects_unknown_dependency() {
    let ctx = TestContext::new().await;
    let job = ctx
        .service
        .start_job(TemplateFixture::request(TemplateFixture::INCREMENTAL))
        .await
        .unwrap();

    let err = ctx
        .service
        .extend_graph(
            job.id,
            vec![NewGroup::new(
                "Win64",
                vec![NewNode::new("Cook Game").after("Compile Editor")],
            )],
            vec![],
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidGraph(_)));

    let unchanged = reload(&ctx, job.id).await.unwrap();
    assert_eq!(unchanged.graph_hash, job.graph_hash);
    assert_eq!(unchanged.update_index, job.update_index);
}

#[tokio::test]
async fn test_label_completion_starts_chained_job_once() {
    let ctx = TestContext::new().await;
    let job = ctx
        .service
        .start_job(TemplateFixture::request(TemplateFixture::INCREMENTAL))
        .await
        .unwrap();
    let job = ctx
        .service
        .extend_graph(
            job.id,
            editor_groups(),
            vec![NewLabel::new("Editor", &["Compile Editor"])],
            vec![],
        )
        .await
        .unwrap();

    // Setup and editor batches only; the cook is still waiting.
    let job = run_batch(&ctx, job.id, job.batches[0].id, &[]).await.unwrap();
    assert!(job.chained_jobs[0].job_id.is_none());
    let job = run_batch(&ctx, job.id, job.batches[1].id, &[]).await.unwrap();

    let job = reload(&ctx, job.id).await.unwrap();
    let chained_id = job.chained_jobs[0].job_id.expect("chained job started");
    let chained = reload(&ctx, chained_id).await.unwrap();
    assert_eq!(chained.template_id, TemplateId::new(TemplateFixture::TESTS));
    assert_eq!(chained.change, job.change);
    assert_eq!(chained.priority, Priority::Low);

    // Later step updates do not start it again.
    let job = run_ready_batches(&ctx, job.id, &[]).await.unwrap();
    assert_eq!(job.state(), JobState::Complete);
    let job = reload(&ctx, job.id).await.unwrap();
    assert_eq!(job.chained_jobs[0].job_id, Some(chained_id));
    assert!(ctx.service.trigger_chained_jobs(&job).await.unwrap().is_empty());
}

/// Independent groups after setup, so several batches can run at once.
fn parallel_groups() -> Vec<NewGroup> {
    ["Compile Editor", "Cook Game", "Lint"]
        .into_iter()
        .map(|name| NewGroup::new("Win64", vec![NewNode::new(name).after(SETUP_NODE_NAME)]))
        .collect()
}

/// Apply a step update through the collection only, without starting
/// chained jobs.
async fn update_step_quietly(
    ctx: &TestContext,
    job_id: JobId,
    batch_id: BatchId,
    step_id: StepId,
    update: StepUpdate,
) -> Job {
    ctx.collection
        .update(job_id, |job, graph| {
            job.update_step(batch_id, step_id, update.clone(), graph)
        })
        .await
        .unwrap()
}

/// An incremental job whose `Editor` label has completed without any chained
/// job having been started. `Cook Game` and `Lint` are left running.
async fn job_with_unchained_editor(ctx: &TestContext) -> Job {
    let job = ctx
        .service
        .start_job(TemplateFixture::request(TemplateFixture::INCREMENTAL))
        .await
        .unwrap();
    let job = ctx
        .service
        .extend_graph(
            job.id,
            parallel_groups(),
            vec![NewLabel::new("Editor", &["Compile Editor"])],
            vec![],
        )
        .await
        .unwrap();
    let job = run_batch(ctx, job.id, job.batches[0].id, &[]).await.unwrap();
    let graph = ctx.collection.get_graph(&job).await.unwrap();

    for name in ["Compile Editor", "Cook Game", "Lint"] {
        let (batch_id, step) = latest_step(&job, &graph, name).unwrap();
        let step_id = step.id;
        start_batch(ctx, job.id, batch_id).await.unwrap();
        update_step_quietly(ctx, job.id, batch_id, step_id, StepUpdate::running()).await;
    }
    let (batch_id, step) = latest_step(&job, &graph, "Compile Editor").unwrap();
    let job = update_step_quietly(
        ctx,
        job.id,
        batch_id,
        step.id,
        StepUpdate::completed(JobStepOutcome::Success),
    )
    .await;

    let editor = job.label_state(&graph, "Editor").unwrap();
    assert_eq!(editor.state, LabelState::Complete);
    assert!(job.chained_jobs[0].job_id.is_none());
    job
}

#[tokio::test]
async fn test_concurrent_step_updates_start_one_chained_job() {
    let ctx = TestContext::new().await;
    let job = job_with_unchained_editor(&ctx).await;
    let graph = ctx.collection.get_graph(&job).await.unwrap();
    let (cook_batch, cook) = latest_step(&job, &graph, "Cook Game").unwrap();
    let (lint_batch, lint) = latest_step(&job, &graph, "Lint").unwrap();

    let (cooked, linted) = tokio::join!(
        ctx.service.update_step(
            job.id,
            cook_batch,
            cook.id,
            StepUpdate::completed(JobStepOutcome::Success)
        ),
        ctx.service.update_step(
            job.id,
            lint_batch,
            lint.id,
            StepUpdate::completed(JobStepOutcome::Success)
        ),
    );
    cooked.unwrap();
    linted.unwrap();

    let job = reload(&ctx, job.id).await.unwrap();
    let chained_id = job.chained_jobs[0].job_id.expect("chained job started");
    assert!(reload(&ctx, chained_id).await.is_ok());
    assert_eq!(ctx.jobs.len().await, 2);
}

#[tokio::test]
async fn test_stale_snapshots_start_one_chained_job() {
    let ctx = TestContext::new().await;
    let job = job_with_unchained_editor(&ctx).await;

    // Both callers saw the entry unclaimed.
    let (first, second) = tokio::join!(
        ctx.service.trigger_chained_jobs(&job),
        ctx.service.trigger_chained_jobs(&job),
    );
    let mut started = first.unwrap();
    started.extend(second.unwrap());
    assert_eq!(started.len(), 1);

    let job = reload(&ctx, job.id).await.unwrap();
    assert_eq!(job.chained_jobs[0].job_id, Some(started[0]));
    assert!(reload(&ctx, started[0]).await.is_ok());
    assert_eq!(ctx.jobs.len().await, 2);

    assert!(ctx.service.trigger_chained_jobs(&job).await.unwrap().is_empty());
    assert_eq!(ctx.jobs.len().await, 2);
}

#[tokio::test]
async fn test_retried_label_chains_after_retry_succeeds() {
    let ctx = TestContext::new().await;
    let job = ctx
        .service
        .start_job(TemplateFixture::request(TemplateFixture::INCREMENTAL))
        .await
        .unwrap();
    let job = ctx
        .service
        .extend_graph(
            job.id,
            editor_groups(),
            vec![NewLabel::new("Editor", &["Compile Editor"])],
            vec![],
        )
        .await
        .unwrap();
    let job = run_ready_batches(&ctx, job.id, &[("Compile Editor", JobStepOutcome::Failure)])
        .await
        .unwrap();
    assert!(job.chained_jobs[0].job_id.is_none());

    let graph = ctx.collection.get_graph(&job).await.unwrap();
    let (batch_id, step) = latest_step(&job, &graph, "Compile Editor").unwrap();
    let job = ctx
        .service
        .retry_step(job.id, batch_id, step.id, UserId::new("bob"))
        .await
        .unwrap();

    // The label holds its failed outcome until the retry finishes.
    assert_eq!(
        step_state(&job, &graph, "Compile Editor"),
        (JobStepState::Ready, JobStepOutcome::Unspecified)
    );
    let editor = job.label_state(&graph, "Editor").unwrap();
    assert_eq!(
        (editor.state, editor.outcome),
        (LabelState::Complete, LabelOutcome::Failure)
    );
    assert!(!job.label_settled(&graph, "Editor"));
    assert!(job.chained_jobs[0].job_id.is_none());
    assert!(ctx.service.trigger_chained_jobs(&job).await.unwrap().is_empty());
    assert!(
        ctx.sink
            .label_updates()
            .iter()
            .filter(|update| update.label == "Editor")
            .all(|update| update.new_outcome == LabelOutcome::Failure
                || update.new_state == LabelState::Running)
    );

    let (batch_id, _) = latest_step(&job, &graph, "Compile Editor").unwrap();
    let job = run_batch(&ctx, job.id, batch_id, &[]).await.unwrap();
    let editor = job.label_state(&graph, "Editor").unwrap();
    assert_eq!(
        (editor.state, editor.outcome),
        (LabelState::Complete, LabelOutcome::Success)
    );

    let job = reload(&ctx, job.id).await.unwrap();
    let chained_id = job.chained_jobs[0].job_id.expect("chained job started");
    let chained = reload(&ctx, chained_id).await.unwrap();
    assert_eq!(chained.template_id, TemplateId::new(TemplateFixture::TESTS));
}

#[tokio::test]
async fn test_change_query_follows_job_tags() {
    let ctx = TestContext::new().await;
    let stream = ctx.stream_id();
    ctx.commits.submit(&stream, 1010, false).await;

    let job = ctx
        .service
        .start_job(TemplateFixture::request(TemplateFixture::PACKAGING))
        .await
        .unwrap();
    assert_eq!(job.change, horde_tests::context::LATEST_CHANGE);

    let mut request = TemplateFixture::request(TemplateFixture::PACKAGING);
    request.tags = vec![TemplateFixture::CONTENT_ONLY_TAG.to_string()];
    let job = ctx.service.start_job(request).await.unwrap();
    assert_eq!(job.change, 1010);
    assert_eq!(job.code_change, horde_tests::context::LATEST_CHANGE);
    assert_eq!(job.tags, vec![TemplateFixture::CONTENT_ONLY_TAG.to_string()]);

    // An explicit change wins over the template's queries.
    let mut request = TemplateFixture::request(TemplateFixture::PACKAGING);
    request.tags = vec![TemplateFixture::CONTENT_ONLY_TAG.to_string()];
    request.change = Some(ChangeQuery::Latest);
    let job = ctx.service.start_job(request).await.unwrap();
    assert_eq!(job.change, 1010);

    let mut request = TemplateFixture::request(TemplateFixture::PACKAGING);
    request.tags = vec![TemplateFixture::CONTENT_ONLY_TAG.to_string()];
    request.change = Some(ChangeQuery::LatestCode);
    let job = ctx.service.start_job(request).await.unwrap();
    assert_eq!(job.change, horde_tests::context::LATEST_CHANGE);
}

#[tokio::test]
async fn test_failed_label_does_not_chain() {
    let ctx = TestContext::new().await;
    let job = ctx
        .service
        .start_job(TemplateFixture::request(TemplateFixture::INCREMENTAL))
        .await
        .unwrap();
    let job = ctx
        .service
        .extend_graph(
            job.id,
            editor_groups(),
            vec![NewLabel::new("Editor", &["Compile Editor"])],
            vec![],
        )
        .await
        .unwrap();

    let job = run_ready_batches(&ctx, job.id, &[("Compile Editor", JobStepOutcome::Failure)])
        .await
        .unwrap();
    let graph = ctx.collection.get_graph(&job).await.unwrap();
    let label = job.label_state(&graph, "Editor").unwrap();
    assert_eq!(
        (label.state, label.outcome),
        (LabelState::Complete, LabelOutcome::Failure)
    );
    assert!(job.chained_jobs[0].job_id.is_none());
}

#[tokio::test]
async fn test_notifications_follow_progress() {
    let ctx = TestContext::new().await;
    let job = create_job(
        &ctx,
        GraphFixture::two_groups(),
        GraphFixture::two_group_labels(),
    )
    .await
    .unwrap();
    run_ready_batches(&ctx, job.id, &[("Run Tests", JobStepOutcome::Warnings)])
        .await
        .unwrap();

    let completed = ctx.sink.completed_steps();
    assert_eq!(completed.len(), 4);
    assert!(completed.iter().all(|s| s.state == JobStepState::Completed));
    let tests = completed.iter().find(|s| s.node_name == "Run Tests").unwrap();
    assert_eq!(tests.outcome, JobStepOutcome::Warnings);

    let updates = ctx.sink.label_updates();
    let final_tests = updates
        .iter()
        .rev()
        .find(|u| u.label == "Tests/Tests")
        .unwrap();
    assert_eq!(final_tests.new_state, LabelState::Complete);
    assert_eq!(final_tests.new_outcome, LabelOutcome::Warnings);
}

#[tokio::test]
async fn test_cancel_job() {
    let ctx = TestContext::new().await;
    let job = create_job(&ctx, GraphFixture::chain(), vec![]).await.unwrap();
    let batch_id = job.batches[0].id;
    let job = start_batch(&ctx, job.id, batch_id).await.unwrap();
    let step_id = job.batches[0].steps[0].id;
    ctx.service
        .update_step(job.id, batch_id, step_id, StepUpdate::running())
        .await
        .unwrap();

    let job = ctx
        .service
        .cancel_job(job.id, UserId::new("alice"))
        .await
        .unwrap();
    assert_eq!(job.cancelled_by, Some(UserId::new("alice")));
    assert!(job.batches[0].steps[0].abort_requested);
    assert!(
        job.batches[1]
            .steps
            .iter()
            .all(|s| s.state == JobStepState::Aborted)
    );

    let err = ctx
        .service
        .cancel_job(job.id, UserId::new("alice"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::JobCancelled));
}

#[tokio::test]
async fn test_abort_waiting_step() {
    let ctx = TestContext::new().await;
    let job = create_job(&ctx, GraphFixture::chain(), vec![]).await.unwrap();
    let graph = ctx.collection.get_graph(&job).await.unwrap();
    let (batch_id, step) = latest_step(&job, &graph, "Step3").unwrap();

    let job = ctx
        .service
        .abort_step(job.id, batch_id, step.id, UserId::new("alice"))
        .await
        .unwrap();
    assert_eq!(
        step_state(&job, &graph, "Step3"),
        (JobStepState::Aborted, JobStepOutcome::Unspecified)
    );
    assert_eq!(
        step_state(&job, &graph, "Step2"),
        (JobStepState::Waiting, JobStepOutcome::Unspecified)
    );
}
