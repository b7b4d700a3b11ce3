//! Task source queueing and assignment against the in-memory stores.

use horde_core::ids::{AgentId, PoolId, TemplateId, UserId};
use horde_core::job::{JobStepBatchError, JobStepBatchState, JobStepOutcome, JobStepState, NewJob, Priority};
use horde_core::ports::PoolStatus;
use horde_scheduler::{GraphBuilder, NewGroup, NewNode};
use horde_tests::*;
use pretty_assertions::assert_eq;

fn win64() -> Vec<PoolId> {
    vec![PoolId::new("win-compile")]
}

#[tokio::test]
async fn test_tick_queues_ready_batches_and_reports_pools() {
    let ctx = TestContext::new().await;
    let job = create_job(
        &ctx,
        vec![
            NewGroup::new("Win64", vec![NewNode::new("Compile")]),
            NewGroup::new("Linux", vec![NewNode::new("Lint")]),
        ],
        vec![],
    )
    .await
    .unwrap();

    let summary = ctx.task_source.tick().await.unwrap();
    assert_eq!(summary.queued, 2);
    assert_eq!(summary.failed, 0);

    let scheduled = ctx.sink.scheduled();
    assert_eq!(scheduled.len(), 2);
    let online: Vec<(PoolId, bool)> = scheduled
        .iter()
        .map(|s| (s.pool_id.clone(), s.pool_has_agents_online))
        .collect();
    assert!(online.contains(&(PoolId::new("win-compile"), true)));
    assert!(online.contains(&(PoolId::new("linux"), false)));
    assert!(scheduled.iter().all(|s| s.job_id == job.id));

    // A second tick finds nothing new.
    let summary = ctx.task_source.tick().await.unwrap();
    assert_eq!(summary.queued, 0);
    assert_eq!(ctx.sink.scheduled().len(), 2);
}

#[tokio::test]
async fn test_unschedulable_batches_fail() {
    let ctx = TestContext::new().await;
    let job = create_job(
        &ctx,
        vec![
            NewGroup::new("Mac", vec![NewNode::new("Compile Mac")]),
            NewGroup::new("PS5", vec![NewNode::new("Compile PS5")]),
            NewGroup::new("Win64", vec![NewNode::new("Package").after("Compile Mac")]),
        ],
        vec![],
    )
    .await
    .unwrap();

    let summary = ctx.task_source.tick().await.unwrap();
    assert_eq!(summary.failed, 2);
    assert_eq!(summary.queued, 0);

    let job = reload(&ctx, job.id).await.unwrap();
    assert_eq!(job.batches[0].error, Some(JobStepBatchError::NoAgentsInPool));
    assert_eq!(job.batches[1].error, Some(JobStepBatchError::UnknownAgentType));

    let graph = ctx.collection.get_graph(&job).await.unwrap();
    assert_eq!(
        step_state(&job, &graph, "Compile Mac"),
        (JobStepState::Skipped, JobStepOutcome::Failure)
    );
    assert_eq!(
        step_state(&job, &graph, "Package"),
        (JobStepState::Skipped, JobStepOutcome::Failure)
    );
}

#[tokio::test]
async fn test_pool_regains_agents() {
    let ctx = TestContext::new().await;
    ctx.pools
        .set_status(&PoolId::new("linux"), PoolStatus { agents: 2, online: 2 })
        .await;
    create_job(&ctx, vec![NewGroup::new("Linux", vec![NewNode::new("Lint")])], vec![])
        .await
        .unwrap();

    ctx.task_source.tick().await.unwrap();
    assert!(ctx.sink.scheduled()[0].pool_has_agents_online);
}

#[tokio::test]
async fn test_assigns_highest_priority_first() {
    let ctx = TestContext::new().await;
    let graph = || {
        GraphBuilder::new()
            .build(
                vec![NewGroup::new("Win64", vec![NewNode::new("Compile")])],
                vec![],
                vec![],
            )
            .unwrap()
    };
    let request = |priority| NewJob {
        stream_id: ctx.stream_id(),
        template_id: TemplateId::new("test"),
        name: format!("{priority:?} job"),
        priority,
        ..Default::default()
    };
    let low = ctx
        .collection
        .create_job(request(Priority::Low), graph())
        .await
        .unwrap();
    let high = ctx
        .collection
        .create_job(request(Priority::High), graph())
        .await
        .unwrap();
    let normal = ctx
        .collection
        .create_job(request(Priority::Normal), graph())
        .await
        .unwrap();

    ctx.task_source.tick().await.unwrap();
    let order: Vec<_> = ctx
        .task_source
        .snapshot()
        .await
        .into_iter()
        .map(|item| item.job_id)
        .collect();
    assert_eq!(order, vec![high.id, normal.id, low.id]);

    let first = ctx
        .task_source
        .try_assign(&AgentId::new("agent-1"), &win64())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.job.id, high.id);
    let batch = first.job.batch(first.batch_id).unwrap();
    assert_eq!(batch.state, JobStepBatchState::Starting);
    assert_eq!(batch.lease_id, Some(first.lease_id));
    assert_eq!(batch.pool_id, Some(PoolId::new("win-compile")));
}

#[tokio::test]
async fn test_agent_only_gets_batches_from_its_pools() {
    let ctx = TestContext::new().await;
    create_job(&ctx, vec![NewGroup::new("Linux", vec![NewNode::new("Lint")])], vec![])
        .await
        .unwrap();
    ctx.task_source.tick().await.unwrap();

    let none = ctx
        .task_source
        .try_assign(&AgentId::new("win-agent"), &win64())
        .await
        .unwrap();
    assert!(none.is_none());

    let some = ctx
        .task_source
        .try_assign(&AgentId::new("linux-agent"), &[PoolId::new("linux")])
        .await
        .unwrap();
    assert!(some.is_some());
}

#[tokio::test]
async fn test_cancelled_job_leaves_queue() {
    let ctx = TestContext::new().await;
    let job = create_job(&ctx, GraphFixture::chain(), vec![]).await.unwrap();
    ctx.task_source.tick().await.unwrap();
    assert_eq!(ctx.task_source.snapshot().await.len(), 1);

    ctx.service
        .cancel_job(job.id, UserId::new("alice"))
        .await
        .unwrap();

    let summary = ctx.task_source.tick().await.unwrap();
    assert_eq!(summary.removed, 1);
    assert!(ctx.task_source.snapshot().await.is_empty());
    let assignment = ctx
        .task_source
        .try_assign(&AgentId::new("agent-1"), &win64())
        .await
        .unwrap();
    assert!(assignment.is_none());
}

#[tokio::test]
async fn test_second_agent_cannot_take_same_batch() {
    let ctx = TestContext::new().await;
    create_job(&ctx, vec![NewGroup::new("Win64", vec![NewNode::new("Compile")])], vec![])
        .await
        .unwrap();
    ctx.task_source.tick().await.unwrap();

    let first = ctx
        .task_source
        .try_assign(&AgentId::new("agent-1"), &win64())
        .await
        .unwrap();
    assert!(first.is_some());

    // Re-queueing on the next tick must not hand the claimed batch out again.
    ctx.task_source.tick().await.unwrap();
    let second = ctx
        .task_source
        .try_assign(&AgentId::new("agent-2"), &win64())
        .await
        .unwrap();
    assert!(second.is_none());
}
