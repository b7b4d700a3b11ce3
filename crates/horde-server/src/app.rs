//! Server wiring.

use crate::config::ServerConfig;
use horde_core::ports::NotificationSink;
use horde_notify::{Dispatcher, JsonLogSubscriber, LoggingSink, NotificationHub, queued};
use horde_scheduler::{JobCollection, JobService, TaskSource};
use horde_store::{
    MemoryCommitSource, MemoryGraphRepository, MemoryJobRepository, MemoryTemplateProvider,
    StaticPoolDirectory,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// A fully wired scheduler.
pub struct Server {
    pub service: Arc<JobService>,
    pub task_source: Arc<TaskSource>,
    pub commits: Arc<MemoryCommitSource>,
    pub pools: Arc<StaticPoolDirectory>,
    dispatcher: Dispatcher,
    tick_interval: Duration,
}

impl Server {
    pub async fn build(config: &ServerConfig) -> anyhow::Result<Self> {
        let commits = Arc::new(MemoryCommitSource::new());
        for stream in &config.streams {
            commits.submit(&stream.id, stream.latest_change, true).await;
        }

        let templates: MemoryTemplateProvider = config
            .templates
            .iter()
            .map(|(id, template)| (id.clone(), template.clone()))
            .collect();
        let pools = Arc::new(StaticPoolDirectory::new(config.pools.clone()));

        let (queue, mut dispatcher) = queued(config.notifications.queue_capacity);
        dispatcher.subscribe(Arc::new(JsonLogSubscriber));
        let sink: Arc<dyn NotificationSink> = Arc::new(
            NotificationHub::new()
                .with_sink(Arc::new(LoggingSink))
                .with_sink(Arc::new(queue)),
        );

        let collection = Arc::new(JobCollection::new(
            Arc::new(MemoryJobRepository::new()),
            Arc::new(MemoryGraphRepository::new()),
            sink.clone(),
            config.scheduler.clone(),
        ));
        let service = Arc::new(JobService::new(
            collection.clone(),
            Arc::new(templates),
            commits.clone(),
        ));
        let task_source = Arc::new(TaskSource::new(
            collection,
            pools.clone(),
            commits.clone(),
            sink,
        ));

        info!(
            pools = config.pools.len(),
            templates = config.templates.len(),
            streams = config.streams.len(),
            "Scheduler configured"
        );

        Ok(Self {
            service,
            task_source,
            commits,
            pools,
            dispatcher,
            tick_interval: config.scheduler.tick_interval(),
        })
    }

    /// Run the task source and notification dispatcher until shutdown.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let dispatcher = tokio::spawn(self.dispatcher.run(shutdown.clone()));
        self.task_source.run(self.tick_interval, shutdown).await;
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "Notification dispatcher panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use horde_core::ids::{AgentId, PoolId, StreamId, TemplateId};
    use horde_scheduler::StartJobRequest;

    const CONFIG: &str = r#"
scheduler:
  tick_interval_secs: 1
pools:
  - id: win-compile
    agent_types: [Win64]
    agents: 2
    online: 2
templates:
  incremental:
    name: Incremental Build
    initial_agent_type: Win64
streams:
  - id: //UE5/Main
    latest_change: 42
"#;

    #[tokio::test]
    async fn test_setup_batch_is_handed_out() {
        let config = ServerConfig::from_yaml(CONFIG).unwrap();
        let server = Server::build(&config).await.unwrap();

        let job = server
            .service
            .start_job(StartJobRequest {
                stream_id: StreamId::new("//UE5/Main"),
                template_id: TemplateId::new("incremental"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(job.change, 42);

        let summary = server.task_source.tick().await.unwrap();
        assert_eq!(summary.queued, 1);

        let assignment = server
            .task_source
            .try_assign(&AgentId::new("agent-1"), &[PoolId::new("win-compile")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(assignment.job.id, job.id);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = Server::build(&ServerConfig::default()).await.unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(rx));
        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
