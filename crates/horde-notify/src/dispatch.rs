//! Asynchronous delivery of queued notifications.
//!
//! [`QueuedSink`] turns the scheduler's synchronous sink calls into
//! [`NotificationEvent`]s on a bounded channel. A [`Dispatcher`] drains the
//! channel on its own task and hands each event to the registered
//! [`NotificationSubscriber`]s, so slow delivery never holds up a job update.

use async_trait::async_trait;
use futures::future::join_all;
use horde_core::events::{
    JobScheduledPayload, LabelUpdatePayload, NotificationEvent, StepCompletePayload,
};
use horde_core::ports::NotificationSink;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Receives notifications off the scheduler's hot path.
#[async_trait]
pub trait NotificationSubscriber: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError>;
}

/// Create a queued sink and the dispatcher that drains it.
pub fn queued(capacity: usize) -> (QueuedSink, Dispatcher) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueuedSink { tx },
        Dispatcher {
            rx,
            subscribers: Vec::new(),
        },
    )
}

/// Sink that enqueues events without waiting. Events are dropped when the
/// queue is full or the dispatcher has stopped.
#[derive(Clone)]
pub struct QueuedSink {
    tx: mpsc::Sender<NotificationEvent>,
}

impl QueuedSink {
    fn enqueue(&self, event: NotificationEvent) {
        if let Err(err) = self.tx.try_send(event) {
            let (reason, event) = match err {
                TrySendError::Full(event) => ("queue full", event),
                TrySendError::Closed(event) => ("dispatcher stopped", event),
            };
            warn!(subject = %event.subject(), reason, "Dropped notification");
        }
    }
}

impl NotificationSink for QueuedSink {
    fn on_job_step_complete(&self, event: &StepCompletePayload) {
        self.enqueue(NotificationEvent::StepComplete(event.clone()));
    }

    fn on_job_scheduled(&self, event: &JobScheduledPayload) {
        self.enqueue(NotificationEvent::JobScheduled(event.clone()));
    }

    fn on_label_update(&self, event: &LabelUpdatePayload) {
        self.enqueue(NotificationEvent::LabelUpdate(event.clone()));
    }
}

pub struct Dispatcher {
    rx: mpsc::Receiver<NotificationEvent>,
    subscribers: Vec<Arc<dyn NotificationSubscriber>>,
}

impl Dispatcher {
    pub fn subscribe(&mut self, subscriber: Arc<dyn NotificationSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Deliver events until shutdown is signalled or every sender is dropped.
    ///
    /// Events already queued at shutdown are still delivered.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(subscribers = self.subscribers.len(), "Notification dispatcher started");
        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.dispatch(&event).await,
                    None => break,
                },
                _ = shutdown.changed() => {
                    self.rx.close();
                    while let Some(event) = self.rx.recv().await {
                        self.dispatch(&event).await;
                    }
                    break;
                }
            }
        }
        info!("Notification dispatcher stopped");
    }

    async fn dispatch(&self, event: &NotificationEvent) {
        let deliveries = self
            .subscribers
            .iter()
            .map(|subscriber| async move { (subscriber.name(), subscriber.deliver(event).await) });

        for (subscriber, result) in join_all(deliveries).await {
            match result {
                Ok(()) => debug!(
                    subscriber,
                    subject = %event.subject(),
                    "Delivered notification"
                ),
                Err(err) => warn!(
                    subscriber,
                    subject = %event.subject(),
                    error = %err,
                    "Notification delivery failed"
                ),
            }
        }
    }
}

/// Writes each event as a JSON document to the log.
#[derive(Debug, Default)]
pub struct JsonLogSubscriber;

#[async_trait]
impl NotificationSubscriber for JsonLogSubscriber {
    fn name(&self) -> &str {
        "json-log"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let body = serde_json::to_string(event)?;
        info!(subject = %event.subject(), job_id = %event.job_id(), %body, "Notification");
        Ok(())
    }
}
