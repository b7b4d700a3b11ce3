//! Fan-out of notifications to several sinks.

use horde_core::events::{JobScheduledPayload, LabelUpdatePayload, StepCompletePayload};
use horde_core::ports::NotificationSink;
use std::sync::Arc;

/// Forwards every notification to each registered sink in order.
#[derive(Default, Clone)]
pub struct NotificationHub {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl NotificationSink for NotificationHub {
    fn on_job_step_complete(&self, event: &StepCompletePayload) {
        for sink in &self.sinks {
            sink.on_job_step_complete(event);
        }
    }

    fn on_job_scheduled(&self, event: &JobScheduledPayload) {
        for sink in &self.sinks {
            sink.on_job_scheduled(event);
        }
    }

    fn on_label_update(&self, event: &LabelUpdatePayload) {
        for sink in &self.sinks {
            sink.on_label_update(event);
        }
    }
}
