//! Notification sink that writes events to the tracing log.

use horde_core::events::{JobScheduledPayload, LabelUpdatePayload, StepCompletePayload};
use horde_core::ports::NotificationSink;
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSink;

impl NotificationSink for LoggingSink {
    fn on_job_step_complete(&self, event: &StepCompletePayload) {
        info!(
            job_id = %event.job_id,
            batch_id = %event.batch_id,
            step_id = %event.step_id,
            node = %event.node_name,
            state = ?event.state,
            outcome = ?event.outcome,
            "Step finished"
        );
    }

    fn on_job_scheduled(&self, event: &JobScheduledPayload) {
        info!(
            job_id = %event.job_id,
            batch_id = %event.batch_id,
            pool = %event.pool_id,
            agents_online = event.pool_has_agents_online,
            "Batch scheduled"
        );
    }

    fn on_label_update(&self, event: &LabelUpdatePayload) {
        info!(
            job_id = %event.job_id,
            label = %event.label,
            state = ?event.new_state,
            outcome = ?event.new_outcome,
            "Label changed"
        );
    }
}
