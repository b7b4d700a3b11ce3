//! Notification events raised by job state changes.

use crate::ids::*;
use crate::job::{JobStepOutcome, JobStepState};
use crate::label::{LabelOutcome, LabelState};
use crate::ports::NotificationSink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    StepComplete(StepCompletePayload),
    JobScheduled(JobScheduledPayload),
    LabelUpdate(LabelUpdatePayload),
}

impl NotificationEvent {
    /// Routing subject for this event.
    pub fn subject(&self) -> String {
        match self {
            NotificationEvent::StepComplete(p) => {
                format!("job.{}.batch.{}.step.{}.complete", p.job_id, p.batch_id, p.step_id)
            }
            NotificationEvent::JobScheduled(p) => {
                format!("job.{}.batch.{}.scheduled", p.job_id, p.batch_id)
            }
            NotificationEvent::LabelUpdate(p) => format!("job.{}.label.{}", p.job_id, p.label),
        }
    }

    pub fn job_id(&self) -> JobId {
        match self {
            NotificationEvent::StepComplete(p) => p.job_id,
            NotificationEvent::JobScheduled(p) => p.job_id,
            NotificationEvent::LabelUpdate(p) => p.job_id,
        }
    }

    /// Calls the matching sink method.
    pub fn deliver_to(&self, sink: &dyn NotificationSink) {
        match self {
            NotificationEvent::StepComplete(p) => sink.on_job_step_complete(p),
            NotificationEvent::JobScheduled(p) => sink.on_job_scheduled(p),
            NotificationEvent::LabelUpdate(p) => sink.on_label_update(p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletePayload {
    pub job_id: JobId,
    pub stream_id: StreamId,
    pub batch_id: BatchId,
    pub step_id: StepId,
    pub node_name: String,
    pub state: JobStepState,
    pub outcome: JobStepOutcome,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobScheduledPayload {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub pool_id: PoolId,
    /// Whether any agent in the pool could pick the batch up right now.
    pub pool_has_agents_online: bool,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelUpdatePayload {
    pub job_id: JobId,
    pub stream_id: StreamId,
    pub label: String,
    pub old_state: LabelState,
    pub old_outcome: LabelOutcome,
    pub new_state: LabelState,
    pub new_outcome: LabelOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = NotificationEvent::JobScheduled(JobScheduledPayload {
            job_id: JobId::new(),
            batch_id: BatchId::new(1),
            pool_id: PoolId::new("win64"),
            pool_has_agents_online: true,
            scheduled_at: Utc::now(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_scheduled");
        assert_eq!(json["pool_id"], "win64");
        assert!(event.subject().ends_with(".batch.0001.scheduled"));
    }
}
