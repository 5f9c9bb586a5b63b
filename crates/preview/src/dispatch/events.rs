//! Job event broadcaster for streaming persisted transitions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::FailureCode;
use crate::model::{JobStatus, RenderJob};

/// A persisted job transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub job_id: String,
    pub asset_id: String,
    pub status: JobStatus,
    /// Render agent handling the job, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Rendition location (set on completion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<FailureCode>,
}

impl JobEvent {
    pub fn new(job: &RenderJob, message: &str) -> Self {
        Self {
            job_id: job.id.clone(),
            asset_id: job.asset_id.clone(),
            status: job.status,
            agent: job.agent.clone(),
            message: message.to_string(),
            timestamp: Utc::now(),
            location: None,
            error_code: job.error.as_ref().map(|e| e.code),
        }
    }

    pub fn completed(job: &RenderJob, location: &str) -> Self {
        Self {
            location: Some(location.to_string()),
            ..Self::new(job, "Rendition stored")
        }
    }

    pub fn failed(job: &RenderJob) -> Self {
        let message = job
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "Job failed".to_string());
        Self::new(job, &message)
    }
}

#[derive(Clone)]
pub struct JobEventBroadcaster {
    sender: Arc<broadcast::Sender<JobEvent>>,
}

impl JobEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: JobEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for JobEventBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}
