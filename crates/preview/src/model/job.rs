use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AgentKind;
use crate::error::FailureCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "Pending"),
            JobStatus::InProgress => write!(f, "InProgress"),
            JobStatus::Completed => write!(f, "Completed"),
            JobStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// What the job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenditionKind {
    Pdf,
    Image,
    Stream,
    Placeholder,
}

impl From<AgentKind> for RenditionKind {
    fn from(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Document => RenditionKind::Pdf,
            AgentKind::Image => RenditionKind::Image,
            AgentKind::Video => RenditionKind::Stream,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub code: FailureCode,
    pub message: String,
}

impl JobError {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderJob {
    pub id: String,
    pub asset_id: String,
    pub extension: String,
    pub kind: RenditionKind,
    pub status: JobStatus,
    /// Name of the render agent the job was routed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default)]
    pub attempts: u32,
    /// Job id assigned by the external encoder for delegated conversions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Where the external encoder will publish its output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_location: Option<String>,
    /// Node whose worker started the job. Set while in progress.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl RenderJob {
    /// A job waiting for a worker of `agent`.
    pub fn pending(asset_id: &str, extension: &str, agent: &str, kind: RenditionKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            asset_id: asset_id.to_string(),
            extension: extension.to_string(),
            kind,
            status: JobStatus::Pending,
            agent: Some(agent.to_string()),
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            attempts: 0,
            external_id: None,
            output_location: None,
            node_id: None,
        }
    }

    /// A job resolved at admission time with a placeholder rendition.
    pub fn placeholder(asset_id: &str, extension: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            asset_id: asset_id.to_string(),
            extension: extension.to_string(),
            kind: RenditionKind::Placeholder,
            status: JobStatus::Completed,
            agent: None,
            enqueued_at: now,
            started_at: None,
            finished_at: Some(now),
            error: None,
            attempts: 0,
            external_id: None,
            output_location: None,
            node_id: None,
        }
    }

    /// A job rejected at admission time.
    pub fn rejected(
        asset_id: &str,
        extension: &str,
        agent: Option<&str>,
        kind: RenditionKind,
        error: JobError,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            asset_id: asset_id.to_string(),
            extension: extension.to_string(),
            kind,
            status: JobStatus::Failed,
            agent: agent.map(str::to_string),
            enqueued_at: now,
            started_at: None,
            finished_at: Some(now),
            error: Some(error),
            attempts: 0,
            external_id: None,
            output_location: None,
            node_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_started(&mut self, node_id: &str) {
        self.status = JobStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
        self.node_id = Some(node_id.to_string());
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.node_id.as_deref() == Some(node_id)
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: JobError) {
        self.status = JobStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    /// Returns a crashed in-progress job to the queue.
    pub fn reset_to_pending(&mut self) {
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.node_id = None;
    }
}
