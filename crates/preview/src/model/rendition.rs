use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RenditionSource {
    Rendered,
    Placeholder { group: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// The derived artifact of a completed job. Never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rendition {
    pub job_id: String,
    /// Uploader-assigned location.
    pub location: String,
    pub content_type: String,
    pub size: u64,
    pub source: RenditionSource,
    pub node_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    /// Locations of further pages for multi-page renders.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_locations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Rendition {
    pub fn is_placeholder(&self) -> bool {
        matches!(self.source, RenditionSource::Placeholder { .. })
    }
}
