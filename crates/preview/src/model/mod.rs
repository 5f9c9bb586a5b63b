//! Records persisted by the storage backend.

pub mod asset;
pub mod job;
pub mod rendition;

use serde::{Deserialize, Serialize};

pub use asset::{Asset, AssetOrigin};
pub use job::{JobError, JobStatus, RenderJob, RenditionKind};
pub use rendition::{Dimensions, Rendition, RenditionSource};

pub fn asset_key(id: &str) -> String {
    format!("asset:{}", id)
}

pub fn job_key(id: &str) -> String {
    format!("job:{}", id)
}

pub fn rendition_key(job_id: &str) -> String {
    format!("rendition:{}", job_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "lowercase")]
pub enum Record {
    Asset(Asset),
    Job(RenderJob),
    Rendition(Rendition),
}

impl Record {
    pub fn key(&self) -> String {
        match self {
            Record::Asset(asset) => asset_key(&asset.id),
            Record::Job(job) => job_key(&job.id),
            Record::Rendition(rendition) => rendition_key(&rendition.job_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Record::Asset(_) => "asset",
            Record::Job(_) => "job",
            Record::Rendition(_) => "rendition",
        }
    }

    pub fn as_job(&self) -> Option<&RenderJob> {
        match self {
            Record::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn into_job(self) -> Option<RenderJob> {
        match self {
            Record::Job(job) => Some(job),
            _ => None,
        }
    }

    pub fn into_asset(self) -> Option<Asset> {
        match self {
            Record::Asset(asset) => Some(asset),
            _ => None,
        }
    }

    pub fn into_rendition(self) -> Option<Rendition> {
        match self {
            Record::Rendition(rendition) => Some(rendition),
            _ => None,
        }
    }
}
