//! Render agents: one worker pool per rendering technology, each driving a
//! [`Renderer`] that wraps an external converter.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AgentKind, RenderAgentSpec};
use crate::error::{ConfigError, RenderError};
use crate::model::{Asset, Dimensions, RenderJob};
use crate::transfer::{Downloader, FetchedFile, Uploader};

pub mod command;
pub mod document;
pub mod image;
pub mod pool;
pub mod video;

pub use document::DocumentRenderer;
pub use image::ImageRenderer;
pub use pool::{AgentPool, AgentReport, WorkLedger, WorkerDeps};
pub use video::VideoRenderer;

/// Prefix of per-job scratch directories; anything left with it after a
/// crash is removed by [`Renderer::cleanup_stale`].
pub const JOB_DIR_PREFIX: &str = "preview-job-";

/// Everything a renderer needs for one conversion attempt.
pub struct RenderContext<'a> {
    pub job: &'a RenderJob,
    pub asset: &'a Asset,
    pub downloader: &'a dyn Downloader,
    pub uploader: &'a dyn Uploader,
    /// Byte limit for the asset's extension, `None` when unlimited.
    pub limit: Option<u64>,
    pub timeout: Duration,
    pub node_id: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedArtifact {
    pub location: String,
    pub content_type: String,
    pub size: u64,
    pub dimensions: Option<Dimensions>,
    pub additional_locations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertOutcome {
    Rendered(RenderedArtifact),
    /// Handed to an external service; resolved later by its notification.
    Delegated {
        external_id: String,
        output_location: String,
    },
}

pub trait Renderer: Send + Sync {
    fn kind(&self) -> AgentKind;

    fn convert(&self, ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError>;

    /// Cancels a delegated conversion. Synchronous renderers cannot.
    fn cancel(&self, _external_id: &str) -> Result<(), RenderError> {
        Err(RenderError::CancellationUnsupported {
            agent: self.kind().as_str().to_string(),
        })
    }

    /// Removes scratch state left behind by a previous process.
    fn cleanup_stale(&self) {}
}

pub fn build_renderer(
    name: &str,
    spec: &RenderAgentSpec,
) -> Result<Arc<dyn Renderer>, ConfigError> {
    let renderer: Arc<dyn Renderer> = match spec.resolve_kind(name)? {
        AgentKind::Document => Arc::new(DocumentRenderer::from_params(&spec.renderer_params)),
        AgentKind::Image => Arc::new(ImageRenderer::from_params(&spec.renderer_params)),
        AgentKind::Video => Arc::new(VideoRenderer::from_params(&spec.renderer_params)?),
    };
    Ok(renderer)
}

/// Downloads the asset and re-checks its real size against the limit.
pub fn fetch_source(ctx: &RenderContext<'_>) -> Result<FetchedFile, RenderError> {
    let url = ctx
        .asset
        .origin
        .source_url()
        .ok_or_else(|| RenderError::Conversion("asset bytes were not retained".to_string()))?;

    let fetched = ctx.downloader.fetch(&url)?;
    if let Some(limit) = ctx.limit {
        let size = fetched.size()?;
        if size > limit {
            return Err(RenderError::TooLarge { size, limit });
        }
    }
    Ok(fetched)
}

/// Creates a scratch directory for one job under `base`.
pub(crate) fn job_dir(base: &std::path::Path) -> Result<tempfile::TempDir, RenderError> {
    std::fs::create_dir_all(base)
        .map_err(|e| RenderError::Transient(format!("{}: {}", base.display(), e)))?;
    tempfile::Builder::new()
        .prefix(JOB_DIR_PREFIX)
        .tempdir_in(base)
        .map_err(|e| RenderError::Transient(format!("{}: {}", base.display(), e)))
}

/// Removes leftover job directories under `base`.
pub(crate) fn remove_stale_job_dirs(base: &std::path::Path) -> usize {
    let entries = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let stale: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with(JOB_DIR_PREFIX))
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();

    let mut removed = 0;
    for path in stale {
        match std::fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => log::warn!("Could not remove stale {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        log::info!("Removed {} stale job directories from {}", removed, base.display());
    }
    removed
}
