//! Office documents to PDF through LibreOffice.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::agent::command::run_with_timeout;
use crate::agent::{
    fetch_source, job_dir, remove_stale_job_dirs, ConvertOutcome, RenderContext, RenderedArtifact,
    Renderer,
};
use crate::config::{AgentKind, RendererParams};
use crate::error::RenderError;

pub struct DocumentRenderer {
    soffice: String,
    temp_base: PathBuf,
}

impl DocumentRenderer {
    pub fn new(soffice: impl Into<String>, temp_base: PathBuf) -> Self {
        Self {
            soffice: soffice.into(),
            temp_base,
        }
    }

    /// Reads `tempFileBasePath` and `sofficePath`.
    pub fn from_params(params: &RendererParams) -> Self {
        let temp_base = params
            .get_str("tempFileBasePath")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("preview-document"));
        let soffice = params.get_str("sofficePath").unwrap_or("soffice");
        Self::new(soffice, temp_base)
    }

    fn soffice_command(&self, input: &Path, outdir: &Path) -> Command {
        let mut cmd = Command::new(&self.soffice);
        cmd.args([
            "--headless",
            "--nologo",
            "--nofirststartwizard",
            "--convert-to",
            "pdf",
        ])
        .arg(input)
        .arg("--outdir")
        .arg(outdir);
        cmd
    }
}

impl Renderer for DocumentRenderer {
    fn kind(&self) -> AgentKind {
        AgentKind::Document
    }

    fn convert(&self, ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError> {
        let source = fetch_source(ctx)?;
        let workdir = job_dir(&self.temp_base)?;

        // soffice names its output after the input stem
        let input = workdir
            .path()
            .join(format!("{}.{}", ctx.asset.id, ctx.asset.extension));
        std::fs::copy(source.path(), &input)
            .map_err(|e| RenderError::Transient(format!("staging input failed: {}", e)))?;

        let output_dir = workdir.path().join("out");
        std::fs::create_dir_all(&output_dir)
            .map_err(|e| RenderError::Transient(format!("{}: {}", output_dir.display(), e)))?;

        run_with_timeout(&mut self.soffice_command(&input, &output_dir), ctx.timeout)?;

        let pdf = output_dir.join(format!("{}.pdf", ctx.asset.id));
        let size = std::fs::metadata(&pdf)
            .map_err(|_| RenderError::Conversion("soffice produced no PDF".to_string()))?
            .len();

        let location = ctx
            .uploader
            .upload(&pdf, &format!("{}/pdf", ctx.asset.id))?;

        log::info!(
            "Rendered {} ({}) to {}",
            ctx.job.id,
            ctx.asset.extension,
            location
        );

        Ok(ConvertOutcome::Rendered(RenderedArtifact {
            location,
            content_type: "application/pdf".to_string(),
            size,
            dimensions: None,
            additional_locations: Vec::new(),
        }))
    }

    fn cleanup_stale(&self) {
        remove_stale_job_dirs(&self.temp_base);
    }
}
