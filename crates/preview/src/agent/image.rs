//! Raster previews through ImageMagick `convert`.
//!
//! PDFs are rasterized page by page up to `maxPages`; animated GIFs use
//! their first frame. All pages share one timeout.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use crate::agent::command::run_with_timeout;
use crate::agent::{
    fetch_source, job_dir, remove_stale_job_dirs, ConvertOutcome, RenderContext, RenderedArtifact,
    Renderer,
};
use crate::config::{AgentKind, RendererParams};
use crate::error::RenderError;
use crate::model::Dimensions;

const DEFAULT_SIZE: u32 = 1024;
const DEFAULT_DENSITY: u32 = 72;
const DEFAULT_MAX_PAGES: u32 = 1;

pub struct ImageRenderer {
    convert: String,
    size: u32,
    density: u32,
    max_pages: u32,
    temp_base: PathBuf,
}

impl ImageRenderer {
    pub fn from_params(params: &RendererParams) -> Self {
        Self {
            convert: params.get_str("convertPath").unwrap_or("convert").to_string(),
            size: param_u32(params, "size", DEFAULT_SIZE),
            density: param_u32(params, "density", DEFAULT_DENSITY),
            max_pages: param_u32(params, "maxPages", DEFAULT_MAX_PAGES).max(1),
            temp_base: params
                .get_str("tempFileBasePath")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("preview-image")),
        }
    }

    /// Number of pages to render for `source`.
    fn page_count(&self, source: &Path, extension: &str) -> Result<u32, RenderError> {
        if extension != "pdf" {
            return Ok(1);
        }
        let document = lopdf::Document::load(source)
            .map_err(|e| RenderError::Conversion(format!("unreadable PDF: {}", e)))?;
        let pages = document.get_pages().len() as u32;
        if pages == 0 {
            return Err(RenderError::Conversion("PDF has no pages".to_string()));
        }
        Ok(pages.min(self.max_pages))
    }

    fn convert_command(&self, source: &Path, extension: &str, page: u32, output: &Path) -> Command {
        let resize = format!("{}x{}", self.size, self.size);
        let mut cmd = Command::new(&self.convert);
        match extension {
            "pdf" => {
                cmd.arg("-density")
                    .arg(self.density.to_string())
                    .args(["-colorspace", "RGB"])
                    .arg(format!("{}[{}]", source.display(), page))
                    .args(["-resize", &resize, "-flatten", "+adjoin"]);
            }
            "gif" => {
                cmd.arg(format!("{}[0]", source.display()))
                    .args(["-resize", &resize]);
            }
            _ => {
                cmd.arg(source).args(["-resize", &resize]);
            }
        }
        cmd.arg(output);
        cmd
    }
}

fn param_u32(params: &RendererParams, key: &str, default: u32) -> u32 {
    params
        .get_u64(key)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

impl Renderer for ImageRenderer {
    fn kind(&self) -> AgentKind {
        AgentKind::Image
    }

    fn convert(&self, ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError> {
        let source = fetch_source(ctx)?;
        let extension = ctx.asset.extension.as_str();
        let pages = self.page_count(source.path(), extension)?;
        let workdir = job_dir(&self.temp_base)?;
        let deadline = Instant::now() + ctx.timeout;
        let timed_out = || RenderError::Timeout {
            after_secs: ctx.timeout.as_secs(),
        };

        let mut locations = Vec::with_capacity(pages as usize);
        let mut first: Option<(u64, Option<Dimensions>)> = None;
        for page in 0..pages {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }

            let output = workdir.path().join(format!("page-{}.png", page));
            run_with_timeout(
                &mut self.convert_command(source.path(), extension, page, &output),
                remaining,
            )
            .map_err(|e| match e {
                RenderError::Timeout { .. } => timed_out(),
                other => other,
            })?;

            if first.is_none() {
                let size = std::fs::metadata(&output)
                    .map_err(|_| RenderError::Conversion("convert produced no image".to_string()))?
                    .len();
                let dimensions = image::image_dimensions(&output)
                    .ok()
                    .map(|(width, height)| Dimensions { width, height });
                first = Some((size, dimensions));
            }

            let hint = format!("{}/{}/{}", ctx.asset.id, self.size, page);
            locations.push(ctx.uploader.upload(&output, &hint)?);
        }

        let (size, dimensions) = first.unwrap_or((0, None));
        let mut locations = locations.into_iter();
        let location = locations
            .next()
            .ok_or_else(|| RenderError::Conversion("no pages rendered".to_string()))?;

        log::info!(
            "Rendered {} page(s) of {} to {}",
            pages,
            ctx.job.id,
            location
        );

        Ok(ConvertOutcome::Rendered(RenderedArtifact {
            location,
            content_type: "image/png".to_string(),
            size,
            dimensions,
            additional_locations: locations.collect(),
        }))
    }

    fn cleanup_stale(&self) {
        remove_stale_job_dirs(&self.temp_base);
    }
}
