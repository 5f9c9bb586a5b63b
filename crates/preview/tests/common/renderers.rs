//! Scripted renderers standing in for the external converters.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use preview::agent::{ConvertOutcome, RenderContext, RenderedArtifact};
use preview::{AgentKind, RenderError, Renderer};

fn artifact(ctx: &RenderContext<'_>) -> RenderedArtifact {
    RenderedArtifact {
        location: format!("local:///{}/pdf", ctx.asset.id),
        content_type: "application/pdf".to_string(),
        size: 42,
        dimensions: None,
        additional_locations: vec![],
    }
}

/// Sleeps for `delay`, then renders. Tracks how many conversions overlap.
pub struct SlowRenderer {
    kind: AgentKind,
    delay: Duration,
    current: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub converted: Mutex<Vec<String>>,
}

impl SlowRenderer {
    pub fn new(kind: AgentKind, delay: Duration) -> Self {
        Self {
            kind,
            delay,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            converted: Mutex::new(Vec::new()),
        }
    }

    pub fn instant(kind: AgentKind) -> Self {
        Self::new(kind, Duration::ZERO)
    }
}

impl Renderer for SlowRenderer {
    fn kind(&self) -> AgentKind {
        self.kind
    }

    fn convert(&self, ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        thread::sleep(self.delay);
        self.converted.lock().unwrap().push(ctx.job.id.clone());

        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(ConvertOutcome::Rendered(artifact(ctx)))
    }

    fn cleanup_stale(&self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fails every attempt with the error produced by `make`.
pub struct FailingRenderer {
    make: fn() -> RenderError,
    pub calls: AtomicUsize,
}

impl FailingRenderer {
    pub fn new(make: fn() -> RenderError) -> Self {
        Self {
            make,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Renderer for FailingRenderer {
    fn kind(&self) -> AgentKind {
        AgentKind::Document
    }

    fn convert(&self, _ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err((self.make)())
    }
}

/// Hands every job to a pretend encoder and remembers cancellations.
#[derive(Default)]
pub struct DelegatingRenderer {
    /// How long the encoder takes to accept a job.
    accept_delay: Duration,
    pub cancelled: Mutex<Vec<String>>,
}

impl DelegatingRenderer {
    pub fn accepting_after(accept_delay: Duration) -> Self {
        Self {
            accept_delay,
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn external_id(job_id: &str) -> String {
        format!("enc-{}", job_id)
    }

    pub fn playlist(asset_id: &str, job_id: &str) -> String {
        format!("s3://videos/{}/{}.m3u8", asset_id, job_id)
    }
}

impl Renderer for DelegatingRenderer {
    fn kind(&self) -> AgentKind {
        AgentKind::Video
    }

    fn convert(&self, ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError> {
        thread::sleep(self.accept_delay);
        Ok(ConvertOutcome::Delegated {
            external_id: Self::external_id(&ctx.job.id),
            output_location: Self::playlist(&ctx.asset.id, &ctx.job.id),
        })
    }

    fn cancel(&self, external_id: &str) -> Result<(), RenderError> {
        self.cancelled.lock().unwrap().push(external_id.to_string());
        Ok(())
    }
}
