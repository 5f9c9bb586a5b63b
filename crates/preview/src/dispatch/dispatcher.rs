use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, info_span, warn};

use crate::agent::{build_renderer, AgentPool, AgentReport, Renderer, WorkerDeps};
use crate::config::{normalize_extension, validate_config, AgentKind, AppConfig};
use crate::dispatch::events::{JobEvent, JobEventBroadcaster};
use crate::dispatch::ledger::{JobLedger, Transition};
use crate::error::{DispatchError, FailureCode, PreviewError, TransferError};
use crate::model::{
    Asset, AssetOrigin, Dimensions, JobError, JobStatus, RenderJob, Rendition, RenditionKind,
    RenditionSource,
};
use crate::placeholder::PlaceholderProvider;
use crate::storage::{build_storage, Storage};
use crate::transfer::downloader::url_extension;
use crate::transfer::{build_downloader, build_uploader, Downloader, Uploader};

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A render request as received from a client.
#[derive(Debug, Clone)]
pub enum SubmitRequest {
    /// Raw bytes uploaded with the request.
    Bytes { data: Vec<u8>, extension: String },
    /// A location the downloader can fetch. `size` is the declared size, if
    /// known; the real size is checked again when the worker downloads it.
    Url {
        url: String,
        extension: Option<String>,
        size: Option<u64>,
    },
}

impl SubmitRequest {
    pub fn bytes(data: impl Into<Vec<u8>>, extension: &str) -> Self {
        SubmitRequest::Bytes {
            data: data.into(),
            extension: extension.to_string(),
        }
    }

    pub fn url(url: &str) -> Self {
        SubmitRequest::Url {
            url: url.to_string(),
            extension: None,
            size: None,
        }
    }

    /// A file on this node, referenced in place.
    pub fn local_file(path: &Path) -> Result<Self, TransferError> {
        let path = path.canonicalize().map_err(|source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let size = std::fs::metadata(&path)
            .map_err(|source| TransferError::Io {
                path: path.clone(),
                source,
            })?
            .len();
        Ok(SubmitRequest::Url {
            url: format!("file://{}", path.display()),
            extension: path
                .extension()
                .map(|e| e.to_string_lossy().to_string()),
            size: Some(size),
        })
    }

    pub fn with_size(self, declared: u64) -> Self {
        match self {
            SubmitRequest::Url { url, extension, .. } => SubmitRequest::Url {
                url,
                extension,
                size: Some(declared),
            },
            other => other,
        }
    }

    pub fn extension(&self) -> String {
        match self {
            SubmitRequest::Bytes { extension, .. } => normalize_extension(extension),
            SubmitRequest::Url { url, extension, .. } => extension
                .as_deref()
                .map(normalize_extension)
                .or_else(|| url_extension(url))
                .unwrap_or_default(),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            SubmitRequest::Bytes { data, .. } => data.len() as u64,
            SubmitRequest::Url { size, .. } => size.unwrap_or(0),
        }
    }

    /// Origin recorded for a request that is not admitted: uploaded bytes
    /// are dropped, URLs are kept for reference.
    fn rejected_origin(&self) -> AssetOrigin {
        match self {
            SubmitRequest::Bytes { .. } => AssetOrigin::Inline,
            SubmitRequest::Url { url, .. } => AssetOrigin::Remote { url: url.clone() },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderState {
    Finished,
    Failed,
    Cancelled,
}

/// Callback body posted by the external encoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderNotification {
    pub state: EncoderState,
    #[serde(default)]
    pub output_url: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

impl EncoderNotification {
    pub fn finished(output_url: Option<&str>) -> Self {
        Self {
            state: EncoderState::Finished,
            output_url: output_url.map(str::to_string),
            size: None,
            message: None,
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            state: EncoderState::Failed,
            output_url: None,
            size: None,
            message: Some(message.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Applied(RenderJob),
    /// The job was already terminal; nothing changed.
    AlreadyTerminal(RenderJob),
}

/// Client-facing view of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub asset_id: String,
    pub extension: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<FailureCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_locations: Vec<String>,
    pub placeholder: bool,
    pub enqueued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    /// Jobs handed back to their agent's queue.
    pub requeued: usize,
    /// In-progress jobs found without a worker and reset to pending.
    pub reset: usize,
    /// Delegated jobs left waiting for their notification.
    pub delegated: usize,
    /// Jobs whose agent is no longer enabled.
    pub orphaned: usize,
    /// In-progress jobs started by another node sharing the store.
    pub foreign: usize,
}

#[derive(Debug, Clone)]
struct Route {
    agent: String,
    kind: AgentKind,
}

/// Wires configuration, storage, transfer and render agents together.
pub struct DispatcherBuilder {
    config: Arc<AppConfig>,
    storage: Option<Arc<dyn Storage>>,
    uploader: Option<Arc<dyn Uploader>>,
    downloader: Option<Arc<dyn Downloader>>,
    renderers: HashMap<String, Arc<dyn Renderer>>,
    event_capacity: usize,
}

impl DispatcherBuilder {
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn downloader(mut self, downloader: Arc<dyn Downloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Uses `renderer` for agent `name` instead of the configured one.
    pub fn renderer(mut self, name: &str, renderer: Arc<dyn Renderer>) -> Self {
        self.renderers.insert(name.to_string(), renderer);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(mut self) -> Result<Dispatcher, PreviewError> {
        let config = self.config;
        validate_config(&config)?;
        let common = &config.common;

        let storage = match self.storage.take() {
            Some(storage) => storage,
            None => build_storage(&config.storage)?,
        };
        let uploader = match self.uploader.take() {
            Some(uploader) => uploader,
            None => build_uploader(&config.uploader)?,
        };
        let asset_root = PathBuf::from(&common.local_asset_storage_path);
        let downloader = match self.downloader.take() {
            Some(downloader) => downloader,
            None => build_downloader(&config.downloader, &asset_root)?,
        };

        let events = JobEventBroadcaster::new(self.event_capacity);
        let ledger = Arc::new(JobLedger::new(storage, events.clone(), &common.node_id));
        let placeholders = PlaceholderProvider::new(common);

        let mut routes = HashMap::new();
        let mut agents = Vec::new();
        for (name, spec) in config.enabled_agents() {
            let kind = spec.resolve_kind(name)?;
            for extension in spec.file_types.keys() {
                routes.insert(
                    extension.clone(),
                    Route {
                        agent: name.clone(),
                        kind,
                    },
                );
            }
            let renderer = match self.renderers.remove(name.as_str()) {
                Some(renderer) => renderer,
                None => build_renderer(name, spec)?,
            };
            agents.push((name.clone(), kind, spec.clone(), renderer));
        }

        let mut pools = BTreeMap::new();
        if common.work_dispatcher_enabled {
            let deps = WorkerDeps {
                ledger: ledger.clone(),
                downloader,
                uploader,
                node_id: common.node_id.clone(),
            };
            for (name, kind, spec, renderer) in agents {
                let pool = AgentPool::start(&name, kind, spec, renderer, deps.clone())?;
                pools.insert(name, pool);
            }
        } else {
            info!("Work dispatcher disabled; no render agents started");
        }

        Ok(Dispatcher {
            config,
            ledger,
            events,
            placeholders,
            routes,
            pools,
            asset_root,
        })
    }
}

/// Admits render requests, routes them to agent pools and answers status
/// queries from storage.
pub struct Dispatcher {
    config: Arc<AppConfig>,
    ledger: Arc<JobLedger>,
    events: JobEventBroadcaster,
    placeholders: PlaceholderProvider,
    routes: HashMap<String, Route>,
    pools: BTreeMap<String, AgentPool>,
    asset_root: PathBuf,
}

impl Dispatcher {
    pub fn builder(config: Arc<AppConfig>) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            storage: None,
            uploader: None,
            downloader: None,
            renderers: HashMap::new(),
            event_capacity: 256,
        }
    }

    /// Builds every collaborator from `config`.
    pub fn from_config(config: AppConfig) -> Result<Self, PreviewError> {
        Self::builder(Arc::new(config)).build()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn placeholders(&self) -> &PlaceholderProvider {
        &self.placeholders
    }

    pub fn is_enabled(&self) -> bool {
        self.config.common.work_dispatcher_enabled
    }

    /// Admits a request and returns the job id.
    ///
    /// Requests no enabled agent handles complete immediately with their
    /// group's placeholder, or fail with `UnsupportedType` when no group
    /// covers them. Both outcomes are persisted before returning.
    pub fn submit(&self, request: SubmitRequest) -> Result<String, DispatchError> {
        if !self.is_enabled() {
            return Err(DispatchError::DispatchDisabled);
        }

        let extension = request.extension();
        let size = request.size();
        let span = info_span!("dispatch.submit", extension = %extension, size);
        let _enter = span.enter();

        let Some(route) = self.routes.get(&extension) else {
            return self.admit_unrouted(&request, &extension, size);
        };

        let spec = self.config.render_agents.get(&route.agent);
        if let Some(limit) = spec.and_then(|s| s.limit_for(&extension)) {
            if size > limit {
                let asset = Asset::new(&extension, size, request.rejected_origin());
                self.ledger.put_asset(&asset)?;
                let job = RenderJob::rejected(
                    &asset.id,
                    &extension,
                    Some(&route.agent),
                    route.kind.into(),
                    JobError::new(
                        FailureCode::AssetTooLarge,
                        format!("asset is {} bytes, limit for {} is {}", size, extension, limit),
                    ),
                );
                self.ledger.create(&job)?;
                info!(job_id = %job.id, size, limit, "Rejected oversized asset");
                return Err(DispatchError::AssetTooLarge {
                    job_id: job.id,
                    size,
                    limit,
                });
            }
        }

        let asset = self.ingest(request, &extension)?;
        let job = RenderJob::pending(&asset.id, &extension, &route.agent, route.kind.into());
        if let Err(e) = self
            .ledger
            .put_asset(&asset)
            .and_then(|()| self.ledger.create(&job))
        {
            discard_retained(&asset);
            return Err(e.into());
        }

        let pool = self
            .pools
            .get(&route.agent)
            .ok_or_else(|| DispatchError::QueueClosed(route.agent.clone()))?;
        pool.submit(&job.id)?;

        info!(job_id = %job.id, agent = %route.agent, "Job queued");
        Ok(job.id)
    }

    fn admit_unrouted(
        &self,
        request: &SubmitRequest,
        extension: &str,
        size: u64,
    ) -> Result<String, DispatchError> {
        let asset = Asset::new(extension, size, request.rejected_origin());
        self.ledger.put_asset(&asset)?;

        match self.placeholders.for_extension(extension) {
            Ok(placeholder) => {
                let job = RenderJob::placeholder(&asset.id, extension);
                let rendition = Rendition {
                    job_id: job.id.clone(),
                    location: placeholder.location.clone(),
                    content_type: placeholder.content_type.clone(),
                    size: placeholder.size,
                    source: RenditionSource::Placeholder {
                        group: placeholder.group.clone(),
                    },
                    node_id: self.ledger.node_id().to_string(),
                    dimensions: placeholder.dimensions,
                    additional_locations: Vec::new(),
                    created_at: Utc::now(),
                };
                self.ledger.store_rendition(&rendition)?;
                self.ledger.create(&job)?;
                info!(job_id = %job.id, group = %placeholder.group, "Resolved with placeholder");
                Ok(job.id)
            }
            Err(_) => {
                let job = RenderJob::rejected(
                    &asset.id,
                    extension,
                    None,
                    RenditionKind::Placeholder,
                    JobError::new(
                        FailureCode::UnsupportedType,
                        format!("no render agent or placeholder group for '{}'", extension),
                    ),
                );
                self.ledger.create(&job)?;
                info!(job_id = %job.id, "Rejected unsupported type");
                Err(DispatchError::UnsupportedType {
                    job_id: job.id,
                    extension: extension.to_string(),
                })
            }
        }
    }

    /// Retains uploaded bytes under the local asset storage path.
    fn ingest(&self, request: SubmitRequest, extension: &str) -> Result<Asset, DispatchError> {
        match request {
            SubmitRequest::Bytes { data, .. } => {
                let mut asset = Asset::new(extension, data.len() as u64, AssetOrigin::Inline);
                let file_name = if extension.is_empty() {
                    asset.id.clone()
                } else {
                    format!("{}.{}", asset.id, extension)
                };
                let path = self.asset_root.join(file_name);

                std::fs::create_dir_all(&self.asset_root).map_err(|source| TransferError::Io {
                    path: self.asset_root.clone(),
                    source,
                })?;
                std::fs::write(&path, &data).map_err(|source| TransferError::Io {
                    path: path.clone(),
                    source,
                })?;

                asset.origin = AssetOrigin::Local { path };
                Ok(asset)
            }
            SubmitRequest::Url { url, size, .. } => Ok(Asset::new(
                extension,
                size.unwrap_or(0),
                AssetOrigin::Remote { url },
            )),
        }
    }

    pub fn status(&self, job_id: &str) -> Result<RenderJob, DispatchError> {
        self.ledger
            .job(job_id)?
            .ok_or_else(|| DispatchError::NotFound(job_id.to_string()))
    }

    pub fn rendition(&self, job_id: &str) -> Result<Option<Rendition>, DispatchError> {
        Ok(self.ledger.rendition(job_id)?)
    }

    pub fn report(&self, job_id: &str) -> Result<JobReport, DispatchError> {
        let job = self.status(job_id)?;
        let rendition = match job.status {
            JobStatus::Completed => self.ledger.rendition(job_id)?,
            _ => None,
        };

        Ok(JobReport {
            job_id: job.id.clone(),
            asset_id: job.asset_id.clone(),
            extension: job.extension.clone(),
            status: job.status,
            agent: job.agent.clone(),
            attempts: job.attempts,
            error_code: job.error.as_ref().map(|e| e.code),
            error_message: job.error.as_ref().map(|e| e.message.clone()),
            location: rendition.as_ref().map(|r| r.location.clone()),
            content_type: rendition.as_ref().map(|r| r.content_type.clone()),
            dimensions: rendition.as_ref().and_then(|r| r.dimensions),
            additional_locations: rendition
                .as_ref()
                .map(|r| r.additional_locations.clone())
                .unwrap_or_default(),
            placeholder: rendition.as_ref().is_some_and(Rendition::is_placeholder),
            enqueued_at: job.enqueued_at,
            finished_at: job.finished_at,
        })
    }

    /// What a client should show for the job: the rendition when there is
    /// one, otherwise the group placeholder for a failed job. Nothing is
    /// stored for the fallback.
    pub fn display_location(&self, job_id: &str) -> Result<Option<String>, DispatchError> {
        let job = self.status(job_id)?;
        if let Some(rendition) = self.ledger.rendition(job_id)? {
            return Ok(Some(rendition.location));
        }
        if job.status == JobStatus::Failed {
            return Ok(self
                .placeholders
                .for_extension(&job.extension)
                .ok()
                .map(|p| p.location.clone()));
        }
        Ok(None)
    }

    /// Resolves a delegated job from its encoder callback. Repeated
    /// notifications for a terminal job are acknowledged and change nothing.
    pub fn notify_completion(
        &self,
        job_id: &str,
        notification: EncoderNotification,
    ) -> Result<Resolution, DispatchError> {
        let job = self.status(job_id)?;
        if job.is_terminal() {
            debug!(job_id, status = %job.status, "Duplicate encoder notification");
            return Ok(Resolution::AlreadyTerminal(job));
        }
        if job.kind != RenditionKind::Stream || job.external_id.is_none() {
            warn!(job_id, agent = ?job.agent, "Encoder notification for a job not delegated");
            return Err(DispatchError::NotDelegated(job_id.to_string()));
        }

        let transition = match notification.state {
            EncoderState::Finished => {
                match notification.output_url.or_else(|| job.output_location.clone()) {
                    Some(location) => {
                        let rendition = Rendition {
                            job_id: job.id.clone(),
                            location,
                            content_type: PLAYLIST_CONTENT_TYPE.to_string(),
                            size: notification.size.unwrap_or(0),
                            source: RenditionSource::Rendered,
                            node_id: self.ledger.node_id().to_string(),
                            dimensions: None,
                            additional_locations: Vec::new(),
                            created_at: Utc::now(),
                        };
                        self.ledger.resolve_completed(rendition, None)?
                    }
                    None => self.ledger.resolve_failed(
                        job_id,
                        JobError::new(
                            FailureCode::ConversionFailed,
                            "encoder finished without an output location",
                        ),
                        None,
                    )?,
                }
            }
            EncoderState::Failed | EncoderState::Cancelled => {
                let message = notification
                    .message
                    .unwrap_or_else(|| format!("encoder reported {:?}", notification.state));
                self.ledger.resolve_failed(
                    job_id,
                    JobError::new(FailureCode::ConversionFailed, message),
                    None,
                )?
            }
        };

        match transition {
            Transition::Applied(job) => {
                info!(job_id, status = %job.status, "Encoder notification applied");
                Ok(Resolution::Applied(job))
            }
            Transition::Rejected(job) => Ok(Resolution::AlreadyTerminal(job)),
            Transition::Missing => Err(DispatchError::NotFound(job_id.to_string())),
        }
    }

    /// Cancels a job that is not yet terminal. Only delegated agents can
    /// cancel; the encoder is asked to stop and the job fails immediately.
    pub fn cancel(&self, job_id: &str) -> Result<(), DispatchError> {
        let job = self.status(job_id)?;
        if job.is_terminal() {
            return Ok(());
        }

        let agent = job.agent.clone().unwrap_or_default();
        let pool = self.pools.get(&agent);
        if pool.map(AgentPool::kind) != Some(AgentKind::Video) {
            return Err(DispatchError::CancellationUnsupported {
                job_id: job.id,
                agent,
            });
        }

        if let (Some(pool), Some(external_id)) = (pool, job.external_id.as_deref()) {
            if let Err(e) = pool.renderer().cancel(external_id) {
                warn!(job_id, external_id, error = %e, "Encoder did not acknowledge cancel");
            }
        }
        self.ledger.resolve_failed(
            job_id,
            JobError::new(FailureCode::ConversionFailed, "cancelled"),
            None,
        )?;
        Ok(())
    }

    /// Restores work after a restart: clears renderer scratch space, resets
    /// in-progress jobs this node abandoned and re-enqueues everything
    /// pending in submission order. Jobs another node is running are left
    /// alone.
    pub fn recover(&self) -> Result<RecoveryReport, DispatchError> {
        if !self.is_enabled() {
            return Err(DispatchError::DispatchDisabled);
        }

        for pool in self.pools.values() {
            pool.renderer().cleanup_stale();
        }

        let mut jobs = self.ledger.jobs_where(|job| !job.is_terminal())?;
        jobs.sort_by_key(|job| job.enqueued_at);

        let mut report = RecoveryReport::default();
        for job in jobs {
            if job.status == JobStatus::InProgress {
                if !job.is_owned_by(self.ledger.node_id()) {
                    debug!(job_id = %job.id, owner = ?job.node_id, "Leaving job of another node");
                    report.foreign += 1;
                    continue;
                }
                if job.external_id.is_some() {
                    report.delegated += 1;
                    continue;
                }
                match self.ledger.reset_to_pending(&job.id)? {
                    Transition::Applied(_) => report.reset += 1,
                    _ => continue,
                }
            }

            let pool = job.agent.as_deref().and_then(|agent| self.pools.get(agent));
            match pool {
                Some(pool) => {
                    pool.submit(&job.id)?;
                    report.requeued += 1;
                }
                None => {
                    warn!(job_id = %job.id, agent = ?job.agent, "No enabled agent for pending job");
                    report.orphaned += 1;
                }
            }
        }

        info!(
            requeued = report.requeued,
            reset = report.reset,
            delegated = report.delegated,
            orphaned = report.orphaned,
            foreign = report.foreign,
            "Recovery finished"
        );
        Ok(report)
    }

    /// Polls until the job is terminal or `timeout` passes, returning the
    /// last stored state either way.
    pub fn wait_for(&self, job_id: &str, timeout: Duration) -> Result<RenderJob, DispatchError> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.status(job_id)?;
            if job.is_terminal() || Instant::now() >= deadline {
                return Ok(job);
            }
            thread::sleep(STATUS_POLL_INTERVAL);
        }
    }

    pub fn agent_reports(&self) -> Vec<AgentReport> {
        self.pools.values().map(AgentPool::report).collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Stops all agents and waits for in-flight conversions to finish.
    pub fn shutdown(&self) {
        for pool in self.pools.values() {
            pool.shutdown();
        }
        for pool in self.pools.values() {
            pool.wait();
        }
    }
}

/// Removes bytes retained by `ingest` for an asset that was never recorded.
fn discard_retained(asset: &Asset) {
    if let AssetOrigin::Local { path } = &asset.origin {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Could not remove unrecorded asset");
        }
    }
}
