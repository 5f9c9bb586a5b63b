use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::agent::{ConvertOutcome, RenderContext, RenderedArtifact, Renderer};
use crate::config::{AgentKind, RenderAgentSpec};
use crate::error::{ConfigError, DispatchError, RenderError};
use crate::model::{Asset, RenderJob};
use crate::transfer::{Downloader, Uploader};

/// Channel capacity per worker; overflow waits in the ordered backlog.
const QUEUE_FACTOR: usize = 4;
const RECV_TIMEOUT: Duration = Duration::from_millis(100);
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Persisted job transitions driven by workers.
///
/// Every call returns only after the transition is stored, so a worker
/// never picks up its next job while the previous one still looks active.
pub trait WorkLedger: Send + Sync {
    /// Moves a pending job to in-progress. `None` when the job is gone or no
    /// longer pending.
    fn begin(&self, job_id: &str) -> Option<(RenderJob, Asset)>;

    fn complete(&self, job: &RenderJob, artifact: RenderedArtifact);

    /// Records a hand-off to an external service. `false` when the job was
    /// resolved meanwhile and the external work should be cancelled.
    fn delegate(&self, job: &RenderJob, external_id: String, output_location: String) -> bool;

    fn fail(&self, job: &RenderJob, error: &RenderError);
}

/// Shared collaborators handed to every worker.
#[derive(Clone)]
pub struct WorkerDeps {
    pub ledger: Arc<dyn WorkLedger>,
    pub downloader: Arc<dyn Downloader>,
    pub uploader: Arc<dyn Uploader>,
    pub node_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentReport {
    pub name: String,
    pub kind: AgentKind,
    pub count: usize,
    pub active_jobs: Vec<String>,
    pub queued: usize,
}

/// Bounded channel plus an ordered overflow backlog. Pushes and pumps hold
/// the backlog lock, so jobs reach the channel in submission order.
struct WorkQueue {
    sender: Sender<String>,
    receiver: Receiver<String>,
    backlog: Mutex<VecDeque<String>>,
}

impl WorkQueue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = bounded(capacity);
        Self {
            sender,
            receiver,
            backlog: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, job_id: String) -> bool {
        let mut backlog = match self.backlog.lock() {
            Ok(b) => b,
            Err(_) => return false,
        };
        if !backlog.is_empty() {
            backlog.push_back(job_id);
            return true;
        }
        match self.sender.try_send(job_id) {
            Ok(()) => true,
            Err(TrySendError::Full(job_id)) => {
                backlog.push_back(job_id);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Moves backlog entries into the channel while it has room.
    fn pump(&self) {
        let mut backlog = match self.backlog.lock() {
            Ok(b) => b,
            Err(_) => return,
        };
        while let Some(job_id) = backlog.pop_front() {
            match self.sender.try_send(job_id) {
                Ok(()) => continue,
                Err(TrySendError::Full(job_id)) | Err(TrySendError::Disconnected(job_id)) => {
                    backlog.push_front(job_id);
                    break;
                }
            }
        }
    }

    fn len(&self) -> usize {
        let backlog = self.backlog.lock().map(|b| b.len()).unwrap_or(0);
        self.receiver.len() + backlog
    }
}

/// A fixed set of worker threads serving one render agent.
pub struct AgentPool {
    name: String,
    kind: AgentKind,
    count: usize,
    renderer: Arc<dyn Renderer>,
    queue: Arc<WorkQueue>,
    active: Arc<Mutex<BTreeSet<String>>>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Worker {
    id: usize,
    agent: String,
    spec: Arc<RenderAgentSpec>,
    renderer: Arc<dyn Renderer>,
    queue: Arc<WorkQueue>,
    active: Arc<Mutex<BTreeSet<String>>>,
    shutdown: Arc<AtomicBool>,
    deps: WorkerDeps,
}

impl AgentPool {
    /// Starts `spec.count` workers.
    pub fn start(
        name: &str,
        kind: AgentKind,
        spec: RenderAgentSpec,
        renderer: Arc<dyn Renderer>,
        deps: WorkerDeps,
    ) -> Result<Self, ConfigError> {
        if spec.count == 0 {
            return Err(ConfigError::Validation {
                message: format!("Render agent '{}' must have at least one worker", name),
            });
        }
        let count = spec.count;
        let spec = Arc::new(spec);
        let queue = Arc::new(WorkQueue::new(count * QUEUE_FACTOR));
        let active = Arc::new(Mutex::new(BTreeSet::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(count);
        for id in 0..count {
            let worker = Worker {
                id,
                agent: name.to_string(),
                spec: Arc::clone(&spec),
                renderer: Arc::clone(&renderer),
                queue: Arc::clone(&queue),
                active: Arc::clone(&active),
                shutdown: Arc::clone(&shutdown),
                deps: deps.clone(),
            };
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, id))
                .spawn(move || worker.run());
            match handle {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("Failed to spawn worker {} for {}: {}", id, name, e),
            }
        }

        info!("Started {} workers for render agent {}", workers.len(), name);

        Ok(Self {
            name: name.to_string(),
            kind,
            count,
            renderer,
            queue,
            active,
            shutdown,
            workers: Mutex::new(workers),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn renderer(&self) -> &Arc<dyn Renderer> {
        &self.renderer
    }

    /// Queues a job without blocking.
    pub fn submit(&self, job_id: &str) -> Result<(), DispatchError> {
        if self.shutdown.load(Ordering::Relaxed) || !self.queue.push(job_id.to_string()) {
            return Err(DispatchError::QueueClosed(self.name.clone()));
        }
        Ok(())
    }

    pub fn report(&self) -> AgentReport {
        let active_jobs = self
            .active
            .lock()
            .map(|a| a.iter().cloned().collect())
            .unwrap_or_default();
        AgentReport {
            name: self.name.clone(),
            kind: self.kind,
            count: self.count,
            active_jobs,
            queued: self.queue.len(),
        }
    }

    pub fn shutdown(&self) {
        info!("Shutting down render agent {}...", self.name);
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Waits for workers to finish their current job and exit.
    pub fn wait(&self) {
        let workers = match self.workers.lock() {
            Ok(mut w) => std::mem::take(&mut *w),
            Err(_) => return,
        };
        for (i, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} of {} panicked: {:?}", i, self.name, e);
            } else {
                debug!("Worker {} of {} finished", i, self.name);
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

impl Drop for AgentPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wait();
    }
}

impl Worker {
    fn run(self) {
        debug!("Worker {} of {} started", self.id, self.agent);

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                debug!("Worker {} of {} received shutdown signal", self.id, self.agent);
                break;
            }

            match self.queue.receiver.recv_timeout(RECV_TIMEOUT) {
                Ok(job_id) => {
                    self.queue.pump();
                    self.process(&job_id);
                }
                Err(RecvTimeoutError::Timeout) => {
                    self.queue.pump();
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("Worker {} of {} queue disconnected", self.id, self.agent);
                    break;
                }
            }
        }

        debug!("Worker {} of {} stopped", self.id, self.agent);
    }

    fn set_active(&self, job_id: &str, active: bool) {
        if let Ok(mut set) = self.active.lock() {
            if active {
                set.insert(job_id.to_string());
            } else {
                set.remove(job_id);
            }
        }
    }

    fn process(&self, job_id: &str) {
        let Some((mut job, asset)) = self.deps.ledger.begin(job_id) else {
            debug!("Job {} is no longer pending, skipping", job_id);
            return;
        };

        self.set_active(job_id, true);
        let span = tracing::info_span!(
            "agent.convert",
            agent = %self.agent,
            job_id = %job.id,
            extension = %job.extension
        );
        let _enter = span.enter();

        let ctx = RenderContext {
            job: &job,
            asset: &asset,
            downloader: self.deps.downloader.as_ref(),
            uploader: self.deps.uploader.as_ref(),
            limit: self.spec.limit_for(&job.extension),
            timeout: Duration::from_secs(self.spec.timeout_seconds),
            node_id: &self.deps.node_id,
        };

        let max_attempts = self.spec.max_attempts.max(1);
        let mut attempt = 1;
        let result = loop {
            match self.renderer.convert(&ctx) {
                Err(e) if e.is_recoverable() && attempt < max_attempts => {
                    warn!(
                        "Job {} attempt {}/{} failed: {}; retrying",
                        job_id, attempt, max_attempts, e
                    );
                    thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                other => break other,
            }
        };

        job.attempts += attempt - 1;
        match result {
            Ok(ConvertOutcome::Rendered(artifact)) => self.deps.ledger.complete(&job, artifact),
            Ok(ConvertOutcome::Delegated {
                external_id,
                output_location,
            }) => {
                if !self
                    .deps
                    .ledger
                    .delegate(&job, external_id.clone(), output_location)
                {
                    info!("Job {} no longer wants {}, cancelling", job_id, external_id);
                    if let Err(e) = self.renderer.cancel(&external_id) {
                        warn!("Cancel of {} for job {} failed: {}", external_id, job_id, e);
                    }
                }
            }
            Err(e) => {
                warn!("Job {} failed after {} attempt(s): {}", job_id, attempt, e);
                self.deps.ledger.fail(&job, &e);
            }
        }

        self.set_active(job_id, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetOrigin, RenditionKind};
    use crate::transfer::{LocalUploader, SchemeDownloader};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingLedger {
        jobs: Mutex<HashMap<String, RenderJob>>,
        completed: Mutex<Vec<String>>,
        failed: Mutex<Vec<(String, u32)>>,
        started: Mutex<Vec<String>>,
        resolved_early: Mutex<Vec<String>>,
    }

    impl RecordingLedger {
        fn add(&self, job: RenderJob) {
            self.jobs.lock().unwrap().insert(job.id.clone(), job);
        }
    }

    impl WorkLedger for RecordingLedger {
        fn begin(&self, job_id: &str) -> Option<(RenderJob, Asset)> {
            let mut job = self.jobs.lock().unwrap().remove(job_id)?;
            job.mark_started("node");
            self.started.lock().unwrap().push(job_id.to_string());
            Some((job, Asset::new("txt", 1, AssetOrigin::Inline)))
        }

        fn complete(&self, job: &RenderJob, _artifact: RenderedArtifact) {
            self.completed.lock().unwrap().push(job.id.clone());
        }

        fn delegate(
            &self,
            job: &RenderJob,
            _external_id: String,
            _output_location: String,
        ) -> bool {
            !self.resolved_early.lock().unwrap().contains(&job.id)
        }

        fn fail(&self, job: &RenderJob, _error: &RenderError) {
            self.failed
                .lock()
                .unwrap()
                .push((job.id.clone(), job.attempts));
        }
    }

    /// Succeeds after `failures` recoverable errors.
    struct FlakyRenderer {
        failures: usize,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl Renderer for FlakyRenderer {
        fn kind(&self) -> AgentKind {
            AgentKind::Document
        }

        fn convert(&self, _ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError> {
            thread::sleep(self.delay);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(RenderError::Timeout { after_secs: 1 });
            }
            Ok(ConvertOutcome::Rendered(RenderedArtifact {
                location: "local:///x/pdf".to_string(),
                content_type: "application/pdf".to_string(),
                size: 1,
                dimensions: None,
                additional_locations: vec![],
            }))
        }
    }

    fn deps(dir: &TempDir, ledger: Arc<RecordingLedger>) -> WorkerDeps {
        WorkerDeps {
            ledger,
            downloader: Arc::new(SchemeDownloader::new(
                dir.path().join("dl"),
                dir.path().to_path_buf(),
                reqwest::blocking::Client::new(),
                None,
            )),
            uploader: Arc::new(LocalUploader::new(dir.path().join("up"))),
            node_id: "node".to_string(),
        }
    }

    fn spec(count: usize, max_attempts: u32) -> RenderAgentSpec {
        let mut spec = RenderAgentSpec::new(AgentKind::Document, count);
        spec.max_attempts = max_attempts;
        spec
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_pool_creation_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(RecordingLedger::default());
        let renderer = Arc::new(FlakyRenderer {
            failures: 0,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let pool = AgentPool::start(
            "doc",
            AgentKind::Document,
            spec(2, 1),
            renderer,
            deps(&dir, ledger),
        )
        .unwrap();

        assert!(!pool.is_shutdown());
        assert_eq!(pool.report().count, 2);

        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.submit("late"),
            Err(DispatchError::QueueClosed(_))
        ));
        pool.wait();
    }

    #[test]
    fn test_recoverable_errors_are_retried() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(RecordingLedger::default());
        let renderer = Arc::new(FlakyRenderer {
            failures: 2,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let pool = AgentPool::start(
            "doc",
            AgentKind::Document,
            spec(1, 3),
            renderer.clone(),
            deps(&dir, Arc::clone(&ledger)),
        )
        .unwrap();

        let job = RenderJob::pending("a", "docx", "doc", RenditionKind::Pdf);
        ledger.add(job.clone());
        pool.submit(&job.id).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            ledger.completed.lock().unwrap().contains(&job.id)
        }));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_attempts_fail_the_job() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(RecordingLedger::default());
        let renderer = Arc::new(FlakyRenderer {
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        });
        let pool = AgentPool::start(
            "doc",
            AgentKind::Document,
            spec(1, 2),
            renderer,
            deps(&dir, Arc::clone(&ledger)),
        )
        .unwrap();

        let job = RenderJob::pending("a", "docx", "doc", RenditionKind::Pdf);
        ledger.add(job.clone());
        pool.submit(&job.id).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            !ledger.failed.lock().unwrap().is_empty()
        }));
        let failed = ledger.failed.lock().unwrap().clone();
        assert_eq!(failed, vec![(job.id.clone(), 2)]);
        drop(pool);
    }

    #[test]
    fn test_start_order_follows_submission_order_under_backlog() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(RecordingLedger::default());
        let renderer = Arc::new(FlakyRenderer {
            failures: 0,
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(2),
        });
        let pool = AgentPool::start(
            "doc",
            AgentKind::Document,
            spec(1, 1),
            renderer,
            deps(&dir, Arc::clone(&ledger)),
        )
        .unwrap();

        // More than the channel holds, so part of it waits in the backlog.
        let ids: Vec<String> = (0..20)
            .map(|_| {
                let job = RenderJob::pending("a", "docx", "doc", RenditionKind::Pdf);
                ledger.add(job.clone());
                job.id
            })
            .collect();
        for id in &ids {
            pool.submit(id).unwrap();
        }

        assert!(wait_until(Duration::from_secs(10), || {
            ledger.completed.lock().unwrap().len() == ids.len()
        }));
        assert_eq!(*ledger.started.lock().unwrap(), ids);
        assert_eq!(pool.report().queued, 0);
    }

    /// Hands every job to an encoder and records cancellations.
    #[derive(Default)]
    struct HandOffRenderer {
        cancelled: Mutex<Vec<String>>,
    }

    impl Renderer for HandOffRenderer {
        fn kind(&self) -> AgentKind {
            AgentKind::Video
        }

        fn convert(&self, ctx: &RenderContext<'_>) -> Result<ConvertOutcome, RenderError> {
            Ok(ConvertOutcome::Delegated {
                external_id: format!("enc-{}", ctx.job.id),
                output_location: "s3://videos/out.m3u8".to_string(),
            })
        }

        fn cancel(&self, external_id: &str) -> Result<(), RenderError> {
            self.cancelled.lock().unwrap().push(external_id.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(RecordingLedger::default());
        let result = AgentPool::start(
            "doc",
            AgentKind::Document,
            spec(0, 1),
            Arc::new(HandOffRenderer::default()),
            deps(&dir, ledger),
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_refused_hand_off_is_cancelled() {
        let dir = TempDir::new().unwrap();
        let ledger = Arc::new(RecordingLedger::default());
        let renderer = Arc::new(HandOffRenderer::default());
        let pool = AgentPool::start(
            "video",
            AgentKind::Video,
            spec(1, 1),
            renderer.clone(),
            deps(&dir, Arc::clone(&ledger)),
        )
        .unwrap();

        let kept = RenderJob::pending("a", "mp4", "video", RenditionKind::Stream);
        let dropped = RenderJob::pending("b", "mp4", "video", RenditionKind::Stream);
        ledger.add(kept.clone());
        ledger.add(dropped.clone());
        ledger.resolved_early.lock().unwrap().push(dropped.id.clone());
        pool.submit(&kept.id).unwrap();
        pool.submit(&dropped.id).unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            !renderer.cancelled.lock().unwrap().is_empty()
        }));
        assert_eq!(
            *ledger.started.lock().unwrap(),
            vec![kept.id.clone(), dropped.id.clone()]
        );
        assert_eq!(
            *renderer.cancelled.lock().unwrap(),
            vec![format!("enc-{}", dropped.id)]
        );
    }
}
