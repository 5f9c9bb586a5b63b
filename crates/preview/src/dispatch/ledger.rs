//! Persisted job lifecycle.
//!
//! Every transition is a compare-and-set on the stored job record, written
//! before the matching [`JobEvent`] is published. Terminal resolutions of
//! the same job are serialized in-process so a rendition is only ever stored
//! for the caller that also flips the job to `Completed`. Resolutions of
//! different jobs never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, error, warn};

use crate::agent::{RenderedArtifact, WorkLedger};
use crate::dispatch::events::{JobEvent, JobEventBroadcaster};
use crate::error::{FailureCode, RenderError, StoreError};
use crate::model::{
    asset_key, job_key, rendition_key, Asset, JobError, JobStatus, Record, RenderJob, Rendition,
    RenditionSource,
};
use crate::storage::{with_retries, Storage};

/// Result of a compare-and-set on a job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The job was in an allowed state and now holds the new value.
    Applied(RenderJob),
    /// The job exists but was not in an allowed state; nothing changed.
    Rejected(RenderJob),
    Missing,
}

/// One mutex per job with a resolution in flight. Entries are dropped once
/// no caller holds them.
#[derive(Default)]
struct JobLocks {
    held: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JobLocks {
    fn with<T>(
        &self,
        job_id: &str,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = {
            let mut held = self.held.lock().map_err(|_| StoreError::LockPoisoned)?;
            Arc::clone(held.entry(job_id.to_string()).or_default())
        };

        let result = match lock.lock() {
            Ok(_guard) => f(),
            Err(_) => Err(StoreError::LockPoisoned),
        };
        drop(lock);

        if let Ok(mut held) = self.held.lock() {
            if held.get(job_id).is_some_and(|l| Arc::strong_count(l) == 1) {
                held.remove(job_id);
            }
        }
        result
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }
}

pub struct JobLedger {
    storage: Arc<dyn Storage>,
    events: JobEventBroadcaster,
    node_id: String,
    resolving: JobLocks,
}

impl JobLedger {
    pub fn new(storage: Arc<dyn Storage>, events: JobEventBroadcaster, node_id: &str) -> Self {
        Self {
            storage,
            events,
            node_id: node_id.to_string(),
            resolving: JobLocks::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn put_asset(&self, asset: &Asset) -> Result<(), StoreError> {
        let key = asset_key(&asset.id);
        with_retries("asset write", || {
            self.storage.put(&key, Record::Asset(asset.clone()))
        })
    }

    /// Stores a new job and announces it.
    pub fn create(&self, job: &RenderJob) -> Result<(), StoreError> {
        let key = job_key(&job.id);
        with_retries("job write", || self.storage.put(&key, Record::Job(job.clone())))?;

        let message = match job.status {
            JobStatus::Pending => "Job queued".to_string(),
            JobStatus::Completed => "Placeholder assigned".to_string(),
            JobStatus::Failed => job
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default(),
            JobStatus::InProgress => "Job started".to_string(),
        };
        self.events.send(JobEvent::new(job, &message));
        Ok(())
    }

    pub fn job(&self, job_id: &str) -> Result<Option<RenderJob>, StoreError> {
        Ok(self
            .storage
            .get(&job_key(job_id))?
            .and_then(Record::into_job))
    }

    pub fn asset(&self, asset_id: &str) -> Result<Option<Asset>, StoreError> {
        Ok(self
            .storage
            .get(&asset_key(asset_id))?
            .and_then(Record::into_asset))
    }

    pub fn rendition(&self, job_id: &str) -> Result<Option<Rendition>, StoreError> {
        Ok(self
            .storage
            .get(&rendition_key(job_id))?
            .and_then(Record::into_rendition))
    }

    pub fn jobs_where(
        &self,
        predicate: impl Fn(&RenderJob) -> bool,
    ) -> Result<Vec<RenderJob>, StoreError> {
        let records = self
            .storage
            .list(&|r| r.as_job().is_some_and(&predicate))?;
        Ok(records.into_iter().filter_map(Record::into_job).collect())
    }

    /// Writes a rendition unless one already exists for its job.
    pub fn store_rendition(&self, rendition: &Rendition) -> Result<bool, StoreError> {
        let key = rendition_key(&rendition.job_id);
        with_retries("rendition write", || {
            self.storage.update(&key, &mut |current| match current {
                Some(_) => None,
                None => Some(Record::Rendition(rendition.clone())),
            })
        })
    }

    fn transition<P, F>(
        &self,
        job_id: &str,
        allowed: P,
        mut apply: F,
    ) -> Result<Transition, StoreError>
    where
        P: Fn(&RenderJob) -> bool,
        F: FnMut(&mut RenderJob),
    {
        let key = job_key(job_id);
        with_retries("job transition", || {
            let mut outcome = Transition::Missing;
            self.storage.update(&key, &mut |current| match current {
                Some(Record::Job(job)) if allowed(job) => {
                    let mut next = job.clone();
                    apply(&mut next);
                    outcome = Transition::Applied(next.clone());
                    Some(Record::Job(next))
                }
                Some(Record::Job(job)) => {
                    outcome = Transition::Rejected(job.clone());
                    None
                }
                _ => {
                    outcome = Transition::Missing;
                    None
                }
            })?;
            Ok(outcome)
        })
    }

    /// `Pending -> InProgress`, owned by this node.
    pub fn start(&self, job_id: &str) -> Result<Transition, StoreError> {
        let transition = self.transition(
            job_id,
            |job| job.status == JobStatus::Pending,
            |job| job.mark_started(&self.node_id),
        )?;
        if let Transition::Applied(job) = &transition {
            self.events.send(JobEvent::new(job, "Conversion started"));
        }
        Ok(transition)
    }

    /// Records the encoder job for a delegated conversion; the job stays
    /// in progress until the notification arrives.
    pub fn mark_delegated(
        &self,
        job_id: &str,
        external_id: &str,
        output_location: &str,
    ) -> Result<Transition, StoreError> {
        let transition = self.transition(
            job_id,
            |job| job.status == JobStatus::InProgress,
            |job| {
                job.external_id = Some(external_id.to_string());
                job.output_location = Some(output_location.to_string());
            },
        )?;
        if let Transition::Applied(job) = &transition {
            self.events.send(JobEvent::new(job, "Delegated to encoder"));
        }
        Ok(transition)
    }

    /// Crashed `InProgress -> Pending`. Only jobs this node started are
    /// reset; delegated jobs keep waiting for their notification.
    pub fn reset_to_pending(&self, job_id: &str) -> Result<Transition, StoreError> {
        let transition = self.transition(
            job_id,
            |job| {
                job.status == JobStatus::InProgress
                    && job.external_id.is_none()
                    && job.is_owned_by(&self.node_id)
            },
            |job| job.reset_to_pending(),
        )?;
        if let Transition::Applied(job) = &transition {
            self.events.send(JobEvent::new(job, "Requeued after restart"));
        }
        Ok(transition)
    }

    /// Stores `rendition` and flips the job to `Completed`. A job that is
    /// already terminal is left untouched, rendition included.
    pub fn resolve_completed(
        &self,
        rendition: Rendition,
        attempts: Option<u32>,
    ) -> Result<Transition, StoreError> {
        let job_id = rendition.job_id.clone();
        self.resolving.with(&job_id, || {
            let job = match self.job(&job_id)? {
                Some(job) => job,
                None => return Ok(Transition::Missing),
            };
            if job.is_terminal() {
                debug!(
                    job_id = %job.id,
                    status = %job.status,
                    "Ignoring completion of terminal job"
                );
                return Ok(Transition::Rejected(job));
            }

            self.store_rendition(&rendition)?;
            let transition = self.transition(&job_id, |job| !job.is_terminal(), |job| {
                if let Some(attempts) = attempts {
                    job.attempts = attempts;
                }
                job.mark_completed();
            })?;
            if let Transition::Applied(job) = &transition {
                self.events.send(JobEvent::completed(job, &rendition.location));
            }
            Ok(transition)
        })
    }

    /// Flips the job to `Failed` with `error`. Terminal jobs are left as is.
    pub fn resolve_failed(
        &self,
        job_id: &str,
        error: JobError,
        attempts: Option<u32>,
    ) -> Result<Transition, StoreError> {
        self.resolving.with(job_id, || {
            let transition = self.transition(job_id, |job| !job.is_terminal(), |job| {
                if let Some(attempts) = attempts {
                    job.attempts = attempts;
                }
                job.mark_failed(error.clone());
            })?;
            if let Transition::Applied(job) = &transition {
                self.events.send(JobEvent::failed(job));
            }
            Ok(transition)
        })
    }

    pub fn rendered(&self, job_id: &str, artifact: RenderedArtifact) -> Rendition {
        Rendition {
            job_id: job_id.to_string(),
            location: artifact.location,
            content_type: artifact.content_type,
            size: artifact.size,
            source: RenditionSource::Rendered,
            node_id: self.node_id.clone(),
            dimensions: artifact.dimensions,
            additional_locations: artifact.additional_locations,
            created_at: Utc::now(),
        }
    }
}

impl WorkLedger for JobLedger {
    fn begin(&self, job_id: &str) -> Option<(RenderJob, Asset)> {
        let job = match self.start(job_id) {
            Ok(Transition::Applied(job)) => job,
            Ok(_) => return None,
            Err(e) => {
                error!(job_id, error = %e, "Could not start job");
                return None;
            }
        };

        match self.asset(&job.asset_id) {
            Ok(Some(asset)) => Some((job, asset)),
            Ok(None) => {
                let error = JobError::new(
                    FailureCode::NotFound,
                    format!("asset {} not found", job.asset_id),
                );
                if let Err(e) = self.resolve_failed(job_id, error, None) {
                    error!(job_id, error = %e, "Could not fail job with missing asset");
                }
                None
            }
            Err(e) => {
                let error = JobError::new(e.code(), e.to_string());
                if let Err(e) = self.resolve_failed(job_id, error, None) {
                    error!(job_id, error = %e, "Could not fail job");
                }
                None
            }
        }
    }

    fn complete(&self, job: &RenderJob, artifact: RenderedArtifact) {
        let rendition = self.rendered(&job.id, artifact);
        match self.resolve_completed(rendition, Some(job.attempts)) {
            Ok(Transition::Applied(_)) => {}
            Ok(other) => warn!(job_id = %job.id, outcome = ?other, "Completion not applied"),
            Err(e) => error!(job_id = %job.id, error = %e, "Could not record completion"),
        }
    }

    fn delegate(&self, job: &RenderJob, external_id: String, output_location: String) -> bool {
        match self.mark_delegated(&job.id, &external_id, &output_location) {
            Ok(Transition::Applied(_)) => true,
            Ok(Transition::Rejected(current)) => {
                warn!(
                    job_id = %job.id,
                    external_id = %external_id,
                    status = %current.status,
                    "Job resolved before the encoder accepted it"
                );
                false
            }
            Ok(Transition::Missing) => {
                warn!(job_id = %job.id, external_id = %external_id, "Delegated job is gone");
                false
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Could not record delegation");
                true
            }
        }
    }

    fn fail(&self, job: &RenderJob, error: &RenderError) {
        let job_error = JobError::new(error.code(), error.to_string());
        if let Err(e) = self.resolve_failed(&job.id, job_error, Some(job.attempts)) {
            error!(job_id = %job.id, error = %e, "Could not record failure");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetOrigin, RenditionKind};
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    /// Memory storage whose `update` stalls on one chosen key.
    #[derive(Default)]
    struct StallingStorage {
        inner: MemoryStorage,
        stalled_key: Mutex<Option<String>>,
        stalling: AtomicBool,
    }

    impl Storage for StallingStorage {
        fn name(&self) -> &'static str {
            "stalling"
        }

        fn put(&self, key: &str, record: Record) -> Result<(), StoreError> {
            self.inner.put(key, record)
        }

        fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
            self.inner.get(key)
        }

        fn list(&self, predicate: &dyn Fn(&Record) -> bool) -> Result<Vec<Record>, StoreError> {
            self.inner.list(predicate)
        }

        fn update(
            &self,
            key: &str,
            apply: &mut dyn FnMut(Option<&Record>) -> Option<Record>,
        ) -> Result<bool, StoreError> {
            let stall = self.stalled_key.lock().unwrap().as_deref() == Some(key);
            if stall {
                self.stalling.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(700));
            }
            self.inner.update(key, apply)
        }
    }

    fn ledger() -> JobLedger {
        JobLedger::new(
            Arc::new(MemoryStorage::new()),
            JobEventBroadcaster::new(16),
            "node-1",
        )
    }

    fn artifact(location: &str) -> RenderedArtifact {
        RenderedArtifact {
            location: location.to_string(),
            content_type: "application/pdf".to_string(),
            size: 10,
            dimensions: None,
            additional_locations: vec![],
        }
    }

    fn pending(ledger: &JobLedger) -> RenderJob {
        let asset = Asset::new("docx", 5, AssetOrigin::Inline);
        ledger.put_asset(&asset).unwrap();
        let job = RenderJob::pending(&asset.id, "docx", "doc", RenditionKind::Pdf);
        ledger.create(&job).unwrap();
        job
    }

    #[test]
    fn test_begin_moves_pending_to_in_progress_once() {
        let ledger = ledger();
        let job = pending(&ledger);

        let (started, asset) = ledger.begin(&job.id).unwrap();
        assert_eq!(started.status, JobStatus::InProgress);
        assert_eq!(asset.id, job.asset_id);
        assert!(ledger.begin(&job.id).is_none());
    }

    #[test]
    fn test_begin_fails_job_with_missing_asset() {
        let ledger = ledger();
        let job = RenderJob::pending("ghost", "docx", "doc", RenditionKind::Pdf);
        ledger.create(&job).unwrap();

        assert!(ledger.begin(&job.id).is_none());
        let stored = ledger.job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.unwrap().code, FailureCode::NotFound);
    }

    #[test]
    fn test_completion_writes_rendition_then_status() {
        let ledger = ledger();
        let mut events = ledger.events.subscribe();
        let job = pending(&ledger);
        let (job, _) = ledger.begin(&job.id).unwrap();

        ledger.complete(&job, artifact("local:///a/pdf"));

        let stored = ledger.job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let rendition = ledger.rendition(&job.id).unwrap().unwrap();
        assert_eq!(rendition.location, "local:///a/pdf");
        assert_eq!(rendition.node_id, "node-1");

        let statuses: Vec<JobStatus> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(
            statuses,
            vec![JobStatus::Pending, JobStatus::InProgress, JobStatus::Completed]
        );
    }

    #[test]
    fn test_duplicate_completion_keeps_first_rendition() {
        let ledger = ledger();
        let job = pending(&ledger);
        ledger.begin(&job.id).unwrap();

        let first = ledger.rendered(&job.id, artifact("s3://b/first"));
        let second = ledger.rendered(&job.id, artifact("s3://b/second"));
        assert!(matches!(
            ledger.resolve_completed(first, None).unwrap(),
            Transition::Applied(_)
        ));
        assert!(matches!(
            ledger.resolve_completed(second, None).unwrap(),
            Transition::Rejected(_)
        ));

        assert_eq!(
            ledger.rendition(&job.id).unwrap().unwrap().location,
            "s3://b/first"
        );
    }

    #[test]
    fn test_failure_after_completion_is_ignored() {
        let ledger = ledger();
        let job = pending(&ledger);
        ledger.begin(&job.id).unwrap();
        ledger
            .resolve_completed(ledger.rendered(&job.id, artifact("x")), None)
            .unwrap();

        let outcome = ledger
            .resolve_failed(&job.id, JobError::new(FailureCode::Timeout, "late"), None)
            .unwrap();
        assert!(matches!(outcome, Transition::Rejected(_)));
        assert_eq!(
            ledger.job(&job.id).unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn test_render_error_code_recorded() {
        let ledger = ledger();
        let job = pending(&ledger);
        let (job, _) = ledger.begin(&job.id).unwrap();

        ledger.fail(&job, &RenderError::Timeout { after_secs: 3 });
        let stored = ledger.job(&job.id).unwrap().unwrap();
        assert_eq!(stored.error.unwrap().code, FailureCode::Timeout);
        assert!(ledger.rendition(&job.id).unwrap().is_none());
    }

    #[test]
    fn test_reset_skips_delegated_jobs() {
        let ledger = ledger();
        let crashed = pending(&ledger);
        ledger.begin(&crashed.id).unwrap();
        let delegated = pending(&ledger);
        ledger.begin(&delegated.id).unwrap();
        ledger
            .mark_delegated(&delegated.id, "enc-1", "s3://v/a.m3u8")
            .unwrap();

        assert!(matches!(
            ledger.reset_to_pending(&crashed.id).unwrap(),
            Transition::Applied(_)
        ));
        assert!(matches!(
            ledger.reset_to_pending(&delegated.id).unwrap(),
            Transition::Rejected(_)
        ));
        assert_eq!(
            ledger.job(&delegated.id).unwrap().unwrap().status,
            JobStatus::InProgress
        );
        assert_eq!(
            ledger.job(&crashed.id).unwrap().unwrap().status,
            JobStatus::Pending
        );
    }

    #[test]
    fn test_missing_job_transition() {
        let ledger = ledger();
        assert_eq!(ledger.start("nope").unwrap(), Transition::Missing);
    }

    #[test]
    fn test_unrelated_resolutions_do_not_wait() {
        let storage = Arc::new(StallingStorage::default());
        let ledger = JobLedger::new(storage.clone(), JobEventBroadcaster::new(16), "node-1");
        let slow = pending(&ledger);
        let fast = pending(&ledger);
        ledger.begin(&slow.id).unwrap();
        ledger.begin(&fast.id).unwrap();
        *storage.stalled_key.lock().unwrap() = Some(job_key(&slow.id));

        thread::scope(|scope| {
            scope.spawn(|| {
                ledger
                    .resolve_failed(&slow.id, JobError::new(FailureCode::Timeout, "slow"), None)
                    .unwrap();
            });
            while !storage.stalling.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }

            let started = Instant::now();
            let outcome = ledger
                .resolve_failed(&fast.id, JobError::new(FailureCode::Timeout, "fast"), None)
                .unwrap();
            assert!(matches!(outcome, Transition::Applied(_)));
            assert!(started.elapsed() < Duration::from_millis(300));
        });

        assert_eq!(
            ledger.job(&slow.id).unwrap().unwrap().status,
            JobStatus::Failed
        );
        assert_eq!(ledger.resolving.len(), 0);
    }

    #[test]
    fn test_racing_completions_store_one_rendition() {
        let ledger = ledger();
        let job = pending(&ledger);
        ledger.begin(&job.id).unwrap();

        let applied: Vec<String> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let ledger = &ledger;
                    let job_id = job.id.clone();
                    scope.spawn(move || {
                        let location = format!("s3://b/{}", i);
                        let rendition = ledger.rendered(&job_id, artifact(&location));
                        match ledger.resolve_completed(rendition, None).unwrap() {
                            Transition::Applied(_) => Some(location),
                            _ => None,
                        }
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect()
        });

        assert_eq!(applied.len(), 1);
        assert_eq!(
            ledger.rendition(&job.id).unwrap().unwrap().location,
            applied[0]
        );
        assert_eq!(ledger.resolving.len(), 0);
    }

    #[test]
    fn test_reset_leaves_jobs_of_other_nodes() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let ours = JobLedger::new(Arc::clone(&storage), JobEventBroadcaster::new(16), "node-1");
        let theirs = JobLedger::new(storage, JobEventBroadcaster::new(16), "node-2");

        let job = pending(&ours);
        let (started, _) = theirs.begin(&job.id).unwrap();
        assert_eq!(started.node_id.as_deref(), Some("node-2"));

        assert!(matches!(
            ours.reset_to_pending(&job.id).unwrap(),
            Transition::Rejected(_)
        ));
        assert!(matches!(
            theirs.reset_to_pending(&job.id).unwrap(),
            Transition::Applied(_)
        ));
        assert_eq!(ours.job(&job.id).unwrap().unwrap().node_id, None);
    }

    #[test]
    fn test_delegation_refused_after_failure() {
        let ledger = ledger();
        let job = pending(&ledger);
        let (job, _) = ledger.begin(&job.id).unwrap();
        let cancelled = JobError::new(FailureCode::ConversionFailed, "cancelled");
        ledger.resolve_failed(&job.id, cancelled, None).unwrap();

        assert!(!ledger.delegate(&job, "enc-1".to_string(), "s3://v/a.m3u8".to_string()));
        let stored = ledger.job(&job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.external_id, None);
    }
}
