//! Test harness for isolated dispatcher runs.
//!
//! Every harness owns a temp directory laid out like a node's `.cache`
//! tree, with a placeholder image for each group the tests use.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use preview::config::AppConfig;
use preview::error::StoreError;
use preview::model::Record;
use preview::{Dispatcher, JobStatus, MemoryStorage, Renderer, Storage};

use super::builders::ConfigBuilder;

pub const PLACEHOLDER_GROUPS: &[&str] = &["archive", "document", "image", "video"];

pub struct TestHarness {
    temp_dir: TempDir,
    /// Storage shared by every dispatcher built from this harness.
    pub storage: Arc<dyn Storage>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let placeholders = temp_dir.path().join(".cache").join("placeholders");
        for group in PLACEHOLDER_GROUPS {
            let path = placeholders.join(group).join("jumbo.png");
            std::fs::create_dir_all(path.parent().unwrap()).expect("Failed to create group dir");
            image::RgbaImage::new(8, 6)
                .save(&path)
                .expect("Failed to write placeholder");
        }

        Self {
            temp_dir,
            storage: Arc::new(MemoryStorage::new()),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn config(&self) -> ConfigBuilder {
        ConfigBuilder::new(self.root())
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.root().join("db").join("preview.sqlite")
    }

    /// Writes a source file under the harness root and returns its path.
    pub fn write_source(&self, name: &str, content: &[u8]) -> PathBuf {
        let path = self.root().join("sources").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).expect("Failed to create sources dir");
        std::fs::write(&path, content).expect("Failed to write source file");
        path
    }

    /// A dispatcher over the harness storage, with scripted renderers in
    /// place of the configured ones.
    pub fn dispatcher(
        &self,
        config: AppConfig,
        renderers: &[(&str, Arc<dyn Renderer>)],
    ) -> Dispatcher {
        self.dispatcher_with_storage(config, Arc::clone(&self.storage), renderers)
    }

    pub fn dispatcher_with_storage(
        &self,
        config: AppConfig,
        storage: Arc<dyn Storage>,
        renderers: &[(&str, Arc<dyn Renderer>)],
    ) -> Dispatcher {
        let mut builder = Dispatcher::builder(Arc::new(config)).storage(storage);
        for (name, renderer) in renderers {
            builder = builder.renderer(name, Arc::clone(renderer));
        }
        builder.build().expect("Failed to build dispatcher")
    }

    /// A dispatcher whose storage is built from `config.storage`.
    pub fn configured_dispatcher(
        &self,
        config: AppConfig,
        renderers: &[(&str, Arc<dyn Renderer>)],
    ) -> Dispatcher {
        let mut builder = Dispatcher::builder(Arc::new(config));
        for (name, renderer) in renderers {
            builder = builder.renderer(name, Arc::clone(renderer));
        }
        builder.build().expect("Failed to build dispatcher")
    }

    pub fn records(&self) -> Vec<Record> {
        self.storage.list(&|_| true).expect("Failed to list records")
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn in_progress(record: Option<&Record>) -> bool {
    record
        .and_then(Record::as_job)
        .is_some_and(|job| job.status == JobStatus::InProgress)
}

/// Memory storage that counts stored `InProgress` jobs as each write lands.
#[derive(Default)]
pub struct InProgressCounter {
    inner: MemoryStorage,
    pub current: AtomicUsize,
    pub peak: AtomicUsize,
}

impl Storage for InProgressCounter {
    fn name(&self) -> &'static str {
        "in-progress-counter"
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
        self.inner.update(key, &mut |current| {
            let before = in_progress(current);
            let next = apply(current);
            if let Some(record) = &next {
                match (before, in_progress(Some(record))) {
                    (false, true) => {
                        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
                        self.peak.fetch_max(now, Ordering::SeqCst);
                    }
                    (true, false) => {
                        self.current.fetch_sub(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
            next
        })
    }
}

/// Storage that refuses every write.
pub struct UnwritableStorage;

impl Storage for UnwritableStorage {
    fn name(&self) -> &'static str {
        "unwritable"
    }

    fn put(&self, _key: &str, _record: Record) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("read-only".to_string()))
    }

    fn get(&self, _key: &str) -> Result<Option<Record>, StoreError> {
        Ok(None)
    }

    fn list(&self, _predicate: &dyn Fn(&Record) -> bool) -> Result<Vec<Record>, StoreError> {
        Ok(Vec::new())
    }

    fn update(
        &self,
        _key: &str,
        _apply: &mut dyn FnMut(Option<&Record>) -> Option<Record>,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("read-only".to_string()))
    }
}
