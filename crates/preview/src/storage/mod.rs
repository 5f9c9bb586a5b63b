//! Storage backends for asset, job and rendition records.
//!
//! Engines are selected once from configuration by [`build_storage`] and
//! shared behind `Arc<dyn Storage>`.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{StorageConfig, StorageEngine};
use crate::error::StoreError;
use crate::model::Record;

pub mod memory;
pub mod migrations;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

const WRITE_ATTEMPTS: u32 = 3;
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Key/value contract over [`Record`]s.
///
/// Writes are visible to subsequent reads from the same process.
pub trait Storage: Send + Sync {
    fn name(&self) -> &'static str;

    fn put(&self, key: &str, record: Record) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<Record>, StoreError>;

    fn list(&self, predicate: &dyn Fn(&Record) -> bool) -> Result<Vec<Record>, StoreError>;

    /// Atomic read-modify-write of a single key.
    ///
    /// `apply` sees the current value and returns the value to store, or
    /// `None` to leave the key untouched. Returns whether a write happened.
    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&Record>) -> Option<Record>,
    ) -> Result<bool, StoreError>;
}

pub fn build_storage(config: &StorageConfig) -> Result<Arc<dyn Storage>, StoreError> {
    match config.engine {
        StorageEngine::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageEngine::Sqlite => {
            let path = config.path.as_ref().ok_or_else(|| {
                StoreError::Unavailable("storage.path is required for sqlite".to_string())
            })?;
            Ok(Arc::new(SqliteStorage::open(path, &config.keyspace)?))
        }
    }
}

/// Runs a storage write, retrying a fixed number of times before giving up.
pub fn with_retries<T, F>(operation: &str, mut f: F) -> Result<T, StoreError>
where
    F: FnMut() -> Result<T, StoreError>,
{
    let mut attempt = 1;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < WRITE_ATTEMPTS => {
                tracing::warn!(
                    operation,
                    attempt,
                    error = %e,
                    "Storage write failed, retrying"
                );
                std::thread::sleep(WRITE_RETRY_DELAY);
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(operation, error = %e, "Storage write failed, giving up");
                return Err(StoreError::Unavailable(format!(
                    "{} failed after {} attempts: {}",
                    operation, WRITE_ATTEMPTS, e
                )));
            }
        }
    }
}
