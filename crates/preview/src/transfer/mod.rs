//! Transfer backends: uploaders persist generated renditions, downloaders
//! make source bytes available as local files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{DownloaderConfig, UploaderConfig, UploaderEngine};
use crate::error::TransferError;

pub mod cache;
pub mod downloader;
pub mod uploader;

pub use cache::CacheProxy;
pub use downloader::SchemeDownloader;
pub use uploader::{LocalUploader, ObjectStoreUploader};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

pub trait Uploader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stores the file at `path` and returns its location, e.g.
    /// `local:///{hint}` or `s3://{bucket}/{hint}`.
    fn upload(&self, path: &Path, destination_hint: &str) -> Result<String, TransferError>;
}

pub trait Downloader: Send + Sync {
    fn fetch(&self, source_url: &str) -> Result<FetchedFile, TransferError>;
}

/// A local copy of a source. Scratch downloads are removed on drop.
#[derive(Debug)]
pub struct FetchedFile {
    path: PathBuf,
    remove_on_drop: bool,
}

impl FetchedFile {
    /// A file owned by someone else; left in place on drop.
    pub fn borrowed(path: PathBuf) -> Self {
        Self {
            path,
            remove_on_drop: false,
        }
    }

    /// A scratch download deleted when this handle goes away.
    pub fn scratch(path: PathBuf) -> Self {
        Self {
            path,
            remove_on_drop: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> Result<u64, TransferError> {
        std::fs::metadata(&self.path)
            .map(|m| m.len())
            .map_err(|e| TransferError::Io {
                path: self.path.clone(),
                source: e,
            })
    }
}

impl Drop for FetchedFile {
    fn drop(&mut self) {
        if self.remove_on_drop {
            if let Err(e) = std::fs::remove_file(&self.path) {
                log::debug!("Could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

pub fn build_uploader(config: &UploaderConfig) -> Result<Arc<dyn Uploader>, TransferError> {
    match config.engine {
        UploaderEngine::Local => {
            let base_path = config.base_path.clone().ok_or_else(|| {
                TransferError::InvalidDestination("uploader.basePath is not set".to_string())
            })?;
            Ok(Arc::new(LocalUploader::new(base_path)))
        }
        UploaderEngine::ObjectStore => {
            let store = config.object_store.as_ref().ok_or_else(|| {
                TransferError::InvalidDestination("uploader.objectStore is not set".to_string())
            })?;
            Ok(Arc::new(ObjectStoreUploader::new(store)?))
        }
    }
}

pub fn build_downloader(
    config: &DownloaderConfig,
    local_asset_storage_path: &Path,
) -> Result<Arc<dyn Downloader>, TransferError> {
    let base_path = config
        .base_path
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("preview-downloads"));
    let client = http_client(true)?;

    let cache = if config.cache_enabled {
        Some(CacheProxy::new(
            config.cache_hosts.clone(),
            base_path.join("cache"),
            config.cache_capacity,
            client.clone(),
        ))
    } else {
        None
    };

    Ok(Arc::new(SchemeDownloader::new(
        base_path,
        local_asset_storage_path.to_path_buf(),
        client,
        cache,
    )))
}

pub(crate) fn http_client(verify_ssl: bool) -> Result<reqwest::blocking::Client, TransferError> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .danger_accept_invalid_certs(!verify_ssl)
        .build()?)
}

/// 64-bit FNV-1a; stable across processes and releases.
pub fn stable_hash(key: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    key.bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

/// Picks the member of `items` that owns `key`.
pub fn pick<'a>(items: &'a [String], key: &str) -> Option<&'a str> {
    if items.is_empty() {
        return None;
    }
    let index = (stable_hash(key) % items.len() as u64) as usize;
    Some(items[index].as_str())
}
