use std::path::PathBuf;
use std::sync::Arc;

use moka::notification::RemovalCause;
use moka::sync::Cache;

use crate::error::TransferError;
use crate::transfer::downloader::{download_to, scratch_path};
use crate::transfer::{pick, FetchedFile};

/// Read-through cache in front of remote downloads.
///
/// The in-process index is consulted first. Misses go through the proxy
/// host that owns the URL and populate the index on success. A failed miss
/// is returned to the caller as is.
pub struct CacheProxy {
    hosts: Vec<String>,
    dir: PathBuf,
    index: Cache<String, PathBuf>,
    client: reqwest::blocking::Client,
}

impl CacheProxy {
    pub fn new(
        hosts: Vec<String>,
        dir: PathBuf,
        capacity: u64,
        client: reqwest::blocking::Client,
    ) -> Self {
        let index = Cache::builder()
            .max_capacity(capacity)
            .eviction_listener(|url: Arc<String>, path: PathBuf, cause: RemovalCause| {
                if cause != RemovalCause::Replaced {
                    log::debug!("Evicting cached download for {}", url);
                    let _ = std::fs::remove_file(&path);
                }
            })
            .build();

        Self {
            hosts,
            dir,
            index,
            client,
        }
    }

    pub fn host_for(&self, url: &str) -> Option<&str> {
        pick(&self.hosts, url)
    }

    /// The request sent to the proxy for `url`.
    pub fn proxy_url(host: &str, url: &str) -> Result<String, TransferError> {
        let base = format!("{}/", host.trim_end_matches('/'));
        reqwest::Url::parse_with_params(&base, &[("url", url)])
            .map(|u| u.to_string())
            .map_err(|e| TransferError::CacheProxy {
                host: host.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn cached(&self, url: &str) -> Option<PathBuf> {
        self.index
            .get(url)
            .filter(|path| path.is_file())
    }

    pub fn fetch(&self, url: &str) -> Result<FetchedFile, TransferError> {
        if let Some(path) = self.cached(url) {
            log::debug!("Cache hit for {}", url);
            return Ok(FetchedFile::borrowed(path));
        }

        let host = self.host_for(url).ok_or_else(|| TransferError::CacheProxy {
            host: String::new(),
            reason: "no cache hosts configured".to_string(),
        })?;
        let request = Self::proxy_url(host, url)?;
        let target = scratch_path(&self.dir, url);

        download_to(&self.client, &request, &target).map_err(|e| TransferError::CacheProxy {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

        self.index.insert(url.to_string(), target.clone());
        Ok(FetchedFile::borrowed(target))
    }

    /// Records an already downloaded file for `url`.
    pub fn remember(&self, url: &str, path: PathBuf) {
        self.index.insert(url.to_string(), path);
    }
}
