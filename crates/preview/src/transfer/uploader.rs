use std::path::{Component, Path, PathBuf};

use crate::config::ObjectStoreConfig;
use crate::error::TransferError;
use crate::transfer::{http_client, pick, Uploader};

/// Rejects hints that would escape the upload root.
fn validate_hint(hint: &str) -> Result<&str, TransferError> {
    let trimmed = hint.trim_start_matches('/');
    let escapes = Path::new(trimmed)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if trimmed.is_empty() || escapes {
        return Err(TransferError::InvalidDestination(hint.to_string()));
    }
    Ok(trimmed)
}

/// Copies renditions under a local directory.
pub struct LocalUploader {
    base_path: PathBuf,
}

impl LocalUploader {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Maps a `local:///` location back to the stored file.
    pub fn resolve(&self, location: &str) -> Option<PathBuf> {
        let hint = location.strip_prefix("local:///")?;
        validate_hint(hint).ok().map(|h| self.base_path.join(h))
    }
}

impl Uploader for LocalUploader {
    fn name(&self) -> &'static str {
        "local"
    }

    fn upload(&self, path: &Path, destination_hint: &str) -> Result<String, TransferError> {
        let hint = validate_hint(destination_hint)?;
        let target = self.base_path.join(hint);

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TransferError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        std::fs::copy(path, &target).map_err(|e| TransferError::Io {
            path: target.clone(),
            source: e,
        })?;

        log::debug!("Uploaded {} to {}", path.display(), target.display());
        Ok(format!("local:///{}", hint))
    }
}

/// PUTs renditions to an S3-compatible gateway, spreading objects over
/// buckets by a stable hash of the destination hint.
pub struct ObjectStoreUploader {
    client: reqwest::blocking::Client,
    host: String,
    buckets: Vec<String>,
    key: String,
    secret: String,
}

impl ObjectStoreUploader {
    pub fn new(config: &ObjectStoreConfig) -> Result<Self, TransferError> {
        if config.buckets.is_empty() {
            return Err(TransferError::InvalidDestination(
                "object store has no buckets".to_string(),
            ));
        }
        Ok(Self {
            client: http_client(config.verify_ssl)?,
            host: config.host.trim_end_matches('/').to_string(),
            buckets: config.buckets.clone(),
            key: config.key.clone(),
            secret: config.secret.clone(),
        })
    }

    pub fn bucket_for(&self, hint: &str) -> &str {
        // `new` guarantees at least one bucket
        pick(&self.buckets, hint).unwrap_or_default()
    }
}

impl Uploader for ObjectStoreUploader {
    fn name(&self) -> &'static str {
        "objectStore"
    }

    fn upload(&self, path: &Path, destination_hint: &str) -> Result<String, TransferError> {
        let hint = validate_hint(destination_hint)?;
        let bucket = self.bucket_for(hint);
        let url = format!("{}/{}/{}", self.host, bucket, hint);

        let payload = std::fs::read(path).map_err(|e| TransferError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let content_type = mime_guess::from_path(path).first_or_octet_stream();

        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type.essence_str())
            .body(payload);
        if !self.key.is_empty() {
            request = request.basic_auth(&self.key, Some(&self.secret));
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(TransferError::Status {
                url,
                status: response.status().as_u16(),
            });
        }

        log::debug!("Uploaded {} to {}", path.display(), url);
        Ok(format!("s3://{}/{}", bucket, hint))
    }
}
