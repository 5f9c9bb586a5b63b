use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::TransferError;
use crate::transfer::{CacheProxy, Downloader, FetchedFile};

/// Resolves `file://`, `local://` and `http(s)://` sources to local files.
pub struct SchemeDownloader {
    base_path: PathBuf,
    local_root: PathBuf,
    client: reqwest::blocking::Client,
    cache: Option<CacheProxy>,
}

impl SchemeDownloader {
    pub fn new(
        base_path: PathBuf,
        local_root: PathBuf,
        client: reqwest::blocking::Client,
        cache: Option<CacheProxy>,
    ) -> Self {
        Self {
            base_path,
            local_root,
            client,
            cache,
        }
    }

    fn existing(path: PathBuf) -> Result<FetchedFile, TransferError> {
        if !path.is_file() {
            return Err(TransferError::Io {
                path,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(FetchedFile::borrowed(path))
    }

    fn fetch_direct(&self, url: &str) -> Result<FetchedFile, TransferError> {
        let target = scratch_path(&self.base_path, url);
        download_to(&self.client, url, &target)?;
        Ok(FetchedFile::scratch(target))
    }
}

impl Downloader for SchemeDownloader {
    fn fetch(&self, source_url: &str) -> Result<FetchedFile, TransferError> {
        if let Some(path) = source_url.strip_prefix("file://") {
            return Self::existing(PathBuf::from(path));
        }
        if let Some(relative) = source_url.strip_prefix("local://") {
            let relative = relative.trim_start_matches('/');
            if relative.split('/').any(|part| part == "..") {
                return Err(TransferError::InvalidDestination(source_url.to_string()));
            }
            return Self::existing(self.local_root.join(relative));
        }
        if source_url.starts_with("http://") || source_url.starts_with("https://") {
            return match &self.cache {
                Some(cache) => cache.fetch(source_url),
                None => self.fetch_direct(source_url),
            };
        }

        Err(TransferError::UnsupportedScheme(source_url.to_string()))
    }
}

/// Extension of the last path segment of a URL, if any.
pub fn url_extension(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.next_back()?.to_string();
    Path::new(&segment)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
}

pub(crate) fn scratch_path(dir: &Path, url: &str) -> PathBuf {
    let name = match url_extension(url) {
        Some(ext) => format!("{}.{}", uuid::Uuid::new_v4(), ext),
        None => uuid::Uuid::new_v4().to_string(),
    };
    dir.join(name)
}

/// Streams the response body of `url` into `target`.
pub(crate) fn download_to(
    client: &reqwest::blocking::Client,
    url: &str,
    target: &Path,
) -> Result<u64, TransferError> {
    let mut response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(TransferError::Status {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }

    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TransferError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let io_err = |e: std::io::Error| TransferError::Io {
        path: target.to_path_buf(),
        source: e,
    };
    let mut file = std::fs::File::create(target).map_err(io_err)?;
    let written = match response.copy_to(&mut file) {
        Ok(n) => n,
        Err(e) => {
            drop(file);
            let _ = std::fs::remove_file(target);
            return Err(e.into());
        }
    };
    file.flush().map_err(io_err)?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn downloader(dir: &TempDir) -> SchemeDownloader {
        SchemeDownloader::new(
            dir.path().join("downloads"),
            dir.path().join("assets"),
            reqwest::blocking::Client::new(),
            None,
        )
    }

    #[test]
    fn test_fetch_file_scheme() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("a.docx");
        std::fs::write(&source, b"doc").unwrap();

        let fetched = downloader(&dir)
            .fetch(&format!("file://{}", source.display()))
            .unwrap();
        assert_eq!(fetched.path(), source.as_path());
        drop(fetched);
        assert!(source.exists());
    }

    #[test]
    fn test_fetch_local_scheme_relative_to_asset_root() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("assets/ab")).unwrap();
        std::fs::write(dir.path().join("assets/ab/c.png"), b"png").unwrap();

        let fetched = downloader(&dir).fetch("local:///ab/c.png").unwrap();
        assert_eq!(fetched.size().unwrap(), 3);

        assert!(matches!(
            downloader(&dir).fetch("local:///../secret"),
            Err(TransferError::InvalidDestination(_))
        ));
    }

    #[test]
    fn test_fetch_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            downloader(&dir).fetch("file:///definitely/not/here.pdf"),
            Err(TransferError::Io { .. })
        ));
    }

    #[test]
    fn test_unsupported_scheme() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            downloader(&dir).fetch("ftp://host/file.pdf"),
            Err(TransferError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(
            url_extension("https://example.com/files/Report.DOCX?x=1").as_deref(),
            Some("docx")
        );
        assert_eq!(url_extension("https://example.com/files/"), None);
        assert_eq!(url_extension("https://example.com/noext"), None);
        assert_eq!(url_extension("not a url"), None);
    }
}
