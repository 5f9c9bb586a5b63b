use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where the source bytes of an asset live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AssetOrigin {
    /// A file on this node.
    Local { path: PathBuf },
    /// A remote URL fetched through the downloader.
    Remote { url: String },
    /// Bytes supplied with a rejected request; nothing was retained.
    Inline,
}

impl AssetOrigin {
    /// The location handed to the downloader, `None` for inline origins.
    pub fn source_url(&self) -> Option<String> {
        match self {
            AssetOrigin::Local { path } => Some(format!("file://{}", path.display())),
            AssetOrigin::Remote { url } => Some(url.clone()),
            AssetOrigin::Inline => None,
        }
    }
}

/// Immutable source reference. Created on ingestion, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Asset {
    pub id: String,
    /// Lower-case, without the leading dot.
    pub extension: String,
    pub size: u64,
    pub origin: AssetOrigin,
    pub created_at: DateTime<Utc>,
}

impl Asset {
    pub fn new(extension: &str, size: u64, origin: AssetOrigin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            extension: extension.to_string(),
            size,
            origin,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_url() {
        let local = AssetOrigin::Local {
            path: PathBuf::from("/data/assets/a.docx"),
        };
        assert_eq!(
            local.source_url().as_deref(),
            Some("file:///data/assets/a.docx")
        );

        let remote = AssetOrigin::Remote {
            url: "https://example.com/a.png".to_string(),
        };
        assert_eq!(
            remote.source_url().as_deref(),
            Some("https://example.com/a.png")
        );
        assert_eq!(AssetOrigin::Inline.source_url(), None);
    }

    #[test]
    fn test_origin_serialization_is_tagged() {
        let json = serde_json::to_value(AssetOrigin::Remote {
            url: "http://a/b.pdf".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "remote");
        assert_eq!(json["url"], "http://a/b.pdf");
    }
}
