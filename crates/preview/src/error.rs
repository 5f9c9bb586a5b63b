use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable failure codes surfaced on job records and by every public surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    UnsupportedType,
    AssetTooLarge,
    DispatchDisabled,
    ConversionFailed,
    Timeout,
    TransferFailed,
    NotFound,
    GroupNotFound,
    StoreUnavailable,
}

impl FailureCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCode::UnsupportedType => "UnsupportedType",
            FailureCode::AssetTooLarge => "AssetTooLarge",
            FailureCode::DispatchDisabled => "DispatchDisabled",
            FailureCode::ConversionFailed => "ConversionFailed",
            FailureCode::Timeout => "Timeout",
            FailureCode::TransferFailed => "TransferFailed",
            FailureCode::NotFound => "NotFound",
            FailureCode::GroupNotFound => "GroupNotFound",
            FailureCode::StoreUnavailable => "StoreUnavailable",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Placeholder error: {0}")]
    Placeholder(#[from] PlaceholderError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Extension '{extension}' is claimed by both '{first}' and '{second}'")]
    DuplicateExtension {
        extension: String,
        first: String,
        second: String,
    },

    #[error("Cannot determine renderer kind for agent '{0}'; set \"kind\" explicitly")]
    UnknownAgentKind(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record '{key}' could not be decoded: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn code(&self) -> FailureCode {
        FailureCode::StoreUnavailable
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Unsupported location scheme: {0}")]
    UnsupportedScheme(String),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request to '{url}' returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Cache proxy '{host}' failed: {reason}")]
    CacheProxy { host: String, reason: String },

    #[error("Invalid upload destination: {0}")]
    InvalidDestination(String),
}

impl TransferError {
    pub fn code(&self) -> FailureCode {
        FailureCode::TransferFailed
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Conversion timed out after {after_secs}s")]
    Timeout { after_secs: u64 },

    #[error("Transient conversion failure: {0}")]
    Transient(String),

    #[error("Conversion failed: {0}")]
    Conversion(String),

    #[error("Required tool '{tool}' is not installed")]
    ToolMissing { tool: String },

    #[error("Asset is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("Render agent '{agent}' does not support cancellation")]
    CancellationUnsupported { agent: String },
}

impl RenderError {
    /// Whether another attempt of the same conversion may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RenderError::Timeout { .. } | RenderError::Transient(_) | RenderError::Transfer(_)
        )
    }

    pub fn code(&self) -> FailureCode {
        match self {
            RenderError::Timeout { .. } => FailureCode::Timeout,
            RenderError::Transfer(_) => FailureCode::TransferFailed,
            RenderError::TooLarge { .. } => FailureCode::AssetTooLarge,
            RenderError::Transient(_)
            | RenderError::Conversion(_)
            | RenderError::ToolMissing { .. }
            | RenderError::CancellationUnsupported { .. } => FailureCode::ConversionFailed,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaceholderError {
    #[error("No placeholder group covers '{0}'")]
    GroupNotFound(String),

    #[error("No placeholder of size '{0}'")]
    SizeNotFound(String),
}

impl PlaceholderError {
    pub fn code(&self) -> FailureCode {
        FailureCode::GroupNotFound
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("No render agent or placeholder group supports '{extension}' (job {job_id})")]
    UnsupportedType { job_id: String, extension: String },

    #[error("Asset of {size} bytes exceeds the {limit} byte limit for its type (job {job_id})")]
    AssetTooLarge {
        job_id: String,
        size: u64,
        limit: u64,
    },

    #[error("Work dispatcher is disabled on this node")]
    DispatchDisabled,

    #[error("Render agent '{0}' is not accepting work")]
    QueueClosed(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {job_id} on '{agent}' cannot be cancelled")]
    CancellationUnsupported { job_id: String, agent: String },

    #[error("Job {0} is not waiting for an encoder notification")]
    NotDelegated(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Placeholder(#[from] PlaceholderError),
}

impl DispatchError {
    pub fn code(&self) -> FailureCode {
        match self {
            DispatchError::UnsupportedType { .. } => FailureCode::UnsupportedType,
            DispatchError::AssetTooLarge { .. } => FailureCode::AssetTooLarge,
            DispatchError::DispatchDisabled | DispatchError::QueueClosed(_) => {
                FailureCode::DispatchDisabled
            }
            DispatchError::NotFound(_) => FailureCode::NotFound,
            DispatchError::CancellationUnsupported { .. } | DispatchError::NotDelegated(_) => {
                FailureCode::ConversionFailed
            }
            DispatchError::Store(e) => e.code(),
            DispatchError::Transfer(e) => e.code(),
            DispatchError::Render(e) => e.code(),
            DispatchError::Placeholder(e) => e.code(),
        }
    }

    /// The job record created alongside an admission rejection, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            DispatchError::UnsupportedType { job_id, .. }
            | DispatchError::AssetTooLarge { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PreviewError>;
