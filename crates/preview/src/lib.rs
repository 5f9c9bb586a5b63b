pub mod agent;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod placeholder;
pub mod storage;
pub mod transfer;

pub use agent::{AgentPool, AgentReport, Renderer, WorkLedger};
pub use config::{load_app_config, load_config, AgentKind, AppConfig, RenderAgentSpec};
pub use dispatch::{
    Dispatcher, EncoderNotification, EncoderState, JobEvent, JobReport, RecoveryReport, Resolution,
    SubmitRequest,
};
pub use error::{
    ConfigError, DispatchError, FailureCode, PlaceholderError, PreviewError, RenderError, Result,
    StoreError, TransferError,
};
pub use model::{Asset, AssetOrigin, JobStatus, RenderJob, Rendition};
pub use placeholder::{PlaceholderAsset, PlaceholderProvider};
pub use storage::{build_storage, MemoryStorage, SqliteStorage, Storage};
