pub mod loader;
pub mod schema;

pub use loader::{
    default_config, determine_config_path, load_app_config, load_config, load_config_from_str,
    load_config_from_value, normalize_extension, validate_config,
};
pub use schema::{
    AgentKind, AppConfig, CommonConfig, DownloaderConfig, HttpConfig, ObjectStoreConfig,
    RenderAgentSpec, RendererParams, StorageConfig, StorageEngine, UploaderConfig, UploaderEngine,
};
