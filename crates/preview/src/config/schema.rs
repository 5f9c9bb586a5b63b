use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The complete node configuration, loaded once at start-up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub common: CommonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub render_agents: BTreeMap<String, RenderAgentSpec>,
    #[serde(default)]
    pub uploader: UploaderConfig,
    #[serde(default)]
    pub downloader: DownloaderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonConfig {
    pub placeholder_base_path: String,
    #[serde(default)]
    pub placeholder_groups: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_placeholder_size")]
    pub placeholder_size: String,
    pub local_asset_storage_path: String,
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_true")]
    pub work_dispatcher_enabled: bool,
}

fn default_placeholder_size() -> String {
    "jumbo".to_string()
}

fn default_node_id() -> String {
    "E876F147E331".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    ":8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub engine: StorageEngine,
    /// Database file for the sqlite engine.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
}

fn default_keyspace() -> String {
    "preview".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Document,
    Image,
    Video,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Document => "document",
            AgentKind::Image => "image",
            AgentKind::Video => "video",
        }
    }

    /// Infers the kind from the agent names used by stock configurations.
    pub fn from_agent_name(name: &str) -> Option<Self> {
        match name {
            "documentRenderAgent" | "document" => Some(AgentKind::Document),
            "imageMagickRenderAgent" | "imageRenderAgent" | "image" => Some(AgentKind::Image),
            "videoRenderAgent" | "video" => Some(AgentKind::Video),
            _ => None,
        }
    }
}

/// Engine specific parameters. Always present, possibly empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RendererParams(pub BTreeMap<String, serde_json::Value>);

impl RendererParams {
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Reads a numeric parameter, accepting both JSON numbers and numeric strings.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderAgentSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub kind: Option<AgentKind>,
    #[serde(default = "default_agent_count")]
    pub count: usize,
    /// Extension to maximum input byte size; zero or null means no local limit.
    #[serde(default)]
    pub file_types: BTreeMap<String, Option<u64>>,
    #[serde(default)]
    pub renderer_params: RendererParams,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_agent_count() -> usize {
    num_cpus::get()
}

fn default_timeout_seconds() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

impl RenderAgentSpec {
    pub fn new(kind: AgentKind, count: usize) -> Self {
        Self {
            enabled: true,
            kind: Some(kind),
            count,
            file_types: BTreeMap::new(),
            renderer_params: RendererParams::default(),
            timeout_seconds: default_timeout_seconds(),
            max_attempts: default_max_attempts(),
        }
    }

    pub fn with_file_type(mut self, extension: &str, limit: Option<u64>) -> Self {
        self.file_types.insert(extension.to_lowercase(), limit);
        self
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.renderer_params.insert(key, value);
        self
    }

    /// Resolves the renderer kind, explicit `kind` first, then the agent name.
    pub fn resolve_kind(&self, name: &str) -> Result<AgentKind, ConfigError> {
        self.kind
            .or_else(|| AgentKind::from_agent_name(name))
            .ok_or_else(|| ConfigError::UnknownAgentKind(name.to_string()))
    }

    /// The byte limit for an extension, `None` when unlimited.
    pub fn limit_for(&self, extension: &str) -> Option<u64> {
        match self.file_types.get(extension) {
            Some(Some(limit)) if *limit > 0 => Some(*limit),
            _ => None,
        }
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.file_types.contains_key(extension)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UploaderEngine {
    #[default]
    Local,
    ObjectStore,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploaderConfig {
    #[serde(default)]
    pub engine: UploaderEngine,
    #[serde(default)]
    pub base_path: Option<PathBuf>,
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectStoreConfig {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub secret: String,
    pub host: String,
    #[serde(default)]
    pub buckets: Vec<String>,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloaderConfig {
    #[serde(default)]
    pub base_path: Option<PathBuf>,
    #[serde(default)]
    pub cache_enabled: bool,
    #[serde(default)]
    pub cache_hosts: Vec<String>,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

fn default_cache_capacity() -> u64 {
    10_000
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            base_path: None,
            cache_enabled: false,
            cache_hosts: Vec::new(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl AppConfig {
    /// Enabled agents with their resolved kinds, in name order.
    pub fn enabled_agents(&self) -> impl Iterator<Item = (&String, &RenderAgentSpec)> {
        self.render_agents.iter().filter(|(_, spec)| spec.enabled)
    }

    pub fn placeholder_group_for(&self, extension: &str) -> Option<&str> {
        self.common
            .placeholder_groups
            .iter()
            .find(|(_, extensions)| extensions.iter().any(|e| e.eq_ignore_ascii_case(extension)))
            .map(|(group, _)| group.as_str())
    }
}
