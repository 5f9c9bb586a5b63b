use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::json;

use crate::config::schema::{AppConfig, StorageEngine, UploaderEngine};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../../../schema/preview-config.json");

const CONFIG_FILE_NAME: &str = "preview.config";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<AppConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;
    load_config_from_value(json_value)
}

pub fn load_config_from_value(json_value: serde_json::Value) -> Result<AppConfig, ConfigError> {
    validate_schema(&json_value)?;

    let mut config: AppConfig = serde_json::from_value(json_value)?;

    normalize_extensions(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Loads the first config file found by [`determine_config_path`], or the
/// built-in defaults rooted at the current directory when none exists.
pub fn load_app_config(given: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match determine_config_path(given) {
        Some(path) => {
            log::info!("Loading configuration from {}", path.display());
            load_config(path)
        }
        None => {
            let cwd = std::env::current_dir().map_err(|e| ConfigError::ReadFile {
                path: PathBuf::from("."),
                source: e,
            })?;
            log::info!("No configuration file found, using built-in defaults");
            default_config(&cwd)
        }
    }
}

/// Candidate locations in priority order: the given path, `./preview.config`,
/// `~/.preview.config`, `/etc/preview.config`.
pub fn determine_config_path(given: Option<&Path>) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = given {
        candidates.push(path.to_path_buf());
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd.join(CONFIG_FILE_NAME));
    }
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(format!(".{}", CONFIG_FILE_NAME)));
    }
    candidates.push(PathBuf::from("/etc").join(CONFIG_FILE_NAME));

    candidates.into_iter().find(|p| p.is_file())
}

/// Built-in configuration with every working directory under `{root}/.cache`.
pub fn default_config(root: &Path) -> Result<AppConfig, ConfigError> {
    let cache = |section: &str| root.join(".cache").join(section).display().to_string();

    load_config_from_value(json!({
        "common": {
            "placeholderBasePath": cache("placeholders"),
            "placeholderGroups": {
                "image": ["jpg", "jpeg", "png", "gif", "pdf"],
                "document": ["doc", "docx"],
                "video": ["mp4"]
            },
            "placeholderSize": "jumbo",
            "localAssetStoragePath": cache("assets"),
            "nodeId": "E876F147E331",
            "workDispatcherEnabled": true
        },
        "http": { "listen": ":8080" },
        "storage": { "engine": "memory" },
        "renderAgents": {
            "documentRenderAgent": {
                "enabled": true,
                "count": 16,
                "fileTypes": { "doc": null, "docx": null, "ppt": null, "pptx": null },
                "rendererParams": { "tempFileBasePath": cache("documentRenderAgentTmp") }
            },
            "videoRenderAgent": {
                "enabled": false,
                "count": 16,
                "fileTypes": { "mp4": 0 },
                "rendererParams": {}
            },
            "imageMagickRenderAgent": {
                "enabled": true,
                "count": 16,
                "fileTypes": { "jpg": null, "jpeg": null, "png": null, "gif": null, "pdf": null },
                "rendererParams": {}
            }
        },
        "uploader": { "engine": "local", "basePath": cache("uploads") },
        "downloader": { "basePath": cache("cache"), "cacheEnabled": false }
    }))
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

/// Extensions are matched lower-case and without a leading dot.
fn normalize_extensions(config: &mut AppConfig) {
    for spec in config.render_agents.values_mut() {
        let file_types = std::mem::take(&mut spec.file_types);
        spec.file_types = file_types
            .into_iter()
            .map(|(ext, limit)| (normalize_extension(&ext), limit))
            .collect();
    }
    for extensions in config.common.placeholder_groups.values_mut() {
        for ext in extensions.iter_mut() {
            *ext = normalize_extension(ext);
        }
    }
}

pub fn normalize_extension(extension: &str) -> String {
    extension.trim().trim_start_matches('.').to_lowercase()
}

/// Semantic checks the schema cannot express. Also run on configurations
/// built in code before a dispatcher starts.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    // An extension maps to at most one enabled agent
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    for (name, spec) in config.enabled_agents() {
        spec.resolve_kind(name)?;

        if spec.count == 0 {
            return Err(ConfigError::Validation {
                message: format!("Render agent '{}' must have at least one worker", name),
            });
        }
        if spec.max_attempts == 0 || spec.timeout_seconds == 0 {
            return Err(ConfigError::Validation {
                message: format!(
                    "Render agent '{}' needs positive timeoutSeconds and maxAttempts",
                    name
                ),
            });
        }

        for extension in spec.file_types.keys() {
            if let Some(first) = owners.insert(extension.as_str(), name.as_str()) {
                return Err(ConfigError::DuplicateExtension {
                    extension: extension.clone(),
                    first: first.to_string(),
                    second: name.clone(),
                });
            }
        }
    }

    if config.storage.engine == StorageEngine::Sqlite && config.storage.path.is_none() {
        return Err(ConfigError::Validation {
            message: "storage.path is required for the sqlite engine".to_string(),
        });
    }

    match config.uploader.engine {
        UploaderEngine::Local => {
            if config.uploader.base_path.is_none() {
                return Err(ConfigError::Validation {
                    message: "uploader.basePath is required for the local engine".to_string(),
                });
            }
        }
        UploaderEngine::ObjectStore => match &config.uploader.object_store {
            Some(store) if !store.buckets.is_empty() => {}
            _ => {
                return Err(ConfigError::Validation {
                    message: "uploader.objectStore needs a host and at least one bucket"
                        .to_string(),
                });
            }
        },
    }

    if config.downloader.cache_enabled && config.downloader.cache_hosts.is_empty() {
        return Err(ConfigError::Validation {
            message: "downloader.cacheHosts must not be empty when the cache is enabled"
                .to_string(),
        });
    }

    Ok(())
}
