//! Static substitute assets for types no render agent handles.
//!
//! Each group has pre-rendered images at `{basePath}/{group}/{size}.png`,
//! one per size in [`PLACEHOLDER_SIZES`]. Files are inspected once at
//! construction; lookups never touch disk.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::Serialize;

use crate::config::CommonConfig;
use crate::error::PlaceholderError;
use crate::model::Dimensions;

pub const PLACEHOLDER_SIZES: &[&str] = &["jumbo", "large", "medium", "small"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceholderAsset {
    pub group: String,
    /// One of [`PLACEHOLDER_SIZES`], or the configured default.
    pub variant: String,
    pub location: String,
    pub path: PathBuf,
    pub content_type: String,
    /// Zero when the file was missing at start-up.
    pub size: u64,
    pub dimensions: Option<Dimensions>,
}

pub struct PlaceholderProvider {
    by_extension: HashMap<String, String>,
    /// Keyed by `(group, variant)`.
    assets: BTreeMap<(String, String), PlaceholderAsset>,
    default_size: String,
}

impl PlaceholderProvider {
    pub fn new(common: &CommonConfig) -> Self {
        let base_path = PathBuf::from(&common.placeholder_base_path);
        let default_size = common.placeholder_size.clone();

        let mut sizes: Vec<&str> = PLACEHOLDER_SIZES.to_vec();
        if !sizes.contains(&default_size.as_str()) {
            sizes.push(default_size.as_str());
        }

        let mut by_extension = HashMap::new();
        let mut assets = BTreeMap::new();
        for (group, extensions) in &common.placeholder_groups {
            for extension in extensions {
                by_extension
                    .entry(extension.to_lowercase())
                    .or_insert_with(|| group.clone());
            }
            for size in &sizes {
                assets.insert(
                    (group.clone(), size.to_string()),
                    load_asset(&base_path, group, size),
                );
            }
        }

        log::info!(
            "Loaded {} placeholder groups in {} sizes from {}",
            common.placeholder_groups.len(),
            sizes.len(),
            base_path.display()
        );

        Self {
            by_extension,
            assets,
            default_size,
        }
    }

    pub fn group_for(&self, extension: &str) -> Result<&str, PlaceholderError> {
        self.by_extension
            .get(&extension.to_lowercase())
            .map(String::as_str)
            .ok_or_else(|| PlaceholderError::GroupNotFound(extension.to_string()))
    }

    /// The group's placeholder in the configured default size.
    pub fn lookup(&self, group: &str) -> Result<&PlaceholderAsset, PlaceholderError> {
        self.lookup_sized(group, &self.default_size)
    }

    pub fn lookup_sized(
        &self,
        group: &str,
        size: &str,
    ) -> Result<&PlaceholderAsset, PlaceholderError> {
        if let Some(asset) = self.assets.get(&(group.to_string(), size.to_string())) {
            return Ok(asset);
        }
        if self.groups().any(|g| g == group) {
            Err(PlaceholderError::SizeNotFound(size.to_string()))
        } else {
            Err(PlaceholderError::GroupNotFound(group.to_string()))
        }
    }

    pub fn for_extension(&self, extension: &str) -> Result<&PlaceholderAsset, PlaceholderError> {
        self.lookup(self.group_for(extension)?)
    }

    pub fn for_extension_sized(
        &self,
        extension: &str,
        size: &str,
    ) -> Result<&PlaceholderAsset, PlaceholderError> {
        self.lookup_sized(self.group_for(extension)?, size)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        let mut groups: Vec<&str> = self.assets.keys().map(|(g, _)| g.as_str()).collect();
        groups.dedup();
        groups.into_iter()
    }
}

fn load_asset(base_path: &std::path::Path, group: &str, size: &str) -> PlaceholderAsset {
    let file_name = format!("{}.png", size);
    let path = base_path.join(group).join(&file_name);

    let file_size = match std::fs::metadata(&path) {
        Ok(meta) => meta.len(),
        Err(e) => {
            log::warn!("Placeholder {} is not readable: {}", path.display(), e);
            0
        }
    };
    let dimensions = image::image_dimensions(&path)
        .ok()
        .map(|(width, height)| Dimensions { width, height });

    PlaceholderAsset {
        group: group.to_string(),
        variant: size.to_string(),
        location: format!("placeholder:///{}/{}", group, file_name),
        path,
        content_type: "image/png".to_string(),
        size: file_size,
        dimensions,
    }
}
