//! Builder for test configurations.

#![allow(dead_code)]

use std::path::Path;

use preview::config::{
    default_config, AgentKind, AppConfig, RenderAgentSpec, StorageConfig, StorageEngine,
};

pub const MB: u64 = 1024 * 1024;

/// Builds an `AppConfig` rooted in a test directory with no agents.
pub struct ConfigBuilder {
    config: AppConfig,
}

impl ConfigBuilder {
    pub fn new(root: &Path) -> Self {
        let mut config = default_config(root).expect("default config must load");
        config.render_agents.clear();
        config.common.placeholder_groups.clear();
        Self { config }
    }

    pub fn agent(mut self, name: &str, spec: RenderAgentSpec) -> Self {
        self.config.render_agents.insert(name.to_string(), spec);
        self
    }

    /// A document agent with `count` workers and the 32 MiB docx limit.
    pub fn document_agent(self, count: usize) -> Self {
        self.agent(
            "documentRenderAgent",
            RenderAgentSpec::new(AgentKind::Document, count)
                .with_file_type("docx", Some(33554432))
                .with_file_type("doc", None),
        )
    }

    pub fn image_agent(self, count: usize) -> Self {
        self.agent(
            "imageRenderAgent",
            RenderAgentSpec::new(AgentKind::Image, count)
                .with_file_type("png", None)
                .with_file_type("jpg", None)
                .with_file_type("pdf", None),
        )
    }

    pub fn video_agent(self, count: usize) -> Self {
        self.agent(
            "videoRenderAgent",
            RenderAgentSpec::new(AgentKind::Video, count).with_file_type("mp4", Some(0)),
        )
    }

    pub fn placeholder_group(mut self, group: &str, extensions: &[&str]) -> Self {
        self.config.common.placeholder_groups.insert(
            group.to_string(),
            extensions.iter().map(|e| e.to_string()).collect(),
        );
        self
    }

    pub fn node_id(mut self, node_id: &str) -> Self {
        self.config.common.node_id = node_id.to_string();
        self
    }

    pub fn dispatcher_enabled(mut self, enabled: bool) -> Self {
        self.config.common.work_dispatcher_enabled = enabled;
        self
    }

    pub fn max_attempts(mut self, agent: &str, attempts: u32) -> Self {
        if let Some(spec) = self.config.render_agents.get_mut(agent) {
            spec.max_attempts = attempts;
        }
        self
    }

    pub fn sqlite(mut self, path: &Path) -> Self {
        self.config.storage = StorageConfig {
            engine: StorageEngine::Sqlite,
            path: Some(path.to_path_buf()),
            keyspace: "preview".to_string(),
        };
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}
