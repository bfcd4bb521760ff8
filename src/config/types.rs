use std::{
    collections::{BTreeSet, HashMap, HashSet},
    path::PathBuf,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::drift::DriftDefinition;

use super::defaults::{
    clamp_detector_threads, clamp_log_files_kept, clamp_poll_interval_ms,
    default_detector_threads, default_log_files_kept, default_poll_interval_ms,
};

/// Agent settings persisted as `config.toml`.
///
/// Unset directories fall back to folders under the agent root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_detector_threads")]
    pub detector_threads: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// `EnvFilter` directives used when `RUST_LOG` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
    /// Log files from earlier launches kept on startup, this one included.
    #[serde(default = "default_log_files_kept")]
    pub log_files_kept: usize,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Drift definitions monitored for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub resource_id: i32,
    #[serde(default)]
    pub definitions: Vec<DriftDefinition>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            temp_dir: None,
            outbox_dir: None,
            log_dir: None,
            detector_threads: default_detector_threads(),
            poll_interval_ms: default_poll_interval_ms(),
            log_filter: None,
            log_files_kept: default_log_files_kept(),
            resources: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Clamp numeric settings into their supported ranges.
    pub fn normalized(mut self) -> Self {
        self.detector_threads = clamp_detector_threads(self.detector_threads);
        self.poll_interval_ms = clamp_poll_interval_ms(self.poll_interval_ms);
        self.log_files_kept = clamp_log_files_kept(self.log_files_kept);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn resource_ids(&self) -> BTreeSet<i32> {
        self.resources.iter().map(|r| r.resource_id).collect()
    }

    /// Definitions grouped by resource, merging repeated `[[resources]]` blocks.
    pub fn definitions_by_resource(&self) -> HashMap<i32, Vec<DriftDefinition>> {
        let mut grouped: HashMap<i32, Vec<DriftDefinition>> = HashMap::new();
        for resource in &self.resources {
            grouped
                .entry(resource.resource_id)
                .or_default()
                .extend(resource.definitions.iter().cloned());
        }
        grouped
    }

    /// Describe the first problem that would stop the agent from scheduling.
    pub(crate) fn problem(&self) -> Option<String> {
        for (resource_id, definitions) in self.definitions_by_resource() {
            let mut names = HashSet::new();
            for definition in &definitions {
                let checked = definition
                    .validate()
                    .and_then(|()| definition.file_filter().map(drop));
                if let Err(err) = checked {
                    return Some(format!("resource {resource_id}: {err}"));
                }
                if !names.insert(definition.name.as_str()) {
                    return Some(format!(
                        "resource {resource_id}: duplicate drift definition '{}'",
                        definition.name
                    ));
                }
            }
        }
        None
    }
}
