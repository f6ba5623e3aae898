//! Controller configuration, loaded from a JSON file with every field
//! defaulted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::HsResult;
use crate::experiment::DEFAULT_PARALLEL_TRIAL_COUNT;
use crate::runtime::ResourceRequirements;

/// Storage class of claims that are backed by a controller-created local volume.
pub const DEFAULT_STORAGE_CLASS: &str = "hypersearch-local";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistentVolumeClaimSettings {
    pub storage_class_name: String,
    pub access_modes: Vec<String>,
    pub storage: String,
}

impl Default for PersistentVolumeClaimSettings {
    fn default() -> Self {
        Self {
            storage_class_name: DEFAULT_STORAGE_CLASS.to_string(),
            access_modes: vec!["ReadWriteOnce".to_string()],
            storage: "1Gi".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistentVolumeSettings {
    pub host_path: String,
}

impl Default for PersistentVolumeSettings {
    fn default() -> Self {
        Self {
            host_path: "/tmp/hypersearch/suggestions".to_string(),
        }
    }
}

/// How the runtime of one suggestion algorithm is deployed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SuggestionConfig {
    pub image: String,
    pub resources: ResourceRequirements,
    /// Service account the algorithm pod runs as. `None` uses the namespace default.
    pub service_account_name: Option<String>,
    pub volume_mount_path: String,
    pub persistent_volume_claim: PersistentVolumeClaimSettings,
    pub persistent_volume: PersistentVolumeSettings,
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            resources: ResourceRequirements::default(),
            service_account_name: None,
            volume_mount_path: "/opt/hypersearch/data".to_string(),
            persistent_volume_claim: PersistentVolumeClaimSettings::default(),
            persistent_volume: PersistentVolumeSettings::default(),
        }
    }
}

impl SuggestionConfig {
    pub fn with_image(image: &str) -> Self {
        Self {
            image: image.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EarlyStoppingConfig {
    pub image: String,
    pub resources: ResourceRequirements,
}

/// Knobs of the controller runtime itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Worker tasks per controller.
    pub workers: usize,
    pub rpc_timeout_secs: u64,
    pub trial_delete_timeout_secs: u64,
    pub trial_delete_poll_millis: u64,
    pub default_parallel_trial_count: u32,
    pub suggestion_port: u16,
    pub early_stopping_port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            rpc_timeout_secs: 60,
            trial_delete_timeout_secs: 60,
            trial_delete_poll_millis: 500,
            default_parallel_trial_count: DEFAULT_PARALLEL_TRIAL_COUNT,
            suggestion_port: 6789,
            early_stopping_port: 6788,
        }
    }
}

impl RuntimeConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn trial_delete_timeout(&self) -> Duration {
        Duration::from_secs(self.trial_delete_timeout_secs)
    }

    pub fn trial_delete_poll_interval(&self) -> Duration {
        Duration::from_millis(self.trial_delete_poll_millis)
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Algorithm name -> runtime settings of its suggestion service.
    pub suggestion: BTreeMap<String, SuggestionConfig>,
    /// Early stopping algorithm name -> runtime settings.
    pub early_stopping: BTreeMap<String, EarlyStoppingConfig>,
    /// Metrics collector kind -> sidecar image.
    pub metrics_collector: BTreeMap<String, String>,
    pub runtime: RuntimeConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let mut suggestion = BTreeMap::new();
        suggestion.insert(
            "random".to_string(),
            SuggestionConfig::with_image("hypersearch/suggestion-random:latest"),
        );
        suggestion.insert(
            "grid".to_string(),
            SuggestionConfig::with_image("hypersearch/suggestion-grid:latest"),
        );

        let mut early_stopping = BTreeMap::new();
        early_stopping.insert(
            "medianstop".to_string(),
            EarlyStoppingConfig {
                image: "hypersearch/earlystopping-medianstop:latest".to_string(),
                resources: ResourceRequirements::default(),
            },
        );

        let mut metrics_collector = BTreeMap::new();
        metrics_collector.insert(
            "StdOut".to_string(),
            "hypersearch/file-metrics-collector:latest".to_string(),
        );

        Self {
            suggestion,
            early_stopping,
            metrics_collector,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> HsResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> HsResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }
}
