//! Trial records: one concrete training run with fixed parameter assignments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{EarlyStoppingRule, ObjectiveSpec, Observation, ParameterAssignment};
use crate::condition::{ConditionStatus, Conditions};
use crate::impl_resource;
use crate::meta::ObjectMeta;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialSpec {
    pub objective: ObjectiveSpec,
    #[serde(default)]
    pub parameter_assignments: Vec<ParameterAssignment>,
    #[serde(default)]
    pub run_spec: serde_json::Value,
    #[serde(default)]
    pub early_stopping_rules: Vec<EarlyStoppingRule>,
    #[serde(default)]
    pub primary_container_name: String,
    #[serde(default)]
    pub success_condition: String,
    #[serde(default)]
    pub failure_condition: String,
    /// Sidecar image collecting the Trial's metrics, when the Experiment
    /// names a collector.
    #[serde(default)]
    pub metrics_collector_image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialConditionType {
    Created,
    Running,
    Succeeded,
    Killed,
    Failed,
    MetricsUnavailable,
    EarlyStopped,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStatus {
    #[serde(default)]
    pub conditions: Conditions<TrialConditionType>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observation: Option<Observation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub meta: ObjectMeta,
    pub spec: TrialSpec,
    #[serde(default)]
    pub status: TrialStatus,
}

impl_resource!(Trial, "Trial");

impl Trial {
    pub fn new(meta: ObjectMeta, spec: TrialSpec) -> Self {
        Self {
            meta,
            spec,
            status: TrialStatus::default(),
        }
    }

    pub fn is_created(&self) -> bool {
        self.status.conditions.is_true(TrialConditionType::Created)
    }

    pub fn is_running(&self) -> bool {
        self.status.conditions.is_true(TrialConditionType::Running)
    }

    pub fn is_succeeded(&self) -> bool {
        self.status.conditions.is_true(TrialConditionType::Succeeded)
    }

    pub fn is_killed(&self) -> bool {
        self.status.conditions.is_true(TrialConditionType::Killed)
    }

    pub fn is_failed(&self) -> bool {
        self.status.conditions.is_true(TrialConditionType::Failed)
    }

    pub fn is_metrics_unavailable(&self) -> bool {
        self.status
            .conditions
            .is_true(TrialConditionType::MetricsUnavailable)
    }

    pub fn is_early_stopped(&self) -> bool {
        self.status.conditions.is_true(TrialConditionType::EarlyStopped)
    }

    pub fn is_completed(&self) -> bool {
        self.is_succeeded()
            || self.is_failed()
            || self.is_killed()
            || self.is_early_stopped()
            || self.is_metrics_unavailable()
    }

    /// Whether an observation with at least one metric has been recorded.
    pub fn has_observation(&self) -> bool {
        self.status
            .observation
            .as_ref()
            .map(|o| !o.metrics.is_empty())
            .unwrap_or(false)
    }

    /// Latest lifecycle condition type, if any.
    pub fn latest_condition(&self) -> Option<TrialConditionType> {
        self.status.conditions.latest().map(|c| c.condition_type)
    }

    pub fn set_condition(&mut self, condition_type: TrialConditionType, reason: &str, message: &str) {
        self.status
            .conditions
            .set(condition_type, ConditionStatus::True, reason, message);
    }
}
