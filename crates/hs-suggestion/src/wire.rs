//! Messages exchanged with the algorithm service.

use chrono::{DateTime, Utc};
use hs_types::{
    AlgorithmSetting, AlgorithmSpec, EarlyStoppingRule, EarlyStoppingSpec, ObjectiveSpec,
    ParameterAssignment, ParameterSpec, TrialConditionType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The parts of an Experiment an algorithm service needs to see.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireExperiment {
    pub name: String,
    pub namespace: String,
    pub parameters: Vec<ParameterSpec>,
    pub objective: ObjectiveSpec,
    pub algorithm: AlgorithmSpec,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingSpec>,
    #[serde(default)]
    pub parallel_trial_count: u32,
    #[serde(default)]
    pub max_trial_count: Option<u32>,
}

/// One metric collapsed to a single value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMetric {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTrial {
    pub name: String,
    pub objective: ObjectiveSpec,
    pub parameter_assignments: Vec<ParameterAssignment>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub metrics: Vec<WireMetric>,
    /// Latest lifecycle condition only.
    #[serde(default)]
    pub condition: Option<TrialConditionType>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSuggestionsRequest {
    pub experiment: WireExperiment,
    pub trials: Vec<WireTrial>,
    pub current_request_number: u32,
    pub total_request_number: u32,
}

/// One proposed Trial.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentSet {
    /// Name the service wants the Trial to carry. Empty lets the client pick.
    #[serde(default)]
    pub trial_name: String,
    pub assignments: Vec<ParameterAssignment>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetSuggestionsReply {
    pub parameter_assignments: Vec<AssignmentSet>,
    /// Settings to carry into every later call.
    #[serde(default)]
    pub algorithm_settings: Vec<AlgorithmSetting>,
    /// Set once the search space has no more points to hand out.
    #[serde(default)]
    pub search_exhausted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateAlgorithmSettingsRequest {
    pub experiment: WireExperiment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateEarlyStoppingSettingsRequest {
    pub experiment: WireExperiment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetEarlyStoppingRulesRequest {
    pub experiment: WireExperiment,
    pub trials: Vec<WireTrial>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetEarlyStoppingRulesReply {
    pub early_stopping_rules: Vec<EarlyStoppingRule>,
}
