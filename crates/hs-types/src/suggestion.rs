//! Suggestion records: one running instance of the algorithm service for an
//! Experiment plus its backlog of trial assignments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::common::{
    AlgorithmSetting, AlgorithmSpec, EarlyStoppingRule, EarlyStoppingSpec, ParameterAssignment,
    ResumePolicy,
};
use crate::condition::{ConditionStatus, Conditions};
use crate::impl_resource;
use crate::meta::ObjectMeta;

pub const SUGGESTION_CREATED_REASON: &str = "SuggestionCreated";
pub const SUGGESTION_DEPLOYMENT_READY_REASON: &str = "DeploymentReady";
pub const SUGGESTION_DEPLOYMENT_NOT_READY_REASON: &str = "DeploymentNotReady";
pub const SUGGESTION_RUNNING_REASON: &str = "SuggestionRunning";
pub const SUGGESTION_SUCCEEDED_REASON: &str = "SuggestionSucceeded";
pub const SUGGESTION_FAILED_REASON: &str = "SuggestionFailed";
pub const SUGGESTION_RESTARTING_REASON: &str = "SuggestionRestarting";
pub const SUGGESTION_EXHAUSTED_REASON: &str = "SuggestionExhausted";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionSpec {
    pub algorithm: AlgorithmSpec,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingSpec>,
    /// Total number of assignments the algorithm service may hand out.
    pub requests: u32,
    #[serde(default)]
    pub resume_policy: ResumePolicy,
}

impl SuggestionSpec {
    /// Early stopping algorithm name, when early stopping is configured.
    pub fn early_stopping_algorithm(&self) -> Option<&str> {
        self.early_stopping
            .as_ref()
            .map(|e| e.algorithm_name.as_str())
            .filter(|name| !name.is_empty())
    }
}

/// A named bundle of parameter values waiting to become a Trial.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialAssignment {
    pub name: String,
    pub parameter_assignments: Vec<ParameterAssignment>,
    #[serde(default)]
    pub early_stopping_rules: Vec<EarlyStoppingRule>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SuggestionConditionType {
    Created,
    DeploymentReady,
    Running,
    Succeeded,
    Failed,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionStatus {
    #[serde(default)]
    pub conditions: Conditions<SuggestionConditionType>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub suggestion_count: u32,
    #[serde(default)]
    pub suggestions: Vec<TrialAssignment>,
    /// Settings the algorithm service asked to carry into later calls.
    #[serde(default)]
    pub algorithm_settings: Vec<AlgorithmSetting>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub meta: ObjectMeta,
    pub spec: SuggestionSpec,
    #[serde(default)]
    pub status: SuggestionStatus,
}

impl_resource!(Suggestion, "Suggestion");

impl Suggestion {
    pub fn new(meta: ObjectMeta, spec: SuggestionSpec) -> Self {
        Self {
            meta,
            spec,
            status: SuggestionStatus::default(),
        }
    }

    /// Name shared by the algorithm Deployment, Service and volume claim:
    /// `<suggestion>-<algorithm>`.
    pub fn runtime_name(&self) -> String {
        format!("{}-{}", self.meta.name, self.spec.algorithm.algorithm_name)
    }

    /// Name of the cluster-scoped volume backing the claim, which has to be
    /// unique across namespaces.
    pub fn persistent_volume_name(&self) -> String {
        format!("{}-{}", self.runtime_name(), self.meta.namespace)
    }

    /// Service account the early stopping sidecar needs RBAC for.
    pub fn rbac_name(&self) -> String {
        self.runtime_name()
    }

    pub fn is_created(&self) -> bool {
        self.status.conditions.is_true(SuggestionConditionType::Created)
    }

    pub fn is_deployment_ready(&self) -> bool {
        self.status
            .conditions
            .is_true(SuggestionConditionType::DeploymentReady)
    }

    pub fn is_running(&self) -> bool {
        self.status.conditions.is_true(SuggestionConditionType::Running)
    }

    pub fn is_succeeded(&self) -> bool {
        self.status
            .conditions
            .is_true(SuggestionConditionType::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        self.status.conditions.is_true(SuggestionConditionType::Failed)
    }

    pub fn is_exhausted(&self) -> bool {
        self.status
            .conditions
            .is_true(SuggestionConditionType::Exhausted)
    }

    pub fn is_completed(&self) -> bool {
        self.is_succeeded() || self.is_failed()
    }

    pub fn mark_created(&mut self, reason: &str, message: &str) {
        self.status.conditions.set(
            SuggestionConditionType::Created,
            ConditionStatus::True,
            reason,
            message,
        );
    }

    pub fn mark_deployment_ready(&mut self, status: ConditionStatus, reason: &str, message: &str) {
        self.status.conditions.set(
            SuggestionConditionType::DeploymentReady,
            status,
            reason,
            message,
        );
    }

    /// Set the Running condition. Also drops a Succeeded condition so a
    /// suggestion retained on its volume can come back.
    pub fn mark_running(&mut self, status: ConditionStatus, reason: &str, message: &str) {
        self.status.conditions.remove(SuggestionConditionType::Succeeded);
        self.status.completion_time = None;
        self.status
            .conditions
            .set(SuggestionConditionType::Running, status, reason, message);
    }

    pub fn mark_succeeded(&mut self, reason: &str, message: &str) {
        self.stop_running();
        self.status.conditions.set(
            SuggestionConditionType::Succeeded,
            ConditionStatus::True,
            reason,
            message,
        );
        self.stamp_completion();
    }

    pub fn mark_failed(&mut self, reason: &str, message: &str) {
        self.stop_running();
        self.status.conditions.set(
            SuggestionConditionType::Failed,
            ConditionStatus::True,
            reason,
            message,
        );
        self.stamp_completion();
    }

    pub fn mark_exhausted(&mut self, reason: &str, message: &str) {
        self.status.conditions.set(
            SuggestionConditionType::Exhausted,
            ConditionStatus::True,
            reason,
            message,
        );
    }

    fn stop_running(&mut self) {
        let current = self
            .status
            .conditions
            .get(SuggestionConditionType::Running)
            .map(|c| (c.reason.clone(), c.message.clone()));
        if let Some((reason, message)) = current {
            self.status.conditions.set(
                SuggestionConditionType::Running,
                ConditionStatus::False,
                &reason,
                &message,
            );
        }
    }

    fn stamp_completion(&mut self) {
        if self.status.completion_time.is_none() {
            self.status.completion_time = Some(Utc::now());
        }
    }
}
