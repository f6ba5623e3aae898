use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::common::{
    AlgorithmSpec, EarlyStoppingSpec, Metric, ObjectiveSpec, ParameterAssignment, ResumePolicy,
};
use crate::condition::{ConditionStatus, Conditions};
use crate::impl_resource;
use crate::meta::{ObjectMeta, OwnerReference, Resource};

pub const EXPERIMENT_CREATED_REASON: &str = "ExperimentCreated";
pub const EXPERIMENT_RUNNING_REASON: &str = "ExperimentRunning";
pub const EXPERIMENT_RESTARTING_REASON: &str = "ExperimentRestarting";
pub const EXPERIMENT_GOAL_REACHED_REASON: &str = "ExperimentGoalReached";
pub const EXPERIMENT_MAX_TRIALS_REACHED_REASON: &str = "ExperimentMaxTrialsReached";
pub const EXPERIMENT_SUGGESTION_END_REACHED_REASON: &str = "ExperimentSuggestionEndReached";
pub const EXPERIMENT_MAX_FAILED_TRIALS_REACHED_REASON: &str = "ExperimentMaxFailedTrialsReached";
pub const EXPERIMENT_FAILED_REASON: &str = "ExperimentFailed";

/// Parallelism used when the Experiment does not set one.
pub const DEFAULT_PARALLEL_TRIAL_COUNT: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterType {
    #[serde(rename = "double")]
    Double,
    #[serde(rename = "int")]
    Int,
    #[serde(rename = "discrete")]
    Discrete,
    #[serde(rename = "categorical")]
    Categorical,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeasibleSpace {
    #[serde(default)]
    pub min: Option<String>,
    #[serde(default)]
    pub max: Option<String>,
    #[serde(default)]
    pub list: Vec<String>,
    #[serde(default)]
    pub step: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    pub parameter_type: ParameterType,
    pub feasible_space: FeasibleSpace,
}

impl ParameterSpec {
    pub fn double(name: &str, min: f64, max: f64) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType::Double,
            feasible_space: FeasibleSpace {
                min: Some(min.to_string()),
                max: Some(max.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn int(name: &str, min: i64, max: i64) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType::Int,
            feasible_space: FeasibleSpace {
                min: Some(min.to_string()),
                max: Some(max.to_string()),
                ..Default::default()
            },
        }
    }

    pub fn categorical(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            parameter_type: ParameterType::Categorical,
            feasible_space: FeasibleSpace {
                list: values.iter().map(|v| v.to_string()).collect(),
                ..Default::default()
            },
        }
    }
}

/// Maps a template placeholder to a parameter of the search space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialParameterSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub reference: String,
}

/// Run document template each Trial is expanded from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialTemplate {
    #[serde(default)]
    pub trial_spec: serde_json::Value,
    #[serde(default)]
    pub trial_parameters: Vec<TrialParameterSpec>,
    #[serde(default)]
    pub primary_container_name: String,
    #[serde(default)]
    pub success_condition: String,
    #[serde(default)]
    pub failure_condition: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    pub objective: ObjectiveSpec,
    pub algorithm: AlgorithmSpec,
    #[serde(default)]
    pub early_stopping: Option<EarlyStoppingSpec>,
    #[serde(default)]
    pub trial_template: TrialTemplate,
    #[serde(default)]
    pub parallel_trial_count: Option<u32>,
    #[serde(default)]
    pub max_trial_count: Option<u32>,
    #[serde(default)]
    pub max_failed_trial_count: Option<u32>,
    #[serde(default)]
    pub resume_policy: ResumePolicy,
    #[serde(default = "default_collector_kind")]
    pub metrics_collector_kind: String,
}

fn default_collector_kind() -> String {
    "StdOut".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperimentConditionType {
    Created,
    Running,
    Restarting,
    Succeeded,
    Failed,
}

/// Snapshot of the best Trial seen so far.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimalTrial {
    pub best_trial_name: String,
    pub parameter_assignments: Vec<ParameterAssignment>,
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    #[serde(default)]
    pub conditions: Conditions<ExperimentConditionType>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub trials: u32,
    #[serde(default)]
    pub trials_pending: u32,
    #[serde(default)]
    pub trials_running: u32,
    #[serde(default)]
    pub trials_succeeded: u32,
    #[serde(default)]
    pub trials_failed: u32,
    #[serde(default)]
    pub trials_killed: u32,
    #[serde(default)]
    pub trials_early_stopped: u32,
    #[serde(default)]
    pub trial_metrics_unavailable: u32,

    #[serde(default)]
    pub pending_trial_list: Vec<String>,
    #[serde(default)]
    pub running_trial_list: Vec<String>,
    #[serde(default)]
    pub succeeded_trial_list: Vec<String>,
    #[serde(default)]
    pub failed_trial_list: Vec<String>,
    #[serde(default)]
    pub killed_trial_list: Vec<String>,
    #[serde(default)]
    pub early_stopped_trial_list: Vec<String>,
    #[serde(default)]
    pub metrics_unavailable_trial_list: Vec<String>,

    #[serde(default)]
    pub current_optimal_trial: OptimalTrial,
}

impl ExperimentStatus {
    pub fn active_count(&self) -> u32 {
        self.trials_pending + self.trials_running
    }

    pub fn completed_count(&self) -> u32 {
        self.trials_succeeded
            + self.trials_failed
            + self.trials_killed
            + self.trials_early_stopped
            + self.trial_metrics_unavailable
    }

    /// Total length of the per-state name lists; equals `trials` after an
    /// evaluation pass.
    pub fn listed_count(&self) -> usize {
        self.pending_trial_list.len()
            + self.running_trial_list.len()
            + self.succeeded_trial_list.len()
            + self.failed_trial_list.len()
            + self.killed_trial_list.len()
            + self.early_stopped_trial_list.len()
            + self.metrics_unavailable_trial_list.len()
    }
}

/// A declared hyperparameter search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub meta: ObjectMeta,
    pub spec: ExperimentSpec,
    #[serde(default)]
    pub status: ExperimentStatus,
}

impl_resource!(Experiment, "Experiment");

impl Experiment {
    pub fn new(meta: ObjectMeta, spec: ExperimentSpec) -> Self {
        Self {
            meta,
            spec,
            status: ExperimentStatus::default(),
        }
    }

    pub fn owner_reference(&self) -> Option<OwnerReference> {
        self.meta.owner_reference(Self::KIND)
    }

    pub fn parallel_trial_count(&self) -> u32 {
        self.spec
            .parallel_trial_count
            .unwrap_or(DEFAULT_PARALLEL_TRIAL_COUNT)
    }

    pub fn is_created(&self) -> bool {
        self.status.conditions.is_true(ExperimentConditionType::Created)
    }

    pub fn is_running(&self) -> bool {
        self.status.conditions.is_true(ExperimentConditionType::Running)
    }

    pub fn is_restarting(&self) -> bool {
        self.status
            .conditions
            .is_true(ExperimentConditionType::Restarting)
    }

    pub fn is_succeeded(&self) -> bool {
        self.status
            .conditions
            .is_true(ExperimentConditionType::Succeeded)
    }

    pub fn is_failed(&self) -> bool {
        self.status.conditions.is_true(ExperimentConditionType::Failed)
    }

    pub fn is_completed(&self) -> bool {
        self.is_succeeded() || self.is_failed()
    }

    /// Whether the Experiment succeeded for `reason`.
    pub fn is_completed_reason(&self, reason: &str) -> bool {
        self.status
            .conditions
            .is_true_with_reason(ExperimentConditionType::Succeeded, reason)
    }

    pub fn has_active_trials(&self) -> bool {
        self.status.active_count() > 0
    }

    pub fn mark_created(&mut self, reason: &str, message: &str) {
        self.status.conditions.set(
            ExperimentConditionType::Created,
            ConditionStatus::True,
            reason,
            message,
        );
    }

    pub fn mark_running(&mut self, reason: &str, message: &str) {
        self.status.conditions.remove(ExperimentConditionType::Restarting);
        self.status.conditions.set(
            ExperimentConditionType::Running,
            ConditionStatus::True,
            reason,
            message,
        );
    }

    pub fn mark_restarting(&mut self, reason: &str, message: &str) {
        self.status.conditions.remove(ExperimentConditionType::Succeeded);
        self.status.conditions.remove(ExperimentConditionType::Failed);
        self.status.completion_time = None;
        self.status.conditions.set(
            ExperimentConditionType::Restarting,
            ConditionStatus::True,
            reason,
            message,
        );
    }

    pub fn mark_succeeded(&mut self, reason: &str, message: &str) {
        self.stop_running();
        self.status.conditions.set(
            ExperimentConditionType::Succeeded,
            ConditionStatus::True,
            reason,
            message,
        );
        self.stamp_completion();
    }

    pub fn mark_failed(&mut self, reason: &str, message: &str) {
        self.stop_running();
        self.status.conditions.set(
            ExperimentConditionType::Failed,
            ConditionStatus::True,
            reason,
            message,
        );
        self.stamp_completion();
    }

    fn stop_running(&mut self) {
        let current = self
            .status
            .conditions
            .get(ExperimentConditionType::Running)
            .map(|c| (c.reason.clone(), c.message.clone()));
        if let Some((reason, message)) = current {
            self.status.conditions.set(
                ExperimentConditionType::Running,
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ObjectiveType, ResumePolicy};

    fn sample_experiment() -> Experiment {
        let spec = ExperimentSpec {
            parameters: vec![
                ParameterSpec::double("lr", 0.01, 0.1),
                ParameterSpec::int("layers", 1, 4),
                ParameterSpec::categorical("optimizer", &["sgd", "adam"]),
            ],
            objective: ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy").with_goal(0.9),
            algorithm: AlgorithmSpec::new("random"),
            max_trial_count: Some(10),
            resume_policy: ResumePolicy::LongRunning,
            ..Default::default()
        };
        Experiment::new(ObjectMeta::new("default", "mnist"), spec)
    }

    #[test]
    fn experiment_status_lifecycle() {
        let mut exp = sample_experiment();
        assert!(!exp.is_created());

        exp.mark_created(EXPERIMENT_CREATED_REASON, "created");
        assert!(exp.is_created());

        exp.mark_running(EXPERIMENT_RUNNING_REASON, "running");
        assert!(exp.is_running());
        assert!(!exp.is_completed());

        exp.mark_succeeded(EXPERIMENT_MAX_TRIALS_REACHED_REASON, "done");
        assert!(exp.is_succeeded());
        assert!(!exp.is_running());
        assert!(exp.is_completed_reason(EXPERIMENT_MAX_TRIALS_REACHED_REASON));
        assert!(exp.status.completion_time.is_some());
    }

    #[test]
    fn restarting_clears_completion() {
        let mut exp = sample_experiment();
        exp.mark_created(EXPERIMENT_CREATED_REASON, "");
        exp.mark_running(EXPERIMENT_RUNNING_REASON, "");
        exp.mark_succeeded(EXPERIMENT_MAX_TRIALS_REACHED_REASON, "");

        exp.mark_restarting(EXPERIMENT_RESTARTING_REASON, "restarted");
        assert!(!exp.is_completed());
        assert!(exp.is_restarting());
        assert!(exp.status.completion_time.is_none());

        exp.mark_running(EXPERIMENT_RUNNING_REASON, "running again");
        assert!(!exp.is_restarting());
        assert!(exp.is_running());
    }

    #[test]
    fn default_parallelism() {
        let mut exp = sample_experiment();
        assert_eq!(exp.parallel_trial_count(), DEFAULT_PARALLEL_TRIAL_COUNT);
        exp.spec.parallel_trial_count = Some(5);
        assert_eq!(exp.parallel_trial_count(), 5);
    }

    #[test]
    fn experiment_manifest_parses() {
        let json = serde_json::json!({
            "meta": {"name": "mnist", "namespace": "ml"},
            "spec": {
                "parameters": [{
                    "name": "lr",
                    "parameterType": "double",
                    "feasibleSpace": {"min": "0.01", "max": "0.1"}
                }],
                "objective": {"type": "minimize", "objectiveMetricName": "loss"},
                "algorithm": {"algorithmName": "random"},
                "parallelTrialCount": 2,
                "maxTrialCount": 6,
                "resumePolicy": "FromVolume"
            }
        });
        let exp: Experiment = serde_json::from_value(json).unwrap();
        assert_eq!(exp.meta.namespace, "ml");
        assert_eq!(exp.spec.parameters[0].parameter_type, ParameterType::Double);
        assert_eq!(exp.spec.resume_policy, ResumePolicy::FromVolume);
        assert_eq!(exp.spec.metrics_collector_kind, "StdOut");
        assert_eq!(exp.status, ExperimentStatus::default());
    }
}
