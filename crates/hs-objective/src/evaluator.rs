//! Trial classification and best-trial tracking for an Experiment.

use hs_types::{Experiment, ExperimentStatus, ObjectiveType, OptimalTrial, Resource, Trial};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::metric::objective_value;

/// The single bucket a Trial is counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrialPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
    EarlyStopped,
    MetricsUnavailable,
}

impl TrialPhase {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

/// Bucket for `trial`; the first matching condition in the order Killed,
/// Failed, Succeeded, EarlyStopped, Running, MetricsUnavailable wins.
pub fn classify(trial: &Trial) -> TrialPhase {
    if trial.is_killed() {
        TrialPhase::Killed
    } else if trial.is_failed() {
        TrialPhase::Failed
    } else if trial.is_succeeded() {
        TrialPhase::Succeeded
    } else if trial.is_early_stopped() {
        TrialPhase::EarlyStopped
    } else if trial.is_running() {
        TrialPhase::Running
    } else if trial.is_metrics_unavailable() {
        TrialPhase::MetricsUnavailable
    } else {
        TrialPhase::Pending
    }
}

/// Everything one evaluation pass derives from the live Trial set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrialsSummary {
    pub trials: u32,
    pub pending: Vec<String>,
    pub running: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub killed: Vec<String>,
    pub early_stopped: Vec<String>,
    pub metrics_unavailable: Vec<String>,
    pub optimal_trial: Option<OptimalTrial>,
    /// Best numeric objective value seen, if any Trial reported one.
    pub best_value: Option<f64>,
    pub goal_reached: bool,
}

impl TrialsSummary {
    pub fn active_count(&self) -> u32 {
        (self.pending.len() + self.running.len()) as u32
    }

    pub fn completed_count(&self) -> u32 {
        (self.succeeded.len()
            + self.failed.len()
            + self.killed.len()
            + self.early_stopped.len()
            + self.metrics_unavailable.len()) as u32
    }

    fn push(&mut self, phase: TrialPhase, name: String) {
        let list = match phase {
            TrialPhase::Pending => &mut self.pending,
            TrialPhase::Running => &mut self.running,
            TrialPhase::Succeeded => &mut self.succeeded,
            TrialPhase::Failed => &mut self.failed,
            TrialPhase::Killed => &mut self.killed,
            TrialPhase::EarlyStopped => &mut self.early_stopped,
            TrialPhase::MetricsUnavailable => &mut self.metrics_unavailable,
        };
        list.push(name);
    }
}

/// Classify every Trial and pick the current optimal one.
///
/// The first numeric objective value seeds the baseline, after which only a
/// strictly better value replaces it. A value that does not parse as a
/// number always takes over the optimal slot without touching the numeric
/// baseline.
pub fn summarize(experiment: &Experiment, trials: &[Trial]) -> TrialsSummary {
    let objective = &experiment.spec.objective;
    let mut summary = TrialsSummary::default();
    let mut best_index: Option<usize> = None;

    for (index, trial) in trials.iter().enumerate() {
        summary.trials += 1;
        summary.push(classify(trial), trial.meta.name.clone());

        let value = match trial
            .status
            .observation
            .as_ref()
            .and_then(|o| objective_value(objective, o))
        {
            Some(value) => value,
            None => continue,
        };

        let numeric = match value.parse::<f64>() {
            Ok(v) if !v.is_nan() => v,
            _ => {
                best_index = Some(index);
                continue;
            }
        };

        let improves = match summary.best_value {
            None => true,
            Some(best) => match objective.objective_type {
                ObjectiveType::Minimize => numeric < best,
                ObjectiveType::Maximize => numeric > best,
            },
        };
        if improves {
            summary.best_value = Some(numeric);
            best_index = Some(index);
        }
    }

    summary.goal_reached = match (objective.goal, summary.best_value) {
        (Some(goal), Some(best)) => match objective.objective_type {
            ObjectiveType::Minimize => best <= goal,
            ObjectiveType::Maximize => best >= goal,
        },
        _ => false,
    };

    summary.optimal_trial = best_index.map(|i| {
        let best = &trials[i];
        OptimalTrial {
            best_trial_name: best.meta.name.clone(),
            parameter_assignments: best.spec.parameter_assignments.clone(),
            metrics: best
                .status
                .observation
                .as_ref()
                .map(|o| o.metrics.clone())
                .unwrap_or_default(),
        }
    });

    debug!(
        experiment = %experiment.key(),
        trials = summary.trials,
        best = ?summary.best_value,
        goal_reached = summary.goal_reached,
        "evaluated trials"
    );
    summary
}

/// Write counts, name lists and the optimal-trial snapshot into `status`.
///
/// Conditions and timestamps are left alone. Without any scored Trial the
/// previous snapshot is kept.
pub fn apply_summary(status: &mut ExperimentStatus, summary: &TrialsSummary) {
    status.trials = summary.trials;
    status.trials_pending = summary.pending.len() as u32;
    status.trials_running = summary.running.len() as u32;
    status.trials_succeeded = summary.succeeded.len() as u32;
    status.trials_failed = summary.failed.len() as u32;
    status.trials_killed = summary.killed.len() as u32;
    status.trials_early_stopped = summary.early_stopped.len() as u32;
    status.trial_metrics_unavailable = summary.metrics_unavailable.len() as u32;

    status.pending_trial_list = summary.pending.clone();
    status.running_trial_list = summary.running.clone();
    status.succeeded_trial_list = summary.succeeded.clone();
    status.failed_trial_list = summary.failed.clone();
    status.killed_trial_list = summary.killed.clone();
    status.early_stopped_trial_list = summary.early_stopped.clone();
    status.metrics_unavailable_trial_list = summary.metrics_unavailable.clone();

    if let Some(optimal) = &summary.optimal_trial {
        status.current_optimal_trial = optimal.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::{
        AlgorithmSpec, ExperimentSpec, Metric, ObjectMeta, ObjectiveSpec, Observation,
        ParameterAssignment, TrialConditionType, TrialSpec, UNAVAILABLE_METRIC_VALUE,
    };

    fn experiment(objective: ObjectiveSpec) -> Experiment {
        Experiment::new(
            ObjectMeta::new("default", "mnist"),
            ExperimentSpec {
                objective,
                algorithm: AlgorithmSpec::new("random"),
                ..Default::default()
            },
        )
    }

    fn trial(name: &str, conditions: &[TrialConditionType], value: Option<&str>) -> Trial {
        let mut trial = Trial::new(
            ObjectMeta::new("default", name),
            TrialSpec {
                parameter_assignments: vec![ParameterAssignment::new("lr", name)],
                ..Default::default()
            },
        );
        for condition in conditions {
            trial.set_condition(*condition, "Test", "");
        }
        if let Some(v) = value {
            trial.status.observation = Some(Observation {
                metrics: vec![Metric::single("accuracy", v), Metric::single("loss", "0.3")],
            });
        }
        trial
    }

    #[test]
    fn test_classification_precedence() {
        use TrialConditionType::*;

        assert_eq!(classify(&trial("a", &[], None)), TrialPhase::Pending);
        assert_eq!(classify(&trial("a", &[Created], None)), TrialPhase::Pending);
        assert_eq!(classify(&trial("a", &[Created, Running], None)), TrialPhase::Running);
        assert_eq!(
            classify(&trial("a", &[Running, Succeeded, Killed], None)),
            TrialPhase::Killed
        );
        assert_eq!(classify(&trial("a", &[Succeeded, Failed], None)), TrialPhase::Failed);
        assert_eq!(
            classify(&trial("a", &[Running, EarlyStopped], None)),
            TrialPhase::EarlyStopped
        );
        assert_eq!(
            classify(&trial("a", &[Running, MetricsUnavailable], None)),
            TrialPhase::Running
        );
        assert_eq!(
            classify(&trial("a", &[MetricsUnavailable], None)),
            TrialPhase::MetricsUnavailable
        );
    }

    #[test]
    fn test_goal_detection() {
        use TrialConditionType::*;
        let exp = experiment(ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy").with_goal(0.9));
        let trials = vec![
            trial("t1", &[Succeeded], Some("0.80")),
            trial("t2", &[Succeeded], Some("0.95")),
            trial("t3", &[Running], Some("0.85")),
        ];

        let summary = summarize(&exp, &trials);
        assert!(summary.goal_reached);
        assert_eq!(summary.best_value, Some(0.95));

        let optimal = summary.optimal_trial.unwrap();
        assert_eq!(optimal.best_trial_name, "t2");
        assert_eq!(optimal.parameter_assignments[0].value, "t2");
        assert_eq!(optimal.metrics.len(), 2);
    }

    #[test]
    fn test_minimize_keeps_smallest() {
        use TrialConditionType::*;
        let exp = experiment(ObjectiveSpec::new(ObjectiveType::Minimize, "accuracy").with_goal(0.1));
        let trials = vec![
            trial("t1", &[Succeeded], Some("0.4")),
            trial("t2", &[Succeeded], Some("0.2")),
            trial("t3", &[Succeeded], Some("0.3")),
        ];

        let summary = summarize(&exp, &trials);
        assert!(!summary.goal_reached);
        assert_eq!(summary.optimal_trial.unwrap().best_trial_name, "t2");
    }

    #[test]
    fn test_non_numeric_value_takes_optimal_slot() {
        use TrialConditionType::*;
        let exp = experiment(ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy").with_goal(0.9));
        let trials = vec![
            trial("t1", &[Succeeded], Some("0.95")),
            trial("t2", &[Succeeded], Some("n/a")),
            trial("t3", &[Succeeded], Some("0.5")),
        ];

        let summary = summarize(&exp, &trials);
        assert_eq!(summary.optimal_trial.unwrap().best_trial_name, "t2");
        assert_eq!(summary.best_value, Some(0.95));
        assert!(summary.goal_reached);
    }

    #[test]
    fn test_trials_without_metric_are_skipped() {
        use TrialConditionType::*;
        let exp = experiment(ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy"));
        let trials = vec![trial("t1", &[Running], None), trial("t2", &[], None)];

        let summary = summarize(&exp, &trials);
        assert!(summary.optimal_trial.is_none());
        assert!(!summary.goal_reached);
        assert_eq!(summary.active_count(), 2);
    }

    #[test]
    fn test_unavailable_metrics_never_win() {
        use TrialConditionType::*;
        let exp = experiment(ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy"));
        let mut nometrics = trial("nometrics", &[MetricsUnavailable], None);
        nometrics.status.observation = Some(Observation {
            metrics: vec![Metric::new(
                "accuracy",
                UNAVAILABLE_METRIC_VALUE,
                UNAVAILABLE_METRIC_VALUE,
                UNAVAILABLE_METRIC_VALUE,
            )],
        });
        let trials = vec![trial("good", &[Succeeded], Some("0.93")), nometrics];

        let summary = summarize(&exp, &trials);
        assert_eq!(summary.optimal_trial.unwrap().best_trial_name, "good");
        assert_eq!(summary.best_value, Some(0.93));
        assert_eq!(summary.metrics_unavailable, vec!["nometrics".to_string()]);
    }

    #[test]
    fn test_apply_summary_partitions_trials() {
        use TrialConditionType::*;
        let exp = experiment(ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy"));
        let trials = vec![
            trial("a", &[], None),
            trial("b", &[Running], None),
            trial("c", &[Succeeded], Some("0.7")),
            trial("d", &[Failed], None),
            trial("e", &[Killed], None),
            trial("f", &[EarlyStopped], Some("0.6")),
            trial("g", &[MetricsUnavailable], None),
        ];

        let summary = summarize(&exp, &trials);
        let mut status = ExperimentStatus::default();
        apply_summary(&mut status, &summary);

        assert_eq!(status.trials, 7);
        assert_eq!(status.listed_count(), 7);
        assert_eq!(status.active_count(), 2);
        assert_eq!(status.completed_count(), 5);
        assert_eq!(status.succeeded_trial_list, vec!["c".to_string()]);
        assert_eq!(status.current_optimal_trial.best_trial_name, "c");

        // Same input, same status.
        let mut again = status.clone();
        apply_summary(&mut again, &summarize(&exp, &trials));
        assert_eq!(again, status);
    }
}
