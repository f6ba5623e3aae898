//! Record to wire conversion and settings merging.

use hs_types::{AlgorithmSetting, Experiment, Trial};

use crate::wire::{WireExperiment, WireMetric, WireTrial};

/// Merge `overrides` into `base` by setting name.
///
/// Same-named entries take the override value in place; new names are
/// appended in override order. `base` order is preserved.
pub fn merge_by_name(base: &[AlgorithmSetting], overrides: &[AlgorithmSetting]) -> Vec<AlgorithmSetting> {
    let mut merged = base.to_vec();
    for setting in overrides {
        match merged.iter_mut().find(|s| s.name == setting.name) {
            Some(existing) => existing.value = setting.value.clone(),
            None => merged.push(setting.clone()),
        }
    }
    merged
}

pub fn experiment_to_wire(experiment: &Experiment) -> WireExperiment {
    WireExperiment {
        name: experiment.meta.name.clone(),
        namespace: experiment.meta.namespace.clone(),
        parameters: experiment.spec.parameters.clone(),
        objective: experiment.spec.objective.clone(),
        algorithm: experiment.spec.algorithm.clone(),
        early_stopping: experiment.spec.early_stopping.clone(),
        parallel_trial_count: experiment.parallel_trial_count(),
        max_trial_count: experiment.spec.max_trial_count,
    }
}

/// Wire form of the Experiment with `overrides` merged over its algorithm
/// settings.
pub fn experiment_with_settings(experiment: &Experiment, overrides: &[AlgorithmSetting]) -> WireExperiment {
    let mut wire = experiment_to_wire(experiment);
    wire.algorithm.algorithm_settings = merge_by_name(&wire.algorithm.algorithm_settings, overrides);
    wire
}

/// Wire form of a Trial. Each observed metric is collapsed with the
/// Experiment's strategy for it.
pub fn trial_to_wire(experiment: &Experiment, trial: &Trial) -> WireTrial {
    let objective = &experiment.spec.objective;
    let metrics = trial
        .status
        .observation
        .as_ref()
        .map(|o| {
            o.metrics
                .iter()
                .map(|m| WireMetric {
                    name: m.name.clone(),
                    value: m.value_for(objective.strategy_for(&m.name)).to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    WireTrial {
        name: trial.meta.name.clone(),
        objective: trial.spec.objective.clone(),
        parameter_assignments: trial.spec.parameter_assignments.clone(),
        labels: trial.meta.labels.clone(),
        metrics,
        condition: trial.latest_condition(),
        start_time: trial.status.start_time,
        completion_time: trial.status.completion_time,
    }
}

pub fn trials_to_wire(experiment: &Experiment, trials: &[Trial]) -> Vec<WireTrial> {
    trials.iter().map(|t| trial_to_wire(experiment, t)).collect()
}
