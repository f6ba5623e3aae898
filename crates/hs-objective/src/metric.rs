//! Objective metric lookup on a Trial observation.

use hs_types::{ObjectiveSpec, Observation, UNAVAILABLE_METRIC_VALUE};

/// Value of the named metric in `observation`, extracted with the strategy
/// the objective configures for it. `None` when the metric was not observed
/// or every value is empty or `unavailable`.
pub fn observed_value<'a>(
    objective: &ObjectiveSpec,
    observation: &'a Observation,
    metric_name: &str,
) -> Option<&'a str> {
    let metric = observation.metric(metric_name)?;
    let value = metric.value_for(objective.strategy_for(metric_name));
    if value.is_empty() || value == UNAVAILABLE_METRIC_VALUE {
        None
    } else {
        Some(value)
    }
}

/// The objective metric value of an observation.
pub fn objective_value<'a>(objective: &ObjectiveSpec, observation: &'a Observation) -> Option<&'a str> {
    observed_value(objective, observation, &objective.objective_metric_name)
}
