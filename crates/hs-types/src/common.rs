//! Building blocks shared by Experiments, Trials and Suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Metric value reported when a metrics collector found nothing to record.
pub const UNAVAILABLE_METRIC_VALUE: &str = "unavailable";

/// Whether we are maximizing or minimizing the objective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveType {
    Minimize,
    Maximize,
}

impl Default for ObjectiveType {
    fn default() -> Self {
        Self::Maximize
    }
}

/// How a metric's time series collapses into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricStrategyType {
    #[serde(rename = "min")]
    Min,
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "latest")]
    Latest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStrategy {
    pub name: String,
    pub value: MetricStrategyType,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveSpec {
    #[serde(rename = "type")]
    pub objective_type: ObjectiveType,
    #[serde(default)]
    pub goal: Option<f64>,
    pub objective_metric_name: String,
    #[serde(default)]
    pub additional_metric_names: Vec<String>,
    #[serde(default)]
    pub metric_strategies: Vec<MetricStrategy>,
}

impl ObjectiveSpec {
    pub fn new(objective_type: ObjectiveType, metric: &str) -> Self {
        Self {
            objective_type,
            goal: None,
            objective_metric_name: metric.to_string(),
            additional_metric_names: Vec::new(),
            metric_strategies: Vec::new(),
        }
    }

    pub fn with_goal(mut self, goal: f64) -> Self {
        self.goal = Some(goal);
        self
    }

    pub fn with_strategy(mut self, metric: &str, strategy: MetricStrategyType) -> Self {
        self.metric_strategies.retain(|s| s.name != metric);
        self.metric_strategies.push(MetricStrategy {
            name: metric.to_string(),
            value: strategy,
        });
        self
    }

    /// Strategy configured for `metric`.
    ///
    /// Unconfigured objective metrics follow the objective direction; any
    /// other metric reports its latest value.
    pub fn strategy_for(&self, metric: &str) -> MetricStrategyType {
        if let Some(s) = self.metric_strategies.iter().find(|s| s.name == metric) {
            return s.value;
        }
        if metric == self.objective_metric_name {
            match self.objective_type {
                ObjectiveType::Minimize => MetricStrategyType::Min,
                ObjectiveType::Maximize => MetricStrategyType::Max,
            }
        } else {
            MetricStrategyType::Latest
        }
    }
}

/// A single named algorithm setting. Values are opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmSetting {
    pub name: String,
    pub value: String,
}

impl AlgorithmSetting {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmSpec {
    pub algorithm_name: String,
    #[serde(default)]
    pub algorithm_settings: Vec<AlgorithmSetting>,
}

impl AlgorithmSpec {
    pub fn new(name: &str) -> Self {
        Self {
            algorithm_name: name.to_string(),
            algorithm_settings: Vec::new(),
        }
    }

    pub fn with_setting(mut self, name: &str, value: &str) -> Self {
        self.algorithm_settings.push(AlgorithmSetting::new(name, value));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarlyStoppingSpec {
    pub algorithm_name: String,
    #[serde(default)]
    pub algorithm_settings: Vec<AlgorithmSetting>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonType {
    Equal,
    Less,
    Greater,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EarlyStoppingRule {
    pub name: String,
    pub value: String,
    pub comparison: ComparisonType,
    #[serde(default)]
    pub start_step: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterAssignment {
    pub name: String,
    pub value: String,
}

impl ParameterAssignment {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One observed metric. Values stay strings; metrics may be non-numeric.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub min: String,
    #[serde(default)]
    pub max: String,
    #[serde(default)]
    pub latest: String,
}

impl Metric {
    pub fn new(name: &str, min: &str, max: &str, latest: &str) -> Self {
        Self {
            name: name.to_string(),
            min: min.to_string(),
            max: max.to_string(),
            latest: latest.to_string(),
        }
    }

    /// A metric seen once with a single value.
    pub fn single(name: &str, value: &str) -> Self {
        Self::new(name, value, value, value)
    }

    /// Value under `strategy`.
    ///
    /// `Min` and `Max` fall back to the latest value when the extremum was
    /// never recorded or carries the unavailable sentinel.
    pub fn value_for(&self, strategy: MetricStrategyType) -> &str {
        let chosen = match strategy {
            MetricStrategyType::Min => self.min.as_str(),
            MetricStrategyType::Max => self.max.as_str(),
            MetricStrategyType::Latest => return self.latest.as_str(),
        };
        if chosen.is_empty() || chosen == UNAVAILABLE_METRIC_VALUE {
            self.latest.as_str()
        } else {
            chosen
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

impl Observation {
    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }
}

/// Whether a completed Experiment's suggestion runtime may be reused once the
/// Experiment is extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumePolicy {
    Never,
    LongRunning,
    FromVolume,
}

impl Default for ResumePolicy {
    fn default() -> Self {
        Self::Never
    }
}

impl fmt::Display for ResumePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => write!(f, "Never"),
            Self::LongRunning => write!(f, "LongRunning"),
            Self::FromVolume => write!(f, "FromVolume"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_strategies_follow_objective() {
        let mut objective = ObjectiveSpec::new(ObjectiveType::Minimize, "loss");
        objective.additional_metric_names.push("accuracy".into());

        assert_eq!(objective.strategy_for("loss"), MetricStrategyType::Min);
        assert_eq!(objective.strategy_for("accuracy"), MetricStrategyType::Latest);

        let objective = objective.with_strategy("loss", MetricStrategyType::Latest);
        assert_eq!(objective.strategy_for("loss"), MetricStrategyType::Latest);
    }

    #[test]
    fn maximize_defaults_to_max() {
        let objective = ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy");
        assert_eq!(objective.strategy_for("accuracy"), MetricStrategyType::Max);
    }

    #[test]
    fn metric_value_by_strategy() {
        let metric = Metric::new("loss", "0.01", "0.08", "0.05");
        assert_eq!(metric.value_for(MetricStrategyType::Min), "0.01");
        assert_eq!(metric.value_for(MetricStrategyType::Max), "0.08");
        assert_eq!(metric.value_for(MetricStrategyType::Latest), "0.05");
    }

    #[test]
    fn missing_extremum_falls_back_to_latest() {
        let unset = Metric::new("accuracy", "0.7", "", "0.75");
        assert_eq!(unset.value_for(MetricStrategyType::Max), "0.75");

        let sentinel = Metric::new(
            "accuracy",
            UNAVAILABLE_METRIC_VALUE,
            UNAVAILABLE_METRIC_VALUE,
            "0.75",
        );
        assert_eq!(sentinel.value_for(MetricStrategyType::Max), "0.75");
        assert_eq!(sentinel.value_for(MetricStrategyType::Min), "0.75");
    }

    #[test]
    fn objective_json_shape() {
        let json = serde_json::json!({
            "type": "maximize",
            "goal": 0.99,
            "objectiveMetricName": "accuracy",
            "metricStrategies": [{"name": "accuracy", "value": "latest"}]
        });
        let objective: ObjectiveSpec = serde_json::from_value(json).unwrap();
        assert_eq!(objective.objective_type, ObjectiveType::Maximize);
        assert_eq!(objective.goal, Some(0.99));
        assert_eq!(objective.strategy_for("accuracy"), MetricStrategyType::Latest);
    }
}
