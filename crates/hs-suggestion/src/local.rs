//! In-process algorithm service.
//!
//! Backs the sandbox runtime and the controller tests: random and grid
//! search over the Experiment's feasible space, plus median stopping for
//! early stopping rules. Every reply is computed from the request alone, so
//! one instance can serve any number of Experiments.

use async_trait::async_trait;
use dashmap::DashMap;
use hs_types::{
    AlgorithmSetting, ComparisonType, EarlyStoppingRule, ObjectiveType, ParameterAssignment,
    ParameterSpec, ParameterType, TrialConditionType,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::service::{AlgorithmConnector, AlgorithmService, RpcResult, RpcStatus};
use crate::wire::{
    AssignmentSet, GetEarlyStoppingRulesReply, GetEarlyStoppingRulesRequest, GetSuggestionsReply,
    GetSuggestionsRequest, ValidateAlgorithmSettingsRequest, ValidateEarlyStoppingSettingsRequest,
    WireExperiment,
};

pub const RANDOM_ALGORITHM: &str = "random";
pub const GRID_ALGORITHM: &str = "grid";
pub const MEDIAN_STOP_ALGORITHM: &str = "medianstop";

const RANDOM_STATE_SETTING: &str = "random_state";
const MIN_TRIALS_REQUIRED_SETTING: &str = "min_trials_required";
const START_STEP_SETTING: &str = "start_step";

const DEFAULT_MIN_TRIALS_REQUIRED: usize = 3;
const DEFAULT_START_STEP: u32 = 4;

// ---------------------------------------------------------------------------
// Search space
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Axis {
    Float { low: f64, high: f64, step: Option<f64> },
    Int { low: i64, high: i64, step: i64 },
    Choice(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
struct Dimension {
    name: String,
    axis: Axis,
}

impl Dimension {
    fn parse(spec: &ParameterSpec) -> RpcResult<Self> {
        let space = &spec.feasible_space;
        let axis = match spec.parameter_type {
            ParameterType::Double => {
                let low: f64 = bound(&spec.name, "min", space.min.as_deref())?;
                let high: f64 = bound(&spec.name, "max", space.max.as_deref())?;
                if !(low.is_finite() && high.is_finite()) || low > high {
                    return Err(RpcStatus::invalid_argument(format!(
                        "parameter {}: invalid range [{}, {}]",
                        spec.name, low, high
                    )));
                }
                let step = match space.step.as_deref() {
                    Some(raw) => {
                        let step: f64 = bound(&spec.name, "step", Some(raw))?;
                        if !(step > 0.0) {
                            return Err(RpcStatus::invalid_argument(format!(
                                "parameter {}: step must be positive",
                                spec.name
                            )));
                        }
                        Some(step)
                    }
                    None => None,
                };
                Axis::Float { low, high, step }
            }
            ParameterType::Int => {
                let low: i64 = bound(&spec.name, "min", space.min.as_deref())?;
                let high: i64 = bound(&spec.name, "max", space.max.as_deref())?;
                if low > high {
                    return Err(RpcStatus::invalid_argument(format!(
                        "parameter {}: invalid range [{}, {}]",
                        spec.name, low, high
                    )));
                }
                let step = match space.step.as_deref() {
                    Some(raw) => bound::<i64>(&spec.name, "step", Some(raw))?,
                    None => 1,
                };
                if step <= 0 {
                    return Err(RpcStatus::invalid_argument(format!(
                        "parameter {}: step must be positive",
                        spec.name
                    )));
                }
                Axis::Int { low, high, step }
            }
            ParameterType::Discrete | ParameterType::Categorical => {
                if space.list.is_empty() {
                    return Err(RpcStatus::invalid_argument(format!(
                        "parameter {}: feasible list is empty",
                        spec.name
                    )));
                }
                Axis::Choice(space.list.clone())
            }
        };
        Ok(Self {
            name: spec.name.clone(),
            axis,
        })
    }

    fn sample(&self, rng: &mut StdRng) -> String {
        match &self.axis {
            Axis::Float { low, high, .. } => rng.gen_range(*low..=*high).to_string(),
            Axis::Int { low, high, .. } => rng.gen_range(*low..=*high).to_string(),
            Axis::Choice(values) => values[rng.gen_range(0..values.len())].clone(),
        }
    }

    /// Grid points along this dimension. Doubles need an explicit step.
    fn grid_values(&self) -> RpcResult<Vec<String>> {
        match &self.axis {
            Axis::Float { low, high, step } => {
                let step = step.ok_or_else(|| {
                    RpcStatus::invalid_argument(format!(
                        "parameter {}: grid search needs a step for double parameters",
                        self.name
                    ))
                })?;
                let count = ((high - low) / step + 1e-9).floor() as usize + 1;
                Ok((0..count)
                    .map(|i| round_point(low + i as f64 * step).to_string())
                    .collect())
            }
            Axis::Int { low, high, step } => Ok((*low..=*high)
                .step_by(*step as usize)
                .map(|v| v.to_string())
                .collect()),
            Axis::Choice(values) => Ok(values.clone()),
        }
    }
}

fn bound<T: FromStr>(parameter: &str, field: &str, raw: Option<&str>) -> RpcResult<T> {
    let raw = raw.ok_or_else(|| {
        RpcStatus::invalid_argument(format!("parameter {}: missing {}", parameter, field))
    })?;
    raw.trim().parse().map_err(|_| {
        RpcStatus::invalid_argument(format!("parameter {}: {} {:?} is not a number", parameter, field, raw))
    })
}

/// Drop float noise accumulated by repeated step addition.
fn round_point(value: f64) -> f64 {
    (value * 1e10).round() / 1e10
}

fn parse_space(parameters: &[ParameterSpec]) -> RpcResult<Vec<Dimension>> {
    if parameters.is_empty() {
        return Err(RpcStatus::invalid_argument("search space has no parameters"));
    }
    parameters.iter().map(Dimension::parse).collect()
}

/// Every point of the grid, addressed by index with the last dimension
/// varying fastest.
struct Grid {
    axes: Vec<(String, Vec<String>)>,
    size: usize,
}

impl Grid {
    fn build(dimensions: &[Dimension]) -> RpcResult<Self> {
        let mut axes = Vec::with_capacity(dimensions.len());
        let mut size: usize = 1;
        for dim in dimensions {
            let values = dim.grid_values()?;
            size = size
                .checked_mul(values.len())
                .ok_or_else(|| RpcStatus::invalid_argument("grid search space is too large"))?;
            axes.push((dim.name.clone(), values));
        }
        Ok(Self { axes, size })
    }

    fn point(&self, mut index: usize) -> Vec<ParameterAssignment> {
        let mut point = Vec::with_capacity(self.axes.len());
        for (name, values) in self.axes.iter().rev() {
            point.push(ParameterAssignment::new(name.clone(), values[index % values.len()].clone()));
            index /= values.len();
        }
        point.reverse();
        point
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

fn setting<'a>(settings: &'a [AlgorithmSetting], name: &str) -> Option<&'a str> {
    settings
        .iter()
        .find(|s| s.name == name)
        .map(|s| s.value.as_str())
}

fn reject_unknown(settings: &[AlgorithmSetting], known: &[&str], algorithm: &str) -> RpcResult<()> {
    match settings.iter().find(|s| !known.contains(&s.name.as_str())) {
        Some(unknown) => Err(RpcStatus::invalid_argument(format!(
            "unknown setting {} for algorithm {}",
            unknown.name, algorithm
        ))),
        None => Ok(()),
    }
}

fn parse_setting<T: FromStr>(settings: &[AlgorithmSetting], name: &str) -> RpcResult<Option<T>> {
    match setting(settings, name) {
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            RpcStatus::invalid_argument(format!("setting {}: invalid value {:?}", name, raw))
        }),
        None => Ok(None),
    }
}

fn random_state(settings: &[AlgorithmSetting]) -> RpcResult<Option<u64>> {
    parse_setting(settings, RANDOM_STATE_SETTING)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MedianStopSettings {
    min_trials_required: usize,
    start_step: u32,
}

impl MedianStopSettings {
    fn parse(experiment: &WireExperiment) -> RpcResult<Self> {
        let spec = experiment
            .early_stopping
            .as_ref()
            .ok_or_else(|| RpcStatus::invalid_argument("early stopping is not configured"))?;
        if spec.algorithm_name != MEDIAN_STOP_ALGORITHM {
            return Err(RpcStatus::invalid_argument(format!(
                "unknown early stopping algorithm {}",
                spec.algorithm_name
            )));
        }
        let settings = &spec.algorithm_settings;
        reject_unknown(
            settings,
            &[MIN_TRIALS_REQUIRED_SETTING, START_STEP_SETTING],
            MEDIAN_STOP_ALGORITHM,
        )?;

        let min_trials_required = parse_setting::<usize>(settings, MIN_TRIALS_REQUIRED_SETTING)?
            .unwrap_or(DEFAULT_MIN_TRIALS_REQUIRED);
        let start_step =
            parse_setting::<u32>(settings, START_STEP_SETTING)?.unwrap_or(DEFAULT_START_STEP);
        if min_trials_required == 0 || start_step == 0 {
            return Err(RpcStatus::invalid_argument(format!(
                "{} and {} must be at least 1",
                MIN_TRIALS_REQUIRED_SETTING, START_STEP_SETTING
            )));
        }
        Ok(Self {
            min_trials_required,
            start_step,
        })
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// One `GetSuggestions` call as seen by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuggestionCall {
    pub current_request_number: u32,
    pub total_request_number: u32,
}

#[derive(Debug, Default)]
pub struct LocalAlgorithmService {
    calls: Mutex<Vec<SuggestionCall>>,
}

impl LocalAlgorithmService {
    pub fn new() -> Self {
        Self::default()
    }

    /// `GetSuggestions` calls served so far, oldest first.
    pub fn calls(&self) -> Vec<SuggestionCall> {
        self.calls.lock().clone()
    }

    fn random(&self, request: &GetSuggestionsRequest, space: &[Dimension]) -> RpcResult<GetSuggestionsReply> {
        let offset = request
            .total_request_number
            .saturating_sub(request.current_request_number);
        let mut rng = match random_state(&request.experiment.algorithm.algorithm_settings)? {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(offset as u64)),
            None => StdRng::from_entropy(),
        };

        let parameter_assignments = (0..request.current_request_number)
            .map(|_| AssignmentSet {
                assignments: space
                    .iter()
                    .map(|dim| ParameterAssignment::new(dim.name.clone(), dim.sample(&mut rng)))
                    .collect(),
                ..Default::default()
            })
            .collect();

        Ok(GetSuggestionsReply {
            parameter_assignments,
            ..Default::default()
        })
    }

    fn grid(&self, request: &GetSuggestionsRequest, space: &[Dimension]) -> RpcResult<GetSuggestionsReply> {
        let grid = Grid::build(space)?;
        let offset = request
            .total_request_number
            .saturating_sub(request.current_request_number) as usize;
        let wanted = request.current_request_number as usize;
        let end = offset.saturating_add(wanted).min(grid.size);
        let start = offset.min(end);

        let parameter_assignments: Vec<AssignmentSet> = (start..end)
            .map(|index| AssignmentSet {
                assignments: grid.point(index),
                ..Default::default()
            })
            .collect();
        let search_exhausted = parameter_assignments.len() < wanted;
        if search_exhausted {
            debug!(
                experiment = %request.experiment.name,
                grid_size = grid.size,
                handed_out = end,
                "grid search space exhausted"
            );
        }

        Ok(GetSuggestionsReply {
            parameter_assignments,
            algorithm_settings: Vec::new(),
            search_exhausted,
        })
    }
}

#[async_trait]
impl AlgorithmService for LocalAlgorithmService {
    async fn get_suggestions(&self, request: GetSuggestionsRequest) -> RpcResult<GetSuggestionsReply> {
        self.calls.lock().push(SuggestionCall {
            current_request_number: request.current_request_number,
            total_request_number: request.total_request_number,
        });

        let space = parse_space(&request.experiment.parameters)?;
        match request.experiment.algorithm.algorithm_name.as_str() {
            RANDOM_ALGORITHM => self.random(&request, &space),
            GRID_ALGORITHM => self.grid(&request, &space),
            other => Err(RpcStatus::invalid_argument(format!("unknown algorithm {}", other))),
        }
    }

    async fn validate_algorithm_settings(
        &self,
        request: ValidateAlgorithmSettingsRequest,
    ) -> RpcResult<()> {
        let experiment = &request.experiment;
        let space = parse_space(&experiment.parameters)?;
        let settings = &experiment.algorithm.algorithm_settings;

        match experiment.algorithm.algorithm_name.as_str() {
            RANDOM_ALGORITHM => {
                reject_unknown(settings, &[RANDOM_STATE_SETTING], RANDOM_ALGORITHM)?;
                random_state(settings).map(|_| ())
            }
            GRID_ALGORITHM => {
                reject_unknown(settings, &[], GRID_ALGORITHM)?;
                Grid::build(&space).map(|_| ())
            }
            other => Err(RpcStatus::invalid_argument(format!("unknown algorithm {}", other))),
        }
    }

    async fn validate_early_stopping_settings(
        &self,
        request: ValidateEarlyStoppingSettingsRequest,
    ) -> RpcResult<()> {
        MedianStopSettings::parse(&request.experiment).map(|_| ())
    }

    async fn get_early_stopping_rules(
        &self,
        request: GetEarlyStoppingRulesRequest,
    ) -> RpcResult<GetEarlyStoppingRulesReply> {
        let settings = MedianStopSettings::parse(&request.experiment)?;
        let objective = &request.experiment.objective;

        let mut values: Vec<f64> = request
            .trials
            .iter()
            .filter(|t| t.condition == Some(TrialConditionType::Succeeded))
            .filter_map(|t| {
                t.metrics
                    .iter()
                    .find(|m| m.name == objective.objective_metric_name)
            })
            .filter_map(|m| m.value.parse::<f64>().ok())
            .collect();

        if values.len() < settings.min_trials_required {
            return Ok(GetEarlyStoppingRulesReply::default());
        }

        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] + values[mid]) / 2.0
        } else {
            values[mid]
        };

        let comparison = match objective.objective_type {
            ObjectiveType::Maximize => ComparisonType::Less,
            ObjectiveType::Minimize => ComparisonType::Greater,
        };

        Ok(GetEarlyStoppingRulesReply {
            early_stopping_rules: vec![EarlyStoppingRule {
                name: objective.objective_metric_name.clone(),
                value: median.to_string(),
                comparison,
                start_step: Some(settings.start_step),
            }],
        })
    }
}

/// Hands out one shared [`LocalAlgorithmService`] per endpoint.
#[derive(Debug, Default, Clone)]
pub struct LocalConnector {
    services: Arc<DashMap<String, Arc<LocalAlgorithmService>>>,
}

impl LocalConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The service behind `endpoint`, if anything connected to it yet.
    pub fn service(&self, endpoint: &str) -> Option<Arc<LocalAlgorithmService>> {
        self.services.get(endpoint).map(|s| Arc::clone(s.value()))
    }

    fn service_for(&self, endpoint: &str) -> Arc<LocalAlgorithmService> {
        Arc::clone(
            self.services
                .entry(endpoint.to_string())
                .or_insert_with(|| Arc::new(LocalAlgorithmService::new()))
                .value(),
        )
    }
}

impl AlgorithmConnector for LocalConnector {
    fn connect(&self, endpoint: &str) -> Arc<dyn AlgorithmService> {
        self.service_for(endpoint)
    }
}
