//! Manifest generation: Trial run documents and per-algorithm runtime
//! settings.

use hs_types::{
    config_error, ControllerConfig, EarlyStoppingConfig, Experiment, HsError, HsResult,
    ParameterAssignment, SuggestionConfig,
};
use serde_json::Value;
use std::sync::Arc;

const TRIAL_PARAMETER_PREFIX: &str = "trialParameters.";
const TRIAL_NAME_PLACEHOLDER: &str = "trialSpec.Name";
const TRIAL_NAMESPACE_PLACEHOLDER: &str = "trialSpec.Namespace";

/// Everything the reconcilers need to render manifests.
pub trait ManifestGenerator: Send + Sync {
    /// Expand the Experiment's trial template for one Trial.
    fn run_spec_with_hyper_parameters(
        &self,
        experiment: &Experiment,
        trial_name: &str,
        namespace: &str,
        assignments: &[ParameterAssignment],
    ) -> HsResult<Value>;

    fn suggestion_config(&self, algorithm_name: &str) -> HsResult<SuggestionConfig>;

    fn early_stopping_config(&self, algorithm_name: &str) -> HsResult<EarlyStoppingConfig>;

    fn metrics_collector_image(&self, kind: &str) -> HsResult<String>;
}

/// Generator backed by the controller configuration.
#[derive(Debug, Clone)]
pub struct DefaultManifestGenerator {
    config: Arc<ControllerConfig>,
}

impl DefaultManifestGenerator {
    pub fn new(config: Arc<ControllerConfig>) -> Self {
        Self { config }
    }
}

impl ManifestGenerator for DefaultManifestGenerator {
    fn run_spec_with_hyper_parameters(
        &self,
        experiment: &Experiment,
        trial_name: &str,
        namespace: &str,
        assignments: &[ParameterAssignment],
    ) -> HsResult<Value> {
        let template = &experiment.spec.trial_template;
        let context = Substitution {
            experiment,
            trial_name,
            namespace,
            assignments,
        };
        let mut run_spec = template.trial_spec.clone();
        context.apply(&mut run_spec)?;
        Ok(run_spec)
    }

    fn suggestion_config(&self, algorithm_name: &str) -> HsResult<SuggestionConfig> {
        let config = self
            .config
            .suggestion
            .get(algorithm_name)
            .ok_or_else(|| config_error!("no suggestion runtime configured for algorithm {}", algorithm_name))?;
        if config.image.is_empty() {
            return Err(config_error!("suggestion runtime of {} has no image", algorithm_name));
        }
        Ok(config.clone())
    }

    fn early_stopping_config(&self, algorithm_name: &str) -> HsResult<EarlyStoppingConfig> {
        let config = self.config.early_stopping.get(algorithm_name).ok_or_else(|| {
            config_error!("no early stopping runtime configured for algorithm {}", algorithm_name)
        })?;
        if config.image.is_empty() {
            return Err(config_error!("early stopping runtime of {} has no image", algorithm_name));
        }
        Ok(config.clone())
    }

    fn metrics_collector_image(&self, kind: &str) -> HsResult<String> {
        self.config
            .metrics_collector
            .get(kind)
            .cloned()
            .ok_or_else(|| config_error!("no metrics collector configured for kind {}", kind))
    }
}

struct Substitution<'a> {
    experiment: &'a Experiment,
    trial_name: &'a str,
    namespace: &'a str,
    assignments: &'a [ParameterAssignment],
}

impl Substitution<'_> {
    fn apply(&self, value: &mut Value) -> HsResult<()> {
        match value {
            Value::String(s) => {
                if s.contains("${") {
                    *s = self.expand(s)?;
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.apply(item)?;
                }
            }
            Value::Object(map) => {
                for (_, item) in map.iter_mut() {
                    self.apply(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Replace every `${...}` placeholder in `input`. Placeholders this
    /// generator does not own are left as written.
    fn expand(&self, input: &str) -> HsResult<String> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return Ok(out);
            };
            let placeholder = &after[..end];
            match self.resolve(placeholder)? {
                Some(value) => out.push_str(&value),
                None => {
                    out.push_str("${");
                    out.push_str(placeholder);
                    out.push('}');
                }
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, placeholder: &str) -> HsResult<Option<String>> {
        if placeholder == TRIAL_NAME_PLACEHOLDER {
            return Ok(Some(self.trial_name.to_string()));
        }
        if placeholder == TRIAL_NAMESPACE_PLACEHOLDER {
            return Ok(Some(self.namespace.to_string()));
        }
        let Some(name) = placeholder.strip_prefix(TRIAL_PARAMETER_PREFIX) else {
            return Ok(None);
        };

        let template = &self.experiment.spec.trial_template;
        let parameter = template
            .trial_parameters
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| {
                HsError::Manifest(format!("trial template references unknown parameter {}", name))
            })?;
        let assignment = self
            .assignments
            .iter()
            .find(|a| a.name == parameter.reference)
            .ok_or_else(|| {
                HsError::Manifest(format!(
                    "no assignment for {} (trial parameter {})",
                    parameter.reference, name
                ))
            })?;
        Ok(Some(assignment.value.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::{ExperimentSpec, ObjectMeta, TrialParameterSpec, TrialTemplate};
    use serde_json::json;

    fn experiment(trial_spec: Value) -> Experiment {
        Experiment::new(
            ObjectMeta::new("default", "mnist"),
            ExperimentSpec {
                trial_template: TrialTemplate {
                    trial_spec,
                    trial_parameters: vec![
                        TrialParameterSpec {
                            name: "learningRate".to_string(),
                            description: String::new(),
                            reference: "lr".to_string(),
                        },
                        TrialParameterSpec {
                            name: "optimizer".to_string(),
                            description: String::new(),
                            reference: "optimizer".to_string(),
                        },
                    ],
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn generator() -> DefaultManifestGenerator {
        DefaultManifestGenerator::new(Arc::new(ControllerConfig::default()))
    }

    fn assignments() -> Vec<ParameterAssignment> {
        vec![
            ParameterAssignment::new("lr", "0.05"),
            ParameterAssignment::new("optimizer", "adam"),
        ]
    }

    #[test]
    fn test_template_substitution() {
        let exp = experiment(json!({
            "name": "${trialSpec.Name}",
            "namespace": "${trialSpec.Namespace}",
            "command": [
                "python", "train.py",
                "--lr=${trialParameters.learningRate}",
                "--optimizer=${trialParameters.optimizer}"
            ],
            "env": {"HOME": "${HOME}"},
            "replicas": 1
        }));

        let run_spec = generator()
            .run_spec_with_hyper_parameters(&exp, "mnist-x1", "team-a", &assignments())
            .unwrap();

        assert_eq!(run_spec["name"], "mnist-x1");
        assert_eq!(run_spec["namespace"], "team-a");
        assert_eq!(run_spec["command"][2], "--lr=0.05");
        assert_eq!(run_spec["command"][3], "--optimizer=adam");
        assert_eq!(run_spec["env"]["HOME"], "${HOME}");
        assert_eq!(run_spec["replicas"], 1);
    }

    #[test]
    fn test_unknown_trial_parameter_is_an_error() {
        let exp = experiment(json!({"args": ["--momentum=${trialParameters.momentum}"]}));
        let err = generator()
            .run_spec_with_hyper_parameters(&exp, "t", "default", &assignments())
            .unwrap_err();
        assert!(matches!(err, HsError::Manifest(_)));
    }

    #[test]
    fn test_runtime_lookups() {
        let generator = generator();
        assert!(generator.suggestion_config("random").is_ok());
        assert!(matches!(
            generator.suggestion_config("hyperband"),
            Err(HsError::Config(_))
        ));
        assert!(generator.early_stopping_config("medianstop").is_ok());
        assert!(generator.metrics_collector_image("StdOut").is_ok());
        assert!(generator.metrics_collector_image("Prometheus").is_err());
    }
}
