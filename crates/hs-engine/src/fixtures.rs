//! Shared test scaffolding: a store, both reconcilers and a sandbox wired
//! to in-process algorithm services, stepped by hand.

use hs_store::Store;
use hs_suggestion::{ClientConfig, LocalAlgorithmService, LocalConnector, SuggestionClient};
use hs_types::{
    AlgorithmSpec, ControllerConfig, Experiment, ExperimentSpec, HsResult, ObjectKey, ObjectMeta,
    ObjectiveSpec, ObjectiveType, ParameterAssignment, ParameterSpec, Resource, RuntimeConfig,
    Suggestion, Trial, TrialConditionType, TrialParameterSpec, TrialTemplate,
    LABEL_EXPERIMENT_NAME,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::controller::Reconciler;
use crate::experiment::ExperimentReconciler;
use crate::manifest::DefaultManifestGenerator;
use crate::metrics::ControllerMetrics;
use crate::sandbox::SandboxRuntime;
use crate::suggestion::SuggestionReconciler;

/// Maximize `accuracy` over a learning rate and an optimizer with random
/// search.
pub fn experiment(name: &str, parallel: u32, max_trials: Option<u32>) -> Experiment {
    let parameter = |name: &str, reference: &str| TrialParameterSpec {
        name: name.to_string(),
        description: String::new(),
        reference: reference.to_string(),
    };
    Experiment::new(
        ObjectMeta::new("default", name),
        ExperimentSpec {
            parameters: vec![
                ParameterSpec::double("lr", 0.01, 0.1),
                ParameterSpec::categorical("optimizer", &["sgd", "adam"]),
            ],
            objective: ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy"),
            algorithm: AlgorithmSpec::new("random"),
            trial_template: TrialTemplate {
                trial_spec: json!({
                    "name": "${trialSpec.Name}",
                    "command": [
                        "python", "train.py",
                        "--lr=${trialParameters.learningRate}",
                        "--optimizer=${trialParameters.optimizer}"
                    ]
                }),
                trial_parameters: vec![
                    parameter("learningRate", "lr"),
                    parameter("optimizer", "optimizer"),
                ],
                primary_container_name: "training".to_string(),
                ..Default::default()
            },
            parallel_trial_count: Some(parallel),
            max_trial_count: max_trials,
            metrics_collector_kind: "StdOut".to_string(),
            ..Default::default()
        },
    )
}

pub struct Harness {
    pub store: Arc<Store>,
    pub metrics: Arc<ControllerMetrics>,
    pub sandbox: SandboxRuntime,
    connector: LocalConnector,
    client: SuggestionClient,
    pub experiments: ExperimentReconciler,
    suggestions: SuggestionReconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(SandboxRuntime::new)
    }

    pub fn with_objective<F>(objective: F) -> Self
    where
        F: Fn(&[ParameterAssignment]) -> f64 + Send + Sync + 'static,
    {
        Self::build(move |store| SandboxRuntime::new(store).with_objective(objective))
    }

    fn build(sandbox: impl FnOnce(Arc<Store>) -> SandboxRuntime) -> Self {
        let store = Arc::new(Store::new());
        let metrics = Arc::new(ControllerMetrics::new());
        let config = ControllerConfig::default();
        let runtime = RuntimeConfig {
            rpc_timeout_secs: 5,
            trial_delete_timeout_secs: 5,
            trial_delete_poll_millis: 10,
            ..config.runtime.clone()
        };
        let manifests = Arc::new(DefaultManifestGenerator::new(Arc::new(config)));
        let connector = LocalConnector::new();

        Self {
            sandbox: sandbox(Arc::clone(&store)),
            client: SuggestionClient::new(Arc::new(connector.clone()), ClientConfig::from(&runtime)),
            experiments: ExperimentReconciler::new(
                Arc::clone(&store),
                manifests.clone(),
                Arc::clone(&metrics),
                runtime.clone(),
            ),
            suggestions: SuggestionReconciler::new(
                Arc::clone(&store),
                Arc::new(connector.clone()),
                manifests,
                &runtime,
            ),
            connector,
            store,
            metrics,
        }
    }

    pub fn submit(&self, experiment: Experiment) -> ObjectKey {
        self.store.create(experiment).unwrap().key()
    }

    pub async fn reconcile_experiment(&self, key: &ObjectKey) -> HsResult<()> {
        self.experiments.reconcile(key).await
    }

    pub async fn reconcile_suggestion(&self, key: &ObjectKey) -> HsResult<()> {
        self.suggestions.reconcile(key).await
    }

    /// Drive a fresh Experiment until its first Trials exist: finalizer,
    /// Created condition, Suggestion, runtime, validation, assignments and
    /// finally the Trials themselves.
    pub async fn bring_up(&self, key: &ObjectKey) {
        for _ in 0..3 {
            self.reconcile_experiment(key).await.unwrap();
        }
        self.reconcile_suggestion(key).await.unwrap();
        self.reconcile_suggestion(key).await.unwrap();
        self.sandbox.step().unwrap();
        self.reconcile_suggestion(key).await.unwrap();
        self.reconcile_experiment(key).await.unwrap();
    }

    pub fn trials(&self, key: &ObjectKey) -> Vec<Trial> {
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_EXPERIMENT_NAME.to_string(), key.name.clone());
        self.store.list::<Trial>(&key.namespace, &selector)
    }

    /// Run every live Trial to success.
    pub fn finish_trials(&self) {
        for _ in 0..3 {
            self.sandbox.step().unwrap();
        }
    }

    pub fn fail_trials(&self) {
        for trial in self.store.list::<Trial>("default", &BTreeMap::new()) {
            let mut failed = trial;
            failed.set_condition(TrialConditionType::Failed, "TrialFailed", "Training crashed");
            self.store.update_status(&failed).unwrap();
        }
    }

    /// The in-process algorithm service behind `suggestion`.
    pub fn algorithm_service(&self, suggestion: &Suggestion) -> Arc<LocalAlgorithmService> {
        self.connector
            .service(&self.client.suggestion_endpoint(suggestion))
            .unwrap()
    }
}
