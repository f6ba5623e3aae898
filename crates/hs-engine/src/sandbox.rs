//! Stand-in for the workload runtime when no cluster is attached: brings
//! suggestion deployments up and walks Trials through their lifecycle,
//! scoring each with an objective function.

use chrono::Utc;
use hs_store::Store;
use hs_types::{
    ConditionStatus, Deployment, DeploymentConditionType, HsResult, Metric, ObjectKey,
    Observation, ParameterAssignment, Trial, TrialConditionType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Scores a Trial from its parameter assignments.
pub type ObjectiveFn = Arc<dyn Fn(&[ParameterAssignment]) -> f64 + Send + Sync>;

pub struct SandboxRuntime {
    store: Arc<Store>,
    objective: ObjectiveFn,
}

impl SandboxRuntime {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            objective: Arc::new(bowl),
        }
    }

    pub fn with_objective<F>(mut self, objective: F) -> Self
    where
        F: Fn(&[ParameterAssignment]) -> f64 + Send + Sync + 'static,
    {
        self.objective = Arc::new(objective);
        self
    }

    /// Advance every Deployment and Trial by one step and return how many
    /// records changed. A Trial goes from nothing to Created, Running and
    /// finally Succeeded with its objective metric observed.
    pub fn step(&self) -> HsResult<usize> {
        let mut changed = 0;

        for key in self.store.keys::<Deployment>() {
            let Some(mut deployment) = self.store.try_get::<Deployment>(&key) else {
                continue;
            };
            if deployment.is_available() || deployment.meta.is_deleting() {
                continue;
            }
            deployment.status.conditions.set(
                DeploymentConditionType::Available,
                ConditionStatus::True,
                "MinimumReplicasAvailable",
                "Deployment has minimum availability",
            );
            if self.write(&key, self.store.update_status(&deployment).map(|_| ()))? {
                changed += 1;
            }
        }

        for key in self.store.keys::<Trial>() {
            let Some(mut trial) = self.store.try_get::<Trial>(&key) else {
                continue;
            };
            if trial.is_completed() || trial.meta.is_deleting() {
                continue;
            }
            self.advance(&mut trial);
            if self.write(&key, self.store.update_status(&trial).map(|_| ()))? {
                changed += 1;
            }
        }

        Ok(changed)
    }

    fn advance(&self, trial: &mut Trial) {
        if !trial.is_created() {
            trial.set_condition(TrialConditionType::Created, "TrialCreated", "Trial is created");
        } else if !trial.is_running() {
            trial.status.start_time = Some(Utc::now());
            trial.set_condition(TrialConditionType::Running, "TrialRunning", "Trial is running");
        } else {
            let value = (self.objective)(&trial.spec.parameter_assignments);
            let metric = &trial.spec.objective.objective_metric_name;
            trial.status.observation = Some(Observation {
                metrics: vec![Metric::single(metric, &value.to_string())],
            });
            trial.status.conditions.set(
                TrialConditionType::Running,
                ConditionStatus::False,
                "TrialSucceeded",
                "Trial has finished",
            );
            trial.set_condition(TrialConditionType::Succeeded, "TrialSucceeded", "Trial has succeeded");
            trial.status.completion_time = Some(Utc::now());
        }
    }

    /// Records that vanish or move under us are picked up on the next step.
    fn write(&self, key: &ObjectKey, result: HsResult<()>) -> HsResult<bool> {
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() || e.is_conflict() => {
                debug!(key = %key, error = %e, "sandbox skipped record");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Step every `interval` until `shutdown` flips to `true`.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "sandbox runtime started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.step() {
                        warn!(error = %e, "sandbox step failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("sandbox runtime stopped");
    }
}

/// Peaks at 1.0 where every numeric assignment is zero.
fn bowl(assignments: &[ParameterAssignment]) -> f64 {
    let distance: f64 = assignments
        .iter()
        .filter_map(|a| a.value.parse::<f64>().ok())
        .map(|v| v * v)
        .sum();
    1.0 / (1.0 + distance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hs_types::{ObjectMeta, ObjectiveSpec, ObjectiveType, TrialSpec};

    fn trial(store: &Store, name: &str) -> ObjectKey {
        let spec = TrialSpec {
            objective: ObjectiveSpec::new(ObjectiveType::Maximize, "accuracy"),
            parameter_assignments: vec![ParameterAssignment::new("lr", "0.5")],
            ..Default::default()
        };
        store
            .create(Trial::new(ObjectMeta::new("default", name), spec))
            .unwrap()
            .meta
            .key()
    }

    #[test]
    fn test_trial_lifecycle() {
        let store = Arc::new(Store::new());
        let key = trial(&store, "t1");
        let sandbox = SandboxRuntime::new(store.clone());

        assert_eq!(sandbox.step().unwrap(), 1);
        assert!(store.get::<Trial>(&key).unwrap().is_created());

        sandbox.step().unwrap();
        let running = store.get::<Trial>(&key).unwrap();
        assert!(running.is_running());
        assert!(running.status.start_time.is_some());

        sandbox.step().unwrap();
        let done = store.get::<Trial>(&key).unwrap();
        assert!(done.is_succeeded());
        assert!(!done.is_running());
        assert_eq!(done.status.observation.unwrap().metrics[0].latest, "0.8");

        // Completed Trials are left alone.
        assert_eq!(sandbox.step().unwrap(), 0);
    }

    #[test]
    fn test_custom_objective() {
        let store = Arc::new(Store::new());
        let key = trial(&store, "t1");
        let sandbox = SandboxRuntime::new(store.clone()).with_objective(|_| 0.25);
        for _ in 0..3 {
            sandbox.step().unwrap();
        }
        let done = store.get::<Trial>(&key).unwrap();
        assert_eq!(done.status.observation.unwrap().metrics[0].latest, "0.25");
    }
}
