//! Suggestion reconciler: keeps the algorithm runtime of a Suggestion alive,
//! validates its settings and fills its assignment backlog.

use async_trait::async_trait;
use chrono::Utc;
use hs_store::{Store, Stored};
use hs_suggestion::{AlgorithmConnector, ClientConfig, SuggestionClient};
use hs_types::{
    AlgorithmError, ConditionStatus, Deployment, Experiment, HsError, HsResult, ObjectKey,
    Resource, ResumePolicy, RuntimeConfig, Service, StoreError, Suggestion, Trial,
    LABEL_EXPERIMENT_NAME, SUGGESTION_CREATED_REASON, SUGGESTION_DEPLOYMENT_NOT_READY_REASON,
    SUGGESTION_DEPLOYMENT_READY_REASON, SUGGESTION_FAILED_REASON, SUGGESTION_RUNNING_REASON,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::composer::{
    desired_deployment, desired_rbac, desired_service, desired_volume, desired_volume_claim,
    RuntimePorts,
};
use crate::controller::{Reconciler, RECONCILE_FAILED_REASON};
use crate::manifest::ManifestGenerator;

pub struct SuggestionReconciler {
    store: Arc<Store>,
    client: SuggestionClient,
    manifests: Arc<dyn ManifestGenerator>,
    ports: RuntimePorts,
}

impl SuggestionReconciler {
    pub fn new(
        store: Arc<Store>,
        connector: Arc<dyn AlgorithmConnector>,
        manifests: Arc<dyn ManifestGenerator>,
        runtime: &RuntimeConfig,
    ) -> Self {
        Self {
            store,
            client: SuggestionClient::new(connector, ClientConfig::from(runtime)),
            manifests,
            ports: RuntimePorts {
                suggestion: runtime.suggestion_port,
                early_stopping: runtime.early_stopping_port,
            },
        }
    }

    async fn reconcile_suggestion(&self, instance: &mut Suggestion) -> HsResult<()> {
        let experiment = self.store.get::<Experiment>(&experiment_key(instance))?;
        self.reconcile_runtime(instance)?;

        let deployment = ObjectKey::new(instance.meta.namespace.clone(), instance.runtime_name());
        let available = self
            .store
            .try_get::<Deployment>(&deployment)
            .map_or(false, |d| d.is_available());
        if !available {
            instance.mark_deployment_ready(
                ConditionStatus::False,
                SUGGESTION_DEPLOYMENT_NOT_READY_REASON,
                "Deployment is not ready",
            );
            debug!(suggestion = %instance.key(), "waiting for deployment");
            return Ok(());
        }
        instance.mark_deployment_ready(
            ConditionStatus::True,
            SUGGESTION_DEPLOYMENT_READY_REASON,
            "Deployment is ready",
        );

        if !instance.is_running() {
            match self.validate(instance, &experiment).await {
                Ok(()) => {
                    instance.mark_running(
                        ConditionStatus::True,
                        SUGGESTION_RUNNING_REASON,
                        "Suggestion is running",
                    );
                    info!(suggestion = %instance.key(), "algorithm settings validated");
                }
                Err(HsError::Algorithm(AlgorithmError::Validation { method, message })) => {
                    let message = format!("{} failed: {}", method, message);
                    instance.mark_failed(SUGGESTION_FAILED_REASON, &message);
                    self.store
                        .events()
                        .warning(&*instance, SUGGESTION_FAILED_REASON, &message);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let mut selector = BTreeMap::new();
        selector.insert(LABEL_EXPERIMENT_NAME.to_string(), experiment.meta.name.clone());
        let trials = self
            .store
            .list::<Trial>(&instance.meta.namespace, &selector);
        self.client
            .sync_assignments(instance, &experiment, &trials)
            .await
    }

    async fn validate(&self, instance: &Suggestion, experiment: &Experiment) -> HsResult<()> {
        self.client
            .validate_algorithm_settings(instance, experiment)
            .await?;
        if instance.spec.early_stopping_algorithm().is_some() {
            self.client
                .validate_early_stopping_settings(instance, experiment)
                .await?;
        }
        Ok(())
    }

    /// Create whatever part of the runtime is missing: Service, volume
    /// claim and volume, Deployment, then early stopping RBAC.
    fn reconcile_runtime(&self, instance: &Suggestion) -> HsResult<()> {
        let config = self
            .manifests
            .suggestion_config(&instance.spec.algorithm.algorithm_name)?;
        let early_stopping = instance
            .spec
            .early_stopping_algorithm()
            .map(|name| self.manifests.early_stopping_config(name))
            .transpose()?;

        ensure(&self.store, desired_service(instance, self.ports))?;
        if instance.spec.resume_policy == ResumePolicy::FromVolume {
            ensure(&self.store, desired_volume_claim(instance, &config))?;
            if let Some(volume) = desired_volume(instance, &config) {
                ensure(&self.store, volume)?;
            }
        }

        let deployment = desired_deployment(instance, &config, early_stopping.as_ref(), self.ports);
        let rbac_name = instance.rbac_name();
        let needs_rbac = early_stopping.is_some()
            && deployment.spec.template.service_account_name.as_deref() == Some(rbac_name.as_str());
        ensure(&self.store, deployment)?;

        if needs_rbac {
            let (account, role, binding) = desired_rbac(instance);
            ensure(&self.store, account)?;
            ensure(&self.store, role)?;
            ensure(&self.store, binding)?;
        }
        Ok(())
    }

    /// Drop the Deployment and Service of a finished Suggestion. Volumes are
    /// kept for a later resume.
    fn teardown(&self, instance: &Suggestion) -> HsResult<()> {
        let key = ObjectKey::new(instance.meta.namespace.clone(), instance.runtime_name());
        let deployment = delete_if_present::<Deployment>(&self.store, &key)?;
        let service = delete_if_present::<Service>(&self.store, &key)?;
        if deployment || service {
            info!(suggestion = %instance.key(), "suggestion runtime removed");
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for SuggestionReconciler {
    fn kind(&self) -> &'static str {
        Suggestion::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> HsResult<()> {
        let Some(original) = self.store.try_get::<Suggestion>(key) else {
            debug!(suggestion = %key, "suggestion is gone");
            return Ok(());
        };
        if original.meta.is_deleting() {
            return Ok(());
        }
        if original.is_succeeded() {
            return self.teardown(&original);
        }
        if original.is_failed() {
            debug!(suggestion = %key, "suggestion failed, nothing to do");
            return Ok(());
        }
        if !original.is_created() {
            let mut instance = original.clone();
            if instance.status.start_time.is_none() {
                instance.status.start_time = Some(Utc::now());
            }
            instance.mark_created(SUGGESTION_CREATED_REASON, "Suggestion is created");
            self.store.update_status(&instance)?;
            info!(suggestion = %key, "suggestion created");
            return Ok(());
        }

        let mut instance = original.clone();
        match self.reconcile_suggestion(&mut instance).await {
            Ok(()) => {
                if instance.status != original.status {
                    self.store.update_status(&instance)?;
                }
                Ok(())
            }
            Err(e) => {
                // Keep condition changes made before the failure.
                let mut partial = original.clone();
                partial.status.conditions = instance.status.conditions.clone();
                if partial.status != original.status {
                    if let Err(write) = self.store.update_status(&partial) {
                        warn!(suggestion = %key, error = %write, "failed to record conditions");
                    }
                }
                error!(suggestion = %key, error = %e, "reconcile failed");
                self.store
                    .events()
                    .warning(&original, RECONCILE_FAILED_REASON, &e.to_string());
                Err(e)
            }
        }
    }
}

/// The Experiment owning `suggestion`; both share a name.
fn experiment_key(suggestion: &Suggestion) -> ObjectKey {
    let name = suggestion
        .meta
        .owner
        .as_ref()
        .filter(|o| o.kind == Experiment::KIND)
        .map(|o| o.name.clone())
        .unwrap_or_else(|| suggestion.meta.name.clone());
    ObjectKey::new(suggestion.meta.namespace.clone(), name)
}

/// Create `desired` unless a record already sits at its key.
pub(crate) fn ensure<R: Stored>(store: &Store, desired: R) -> HsResult<()> {
    let key = desired.key();
    if store.exists::<R>(&key) {
        return Ok(());
    }
    match store.create(desired) {
        Ok(_) => {
            info!(kind = R::KIND, key = %key, "created runtime resource");
            Ok(())
        }
        Err(HsError::Store(StoreError::AlreadyExists { .. })) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Delete the record at `key`, reporting whether there was one.
pub(crate) fn delete_if_present<R: Stored>(store: &Store, key: &ObjectKey) -> HsResult<bool> {
    match store.delete::<R>(key) {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{experiment, Harness};
    use hs_types::{
        EarlyStoppingSpec, PersistentVolume, PersistentVolumeClaim, Role, RoleBinding,
        ServiceAccount, SuggestionConditionType,
    };

    async fn submitted(h: &Harness, exp: Experiment) -> ObjectKey {
        let key = h.submit(exp);
        for _ in 0..3 {
            h.reconcile_experiment(&key).await.unwrap();
        }
        assert!(h.store.exists::<Suggestion>(&key));
        key
    }

    #[tokio::test]
    async fn test_runtime_comes_up_before_assignments() {
        let h = Harness::new();
        let key = submitted(&h, experiment("mnist", 3, Some(10))).await;

        h.reconcile_suggestion(&key).await.unwrap();
        let suggestion = h.store.get::<Suggestion>(&key).unwrap();
        assert!(suggestion.is_created());
        assert!(suggestion.status.start_time.is_some());

        h.reconcile_suggestion(&key).await.unwrap();
        let suggestion = h.store.get::<Suggestion>(&key).unwrap();
        let runtime = ObjectKey::new("default", suggestion.runtime_name());
        assert!(h.store.exists::<Deployment>(&runtime));
        assert!(h.store.exists::<Service>(&runtime));
        assert!(!h.store.exists::<PersistentVolumeClaim>(&runtime));
        assert!(!suggestion.is_deployment_ready());
        assert_eq!(
            suggestion
                .status
                .conditions
                .get(SuggestionConditionType::DeploymentReady)
                .unwrap()
                .reason,
            SUGGESTION_DEPLOYMENT_NOT_READY_REASON
        );
        assert_eq!(suggestion.status.suggestion_count, 0);

        h.sandbox.step().unwrap();
        h.reconcile_suggestion(&key).await.unwrap();
        let suggestion = h.store.get::<Suggestion>(&key).unwrap();
        assert!(suggestion.is_deployment_ready());
        assert!(suggestion.is_running());
        assert_eq!(suggestion.status.suggestion_count, 3);
        assert_eq!(suggestion.status.suggestions.len(), 3);
    }

    #[tokio::test]
    async fn test_sync_is_idempotent_once_filled() {
        let h = Harness::new();
        let key = h.submit(experiment("mnist", 2, Some(10)));
        h.bring_up(&key).await;
        let suggestion = h.store.get::<Suggestion>(&key).unwrap();

        h.reconcile_suggestion(&key).await.unwrap();
        assert_eq!(h.store.get::<Suggestion>(&key).unwrap(), suggestion);
        assert_eq!(h.algorithm_service(&suggestion).calls().len(), 1);
    }

    #[tokio::test]
    async fn test_volume_and_rbac_resources() {
        let h = Harness::new();
        let mut exp = experiment("mnist", 2, Some(10));
        exp.spec.resume_policy = ResumePolicy::FromVolume;
        exp.spec.early_stopping = Some(EarlyStoppingSpec {
            algorithm_name: "medianstop".to_string(),
            algorithm_settings: Vec::new(),
        });
        let key = submitted(&h, exp).await;
        h.reconcile_suggestion(&key).await.unwrap();
        h.reconcile_suggestion(&key).await.unwrap();

        let suggestion = h.store.get::<Suggestion>(&key).unwrap();
        let runtime = ObjectKey::new("default", suggestion.runtime_name());
        assert!(h.store.exists::<PersistentVolumeClaim>(&runtime));
        assert!(h
            .store
            .exists::<PersistentVolume>(&ObjectKey::new("", suggestion.persistent_volume_name())));
        let rbac = ObjectKey::new("default", suggestion.rbac_name());
        assert!(h.store.exists::<ServiceAccount>(&rbac));
        assert!(h.store.exists::<Role>(&rbac));
        assert!(h.store.exists::<RoleBinding>(&rbac));

        let deployment = h.store.get::<Deployment>(&runtime).unwrap();
        assert_eq!(deployment.spec.template.containers.len(), 2);

        // Early stopping rules ride along with every assignment.
        h.sandbox.step().unwrap();
        h.reconcile_suggestion(&key).await.unwrap();
        let suggestion = h.store.get::<Suggestion>(&key).unwrap();
        assert!(suggestion.is_running());
        assert_eq!(suggestion.status.suggestion_count, 2);
    }

    #[tokio::test]
    async fn test_unknown_algorithm_is_a_config_error() {
        let h = Harness::new();
        let mut exp = experiment("mnist", 2, Some(10));
        exp.spec.algorithm = hs_types::AlgorithmSpec::new("hyperband");
        let key = submitted(&h, exp).await;
        h.reconcile_suggestion(&key).await.unwrap();

        let err = h.reconcile_suggestion(&key).await.unwrap_err();
        assert!(matches!(err, HsError::Config(_)));
        assert!(!err.is_retryable());
        let events = h.store.events().for_object(Suggestion::KIND, &key);
        assert!(events.iter().any(|e| e.reason == RECONCILE_FAILED_REASON));
    }

    #[tokio::test]
    async fn test_succeeded_suggestion_keeps_its_volume() {
        let h = Harness::new();
        let mut exp = experiment("mnist", 2, Some(10));
        exp.spec.resume_policy = ResumePolicy::FromVolume;
        let key = h.submit(exp);
        h.bring_up(&key).await;

        let mut suggestion = h.store.get::<Suggestion>(&key).unwrap();
        suggestion.mark_succeeded("SuggestionSucceeded", "done");
        h.store.update_status(&suggestion).unwrap();
        h.reconcile_suggestion(&key).await.unwrap();

        let runtime = ObjectKey::new("default", suggestion.runtime_name());
        assert!(!h.store.exists::<Deployment>(&runtime));
        assert!(!h.store.exists::<Service>(&runtime));
        assert!(h.store.exists::<PersistentVolumeClaim>(&runtime));
    }

    #[test]
    fn test_delete_if_present_tolerates_missing() {
        let store = Store::new();
        let key = ObjectKey::new("default", "missing");
        assert!(!delete_if_present::<Deployment>(&store, &key).unwrap());
    }
}
