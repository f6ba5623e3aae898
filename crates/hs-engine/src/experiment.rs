//! Experiment reconciler: drives an Experiment from creation to completion by
//! keeping the right number of Trials alive and evaluating their results.

use async_trait::async_trait;
use chrono::Utc;
use hs_objective::{apply_summary, summarize, TrialsSummary};
use hs_store::{Store, Stored};
use hs_types::{
    internal_error, ConditionStatus, Deployment, Experiment, HsError, HsResult, ObjectKey,
    ObjectMeta, PersistentVolume, PersistentVolumeClaim, Resource, ResumePolicy, Role, RoleBinding,
    RuntimeConfig, Service, ServiceAccount, Suggestion, SuggestionConditionType, SuggestionSpec,
    Trial, TrialAssignment, TrialSpec, EXPERIMENT_CREATED_REASON, EXPERIMENT_FAILED_REASON,
    EXPERIMENT_GOAL_REACHED_REASON, EXPERIMENT_MAX_FAILED_TRIALS_REACHED_REASON,
    EXPERIMENT_MAX_TRIALS_REACHED_REASON, EXPERIMENT_RESTARTING_REASON, EXPERIMENT_RUNNING_REASON,
    EXPERIMENT_SUGGESTION_END_REACHED_REASON, LABEL_EXPERIMENT_NAME, LABEL_SUGGESTION_NAME,
    SUGGESTION_RESTARTING_REASON, SUGGESTION_SUCCEEDED_REASON,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::admission::{newest_trials, plan, requested_assignments, Admission};
use crate::controller::{Reconciler, RECONCILE_FAILED_REASON};
use crate::manifest::ManifestGenerator;
use crate::metrics::ControllerMetrics;
use crate::suggestion::delete_if_present;

/// Finalizer holding an Experiment back until its dependents are gone.
pub const CASCADE_DELETE_FINALIZER: &str = "hypersearch.io/cascade-delete";

const TRIAL_CREATE_FAILED_REASON: &str = "TrialCreateFailed";

pub struct ExperimentReconciler {
    store: Arc<Store>,
    manifests: Arc<dyn ManifestGenerator>,
    metrics: Arc<ControllerMetrics>,
    runtime: RuntimeConfig,
}

impl ExperimentReconciler {
    pub fn new(
        store: Arc<Store>,
        manifests: Arc<dyn ManifestGenerator>,
        metrics: Arc<ControllerMetrics>,
        runtime: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            manifests,
            metrics,
            runtime,
        }
    }

    async fn reconcile_experiment(&self, original: &Experiment) -> HsResult<()> {
        let key = original.key();
        if original.meta.is_deleting() {
            return self.cascade_delete(original);
        }
        if !original.meta.has_finalizer(CASCADE_DELETE_FINALIZER) {
            let mut instance = original.clone();
            instance.meta.finalizers.push(CASCADE_DELETE_FINALIZER.to_string());
            self.store.update(instance)?;
            debug!(experiment = %key, "added finalizer");
            return Ok(());
        }

        let mut instance = original.clone();
        if instance.is_completed() {
            if matches!(
                instance.spec.resume_policy,
                ResumePolicy::Never | ResumePolicy::FromVolume
            ) {
                self.finish_suggestion(&instance)?;
            }
            if is_restartable(&instance) {
                self.restart(&mut instance)?;
            } else if !instance.has_active_trials() {
                return self.persist_status(original, &instance);
            }
        }

        if !instance.is_created() {
            let message = "Experiment is created";
            if instance.status.start_time.is_none() {
                instance.status.start_time = Some(Utc::now());
            }
            instance.mark_created(EXPERIMENT_CREATED_REASON, message);
            self.store.update_status(&instance)?;
            self.metrics.experiment_created();
            self.store
                .events()
                .normal(&instance, EXPERIMENT_CREATED_REASON, message);
            info!(experiment = %key, "experiment created");
            return Ok(());
        }

        let trials = self.owned_trials(&instance);
        let summary = summarize(&instance, &trials);
        apply_summary(&mut instance.status, &summary);

        if !instance.is_completed() {
            let suggestion = self.store.try_get::<Suggestion>(&key);
            self.apply_completion(&mut instance, &summary, suggestion.as_ref());
        }
        if !instance.is_completed() {
            self.reconcile_trials(&mut instance, &trials, &summary).await?;
        }
        self.persist_status(original, &instance)
    }

    /// Transition counters move only once the new status is stored.
    fn persist_status(&self, original: &Experiment, instance: &Experiment) -> HsResult<()> {
        if instance.status == original.status {
            return Ok(());
        }
        self.store.update_status(instance)?;

        if instance.is_succeeded() && !original.is_succeeded() {
            self.metrics.experiment_succeeded();
        }
        if instance.is_failed() && !original.is_failed() {
            self.metrics.experiment_failed();
        }
        if original.is_completed() && !instance.is_completed() {
            self.metrics.experiment_restarted();
        }
        Ok(())
    }

    fn owned_trials(&self, experiment: &Experiment) -> Vec<Trial> {
        self.store
            .list::<Trial>(&experiment.meta.namespace, &experiment_selector(experiment))
    }

    /// First matching rule wins: goal, failure budget, trial budget, then an
    /// exhausted algorithm with nothing left running.
    fn apply_completion(
        &self,
        instance: &mut Experiment,
        summary: &TrialsSummary,
        suggestion: Option<&Suggestion>,
    ) {
        let failed = summary.failed.len() as u32;
        let completed = summary.completed_count();
        let too_many_failures = instance
            .spec
            .max_failed_trial_count
            .map_or(false, |max| max > 0 && failed >= max);
        let budget_spent = instance
            .spec
            .max_trial_count
            .map_or(false, |max| completed >= max);
        let exhausted = suggestion.map_or(false, |s| s.is_exhausted()) && summary.active_count() == 0;

        if summary.goal_reached {
            self.succeed(instance, EXPERIMENT_GOAL_REACHED_REASON, "Experiment has reached the objective goal");
        } else if too_many_failures {
            let message = format!("Experiment has {} failed trials", failed);
            self.fail(instance, EXPERIMENT_MAX_FAILED_TRIALS_REACHED_REASON, &message);
        } else if budget_spent {
            let message = format!("Experiment has completed {} trials", completed);
            self.succeed(instance, EXPERIMENT_MAX_TRIALS_REACHED_REASON, &message);
        } else if exhausted {
            self.succeed(
                instance,
                EXPERIMENT_SUGGESTION_END_REACHED_REASON,
                "Algorithm service has no more assignments",
            );
        } else {
            instance.mark_running(EXPERIMENT_RUNNING_REASON, "Experiment is running");
        }
    }

    fn succeed(&self, instance: &mut Experiment, reason: &str, message: &str) {
        instance.mark_succeeded(reason, message);
        self.store.events().normal(&*instance, reason, message);
        info!(experiment = %instance.key(), reason, "experiment succeeded");
    }

    fn fail(&self, instance: &mut Experiment, reason: &str, message: &str) {
        instance.mark_failed(reason, message);
        self.store.events().warning(&*instance, reason, message);
        warn!(experiment = %instance.key(), reason, message, "experiment failed");
    }

    /// Mark the Suggestion of a completed Experiment succeeded so its runtime
    /// is torn down.
    fn finish_suggestion(&self, instance: &Experiment) -> HsResult<()> {
        let Some(mut suggestion) = self.store.try_get::<Suggestion>(&instance.key()) else {
            return Ok(());
        };
        if suggestion.is_succeeded() || suggestion.is_failed() {
            return Ok(());
        }
        let message = match instance.spec.resume_policy {
            ResumePolicy::FromVolume => "Experiment is completed, suggestion volume is retained",
            _ => "Experiment is completed",
        };
        suggestion.mark_succeeded(SUGGESTION_SUCCEEDED_REASON, message);
        self.store.update_status(&suggestion)?;
        info!(suggestion = %suggestion.key(), "suggestion succeeded");
        Ok(())
    }

    fn restart(&self, instance: &mut Experiment) -> HsResult<()> {
        let message = "Experiment is restarting";
        instance.mark_restarting(EXPERIMENT_RESTARTING_REASON, message);
        self.store
            .events()
            .normal(&*instance, EXPERIMENT_RESTARTING_REASON, message);
        info!(
            experiment = %instance.key(),
            max_trial_count = ?instance.spec.max_trial_count,
            trials = instance.status.trials,
            "restarting experiment"
        );

        if instance.spec.resume_policy == ResumePolicy::FromVolume {
            if let Some(mut suggestion) = self.store.try_get::<Suggestion>(&instance.key()) {
                suggestion.mark_running(
                    ConditionStatus::False,
                    SUGGESTION_RESTARTING_REASON,
                    "Suggestion is restarting from its volume",
                );
                self.store.update_status(&suggestion)?;
            }
        }
        Ok(())
    }

    async fn reconcile_trials(
        &self,
        instance: &mut Experiment,
        trials: &[Trial],
        summary: &TrialsSummary,
    ) -> HsResult<()> {
        let parallel = instance
            .spec
            .parallel_trial_count
            .unwrap_or(self.runtime.default_parallel_trial_count);
        let admission = plan(
            summary.active_count(),
            summary.completed_count(),
            parallel,
            instance.spec.max_trial_count,
        );
        debug!(experiment = %instance.key(), ?admission, "admission");

        match admission {
            Admission::Delete(count) => self.delete_trials(instance, trials, count as usize).await,
            Admission::Add(count) => self.add_trials(instance, trials, count),
            Admission::Hold => Ok(()),
        }
    }

    async fn delete_trials(&self, instance: &Experiment, trials: &[Trial], count: usize) -> HsResult<()> {
        let victims: Vec<ObjectKey> = newest_trials(trials, count).iter().map(|t| t.key()).collect();
        for key in &victims {
            delete_if_present::<Trial>(&self.store, key)?;
        }
        self.wait_for_deletion(&victims).await?;
        self.metrics.trials_deleted(victims.len() as u64);
        info!(experiment = %instance.key(), deleted = victims.len(), "deleted surplus trials");

        let Some(suggestion) = self.store.try_get::<Suggestion>(&instance.key()) else {
            return Ok(());
        };
        let deleted: HashSet<&str> = victims.iter().map(|k| k.name.as_str()).collect();
        let remaining: Vec<TrialAssignment> = suggestion
            .status
            .suggestions
            .iter()
            .filter(|a| !deleted.contains(a.name.as_str()))
            .cloned()
            .collect();

        let mut shrunk = suggestion;
        shrunk.spec.requests = remaining.len() as u32;
        let mut shrunk = self.store.update(shrunk)?;
        shrunk.status.suggestion_count = remaining.len() as u32;
        shrunk.status.suggestions = remaining;
        self.store.update_status(&shrunk)?;
        debug!(suggestion = %shrunk.key(), requests = shrunk.spec.requests, "shrunk suggestion");
        Ok(())
    }

    async fn wait_for_deletion(&self, victims: &[ObjectKey]) -> HsResult<()> {
        let deadline = self.runtime.trial_delete_timeout();
        let poll = self.runtime.trial_delete_poll_interval();
        let gone = async {
            while victims.iter().any(|key| self.store.exists::<Trial>(key)) {
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(deadline, gone)
            .await
            .map_err(|_| HsError::Timeout {
                operation: format!("deletion of {} trials", victims.len()),
                seconds: deadline.as_secs(),
            })
    }

    fn add_trials(&self, instance: &mut Experiment, trials: &[Trial], count: u32) -> HsResult<()> {
        let assignments = self.reconcile_suggestions(instance, trials, count)?;
        for assignment in assignments {
            match self.create_trial(instance, &assignment) {
                Ok(trial) => {
                    self.metrics.trial_created();
                    info!(experiment = %instance.key(), trial = %trial.meta.name, "created trial");
                }
                Err(e) => {
                    let message = format!("failed to create trial {}: {}", assignment.name, e);
                    warn!(experiment = %instance.key(), trial = %assignment.name, error = %e, "trial creation failed");
                    self.store
                        .events()
                        .warning(&*instance, TRIAL_CREATE_FAILED_REASON, &message);
                }
            }
        }
        Ok(())
    }

    /// Make sure the Suggestion asks for enough assignments to cover the
    /// Trials about to be created, and return the ones not yet materialized.
    fn reconcile_suggestions(
        &self,
        instance: &mut Experiment,
        trials: &[Trial],
        add_count: u32,
    ) -> HsResult<Vec<TrialAssignment>> {
        let key = instance.key();
        let requested = requested_assignments(trials, add_count);

        let suggestion = match self.store.try_get::<Suggestion>(&key) {
            Some(suggestion) => suggestion,
            None => {
                let created = self.store.create(self.new_suggestion(instance, requested)?)?;
                info!(experiment = %key, requests = requested, "created suggestion");
                created
            }
        };

        if suggestion.is_failed() {
            let reason = suggestion
                .status
                .conditions
                .get(SuggestionConditionType::Failed)
                .map(|c| c.message.clone())
                .unwrap_or_default();
            let message = format!("Suggestion has failed: {}", reason);
            self.fail(instance, EXPERIMENT_FAILED_REASON, &message);
            return Ok(Vec::new());
        }

        let existing: HashSet<&str> = trials.iter().map(|t| t.meta.name.as_str()).collect();
        let pending: Vec<TrialAssignment> = suggestion
            .status
            .suggestions
            .iter()
            .filter(|a| !existing.contains(a.name.as_str()))
            .cloned()
            .collect();

        if suggestion.spec.requests != requested {
            debug!(
                suggestion = %key,
                from = suggestion.spec.requests,
                to = requested,
                "updating requests"
            );
            let mut updated = suggestion;
            updated.spec.requests = requested;
            self.store.update(updated)?;
        }
        Ok(pending)
    }

    fn new_suggestion(&self, instance: &Experiment, requests: u32) -> HsResult<Suggestion> {
        let owner = instance
            .owner_reference()
            .ok_or_else(|| internal_error!("experiment {} has no uid", instance.key()))?;
        let mut meta = ObjectMeta::new(instance.meta.namespace.clone(), instance.meta.name.clone())
            .with_owner(owner);
        meta.labels = instance.meta.labels.clone();
        meta.labels
            .insert(LABEL_EXPERIMENT_NAME.to_string(), instance.meta.name.clone());

        Ok(Suggestion::new(
            meta,
            SuggestionSpec {
                algorithm: instance.spec.algorithm.clone(),
                early_stopping: instance.spec.early_stopping.clone(),
                requests,
                resume_policy: instance.spec.resume_policy,
            },
        ))
    }

    fn create_trial(&self, instance: &Experiment, assignment: &TrialAssignment) -> HsResult<Trial> {
        let namespace = &instance.meta.namespace;
        let run_spec = self.manifests.run_spec_with_hyper_parameters(
            instance,
            &assignment.name,
            namespace,
            &assignment.parameter_assignments,
        )?;
        let metrics_collector_image = match instance.spec.metrics_collector_kind.as_str() {
            "" => None,
            kind => Some(self.manifests.metrics_collector_image(kind)?),
        };

        let mut meta = ObjectMeta::new(namespace.clone(), assignment.name.clone());
        meta.labels = instance.meta.labels.clone();
        meta.labels
            .insert(LABEL_EXPERIMENT_NAME.to_string(), instance.meta.name.clone());
        meta.labels.extend(assignment.labels.clone());
        meta.owner = instance.owner_reference();

        let template = &instance.spec.trial_template;
        let trial = Trial::new(
            meta,
            TrialSpec {
                objective: instance.spec.objective.clone(),
                parameter_assignments: assignment.parameter_assignments.clone(),
                run_spec,
                early_stopping_rules: assignment.early_stopping_rules.clone(),
                primary_container_name: template.primary_container_name.clone(),
                success_condition: template.success_condition.clone(),
                failure_condition: template.failure_condition.clone(),
                metrics_collector_image,
            },
        );
        self.store.create(trial)
    }

    /// Remove the Suggestion, its runtime and every Trial, then release the
    /// Experiment.
    fn cascade_delete(&self, instance: &Experiment) -> HsResult<()> {
        let key = instance.key();
        if !instance.meta.has_finalizer(CASCADE_DELETE_FINALIZER) {
            return Ok(());
        }

        delete_if_present::<Suggestion>(&self.store, &key)?;
        let mut selector = BTreeMap::new();
        selector.insert(LABEL_SUGGESTION_NAME.to_string(), instance.meta.name.clone());
        let namespace = instance.meta.namespace.as_str();
        let mut removed = 0;
        removed += self.delete_labeled::<Deployment>(namespace, &selector)?;
        removed += self.delete_labeled::<Service>(namespace, &selector)?;
        removed += self.delete_labeled::<PersistentVolumeClaim>(namespace, &selector)?;
        removed += self.delete_labeled::<PersistentVolume>("", &selector)?;
        removed += self.delete_labeled::<ServiceAccount>(namespace, &selector)?;
        removed += self.delete_labeled::<Role>(namespace, &selector)?;
        removed += self.delete_labeled::<RoleBinding>(namespace, &selector)?;

        let trials = self.owned_trials(instance);
        for trial in &trials {
            delete_if_present::<Trial>(&self.store, &trial.key())?;
        }

        let mut released = instance.clone();
        released
            .meta
            .finalizers
            .retain(|f| f != CASCADE_DELETE_FINALIZER);
        self.store.update(released)?;
        self.metrics.experiment_deleted();
        info!(
            experiment = %key,
            trials = trials.len(),
            runtime_resources = removed,
            "experiment deleted"
        );
        Ok(())
    }

    fn delete_labeled<R: Stored>(&self, namespace: &str, selector: &BTreeMap<String, String>) -> HsResult<usize> {
        let mut removed = 0;
        for record in self.store.list::<R>(namespace, selector) {
            if delete_if_present::<R>(&self.store, &record.key())? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl Reconciler for ExperimentReconciler {
    fn kind(&self) -> &'static str {
        Experiment::KIND
    }

    async fn reconcile(&self, key: &ObjectKey) -> HsResult<()> {
        let Some(original) = self.store.try_get::<Experiment>(key) else {
            debug!(experiment = %key, "experiment is gone");
            return Ok(());
        };
        if let Err(e) = self.reconcile_experiment(&original).await {
            error!(experiment = %key, error = %e, "reconcile failed");
            self.store
                .events()
                .warning(&original, RECONCILE_FAILED_REASON, &e.to_string());
            return Err(e);
        }
        Ok(())
    }
}

fn experiment_selector(experiment: &Experiment) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    selector.insert(LABEL_EXPERIMENT_NAME.to_string(), experiment.meta.name.clone());
    selector
}

/// A long running search that stopped on its trial budget can pick up again
/// once the budget is raised.
fn is_restartable(experiment: &Experiment) -> bool {
    experiment.is_completed_reason(EXPERIMENT_MAX_TRIALS_REACHED_REASON)
        && matches!(
            experiment.spec.resume_policy,
            ResumePolicy::LongRunning | ResumePolicy::FromVolume
        )
        && experiment
            .spec
            .max_trial_count
            .map_or(true, |max| max > experiment.status.trials)
}
