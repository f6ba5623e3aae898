//! Wires the store's watch stream to the Experiment and Suggestion
//! controllers and owns their lifecycle.

use hs_store::{Store, WatchEvent};
use hs_suggestion::AlgorithmConnector;
use hs_types::{
    Deployment, Experiment, ObjectKey, PersistentVolumeClaim, Resource, RuntimeConfig, Service,
    Suggestion, Trial,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::experiment::ExperimentReconciler;
use crate::manifest::ManifestGenerator;
use crate::metrics::ControllerMetrics;
use crate::queue::WorkQueue;
use crate::suggestion::SuggestionReconciler;

/// Which controller a key is queued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Experiment,
    Suggestion,
}

/// Keys a change notification should requeue.
///
/// Trials requeue their Experiment; Suggestions requeue themselves and their
/// Experiment; runtime resources requeue the Suggestion owning them.
pub fn route(event: &WatchEvent) -> Vec<(Target, ObjectKey)> {
    let owner = |kind: &str| {
        event
            .owner
            .as_ref()
            .filter(|o| o.kind == kind)
            .map(|o| ObjectKey::new(event.key.namespace.clone(), o.name.clone()))
    };

    match event.kind {
        k if k == Experiment::KIND => vec![(Target::Experiment, event.key.clone())],
        k if k == Trial::KIND => owner(Experiment::KIND)
            .map(|key| vec![(Target::Experiment, key)])
            .unwrap_or_default(),
        k if k == Suggestion::KIND => {
            let mut targets = vec![(Target::Suggestion, event.key.clone())];
            if let Some(key) = owner(Experiment::KIND) {
                targets.push((Target::Experiment, key));
            }
            targets
        }
        k if k == Deployment::KIND || k == Service::KIND || k == PersistentVolumeClaim::KIND => {
            owner(Suggestion::KIND)
                .map(|key| vec![(Target::Suggestion, key)])
                .unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

pub struct ControllerManager {
    store: Arc<Store>,
    experiments: Controller,
    suggestions: Controller,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl ControllerManager {
    pub fn new(
        store: Arc<Store>,
        connector: Arc<dyn AlgorithmConnector>,
        manifests: Arc<dyn ManifestGenerator>,
        metrics: Arc<ControllerMetrics>,
        runtime: &RuntimeConfig,
    ) -> Self {
        let experiment_reconciler = ExperimentReconciler::new(
            Arc::clone(&store),
            Arc::clone(&manifests),
            metrics,
            runtime.clone(),
        );
        let suggestion_reconciler =
            SuggestionReconciler::new(Arc::clone(&store), connector, manifests, runtime);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            store,
            experiments: Controller::new(Arc::new(experiment_reconciler), runtime.workers),
            suggestions: Controller::new(Arc::new(suggestion_reconciler), runtime.workers),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Receiver flipping to `true` when the manager shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Spawn both worker pools and the event router, then queue every
    /// existing record once.
    pub fn start(&mut self) {
        let events = self.store.watch();
        let shutdown = self.shutdown_signal();
        self.handles.extend(self.experiments.spawn(shutdown.clone()));
        self.handles.extend(self.suggestions.spawn(shutdown.clone()));

        let experiments = Arc::clone(self.experiments.queue());
        let suggestions = Arc::clone(self.suggestions.queue());
        resync(&self.store, &experiments, &suggestions);
        self.handles.push(tokio::spawn(route_events(
            Arc::clone(&self.store),
            events,
            experiments,
            suggestions,
            shutdown,
        )));
        info!("controller manager started");
    }

    /// Stop routing, drain the workers and wait for them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        self.experiments.queue().shutdown();
        self.suggestions.queue().shutdown();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "controller task ended abnormally");
            }
        }
        info!("controller manager stopped");
    }
}

fn resync(store: &Store, experiments: &WorkQueue, suggestions: &WorkQueue) {
    for key in store.keys::<Experiment>() {
        experiments.add(key);
    }
    for key in store.keys::<Suggestion>() {
        suggestions.add(key);
    }
}

async fn route_events(
    store: Arc<Store>,
    mut events: broadcast::Receiver<WatchEvent>,
    experiments: Arc<WorkQueue>,
    suggestions: Arc<WorkQueue>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    for (target, key) in route(&event) {
                        debug!(kind = event.kind, ?target, key = %key, "queueing");
                        match target {
                            Target::Experiment => experiments.add(key),
                            Target::Suggestion => suggestions.add(key),
                        }
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "watch stream lagged, resyncing");
                    resync(&store, &experiments, &suggestions);
                }
                Err(RecvError::Closed) => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("event router stopped");
}
