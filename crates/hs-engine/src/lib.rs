// HyperSearch controller engine
// Experiment and Suggestion reconcilers on top of the resource store

pub mod admission;
pub mod composer;
pub mod controller;
pub mod experiment;
pub mod manager;
pub mod manifest;
pub mod metrics;
pub mod queue;
pub mod sandbox;
pub mod suggestion;

#[cfg(test)]
mod fixtures;

pub use admission::{newest_trials, plan, requested_assignments, Admission};
pub use composer::RuntimePorts;
pub use controller::{Controller, Reconciler, RECONCILE_FAILED_REASON};
pub use experiment::{ExperimentReconciler, CASCADE_DELETE_FINALIZER};
pub use manager::{route, ControllerManager, Target};
pub use manifest::{DefaultManifestGenerator, ManifestGenerator};
pub use metrics::{ControllerMetrics, MetricsSnapshot};
pub use queue::{Backoff, WorkQueue};
pub use sandbox::{ObjectiveFn, SandboxRuntime};
pub use suggestion::SuggestionReconciler;
