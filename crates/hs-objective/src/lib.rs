//! # hs-objective
//!
//! Objective evaluation for HyperSearch experiments.
//!
//! Classifies Trials into their lifecycle buckets, extracts objective metric
//! values with the configured per-metric strategy, and tracks the current
//! optimal Trial and whether the objective goal has been reached.

mod evaluator;
mod metric;

pub use evaluator::{apply_summary, classify, summarize, TrialPhase, TrialsSummary};
pub use metric::{objective_value, observed_value};
