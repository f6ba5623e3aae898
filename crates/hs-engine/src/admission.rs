//! Trial admission arithmetic.

use hs_types::Trial;
use std::cmp::Reverse;
use tracing::info;

/// What a pass should do about the number of live Trials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Create this many Trials.
    Add(u32),
    /// Delete this many Trials.
    Delete(u32),
    Hold,
}

/// Decide how many Trials to add or delete.
///
/// Above `parallel` active Trials the surplus is deleted. Below it, enough
/// Trials are added to reach `parallel` without letting completed plus
/// active exceed `max_trial_count`.
pub fn plan(active: u32, completed: u32, parallel: u32, max_trial_count: Option<u32>) -> Admission {
    if active > parallel {
        return Admission::Delete(active - parallel);
    }
    if active == parallel {
        return Admission::Hold;
    }

    let required = match max_trial_count {
        Some(max) => (parallel as i64).min(max as i64 - completed as i64),
        None => parallel as i64,
    };
    let add = required - active as i64;
    if add < 0 {
        info!(active, completed, parallel, add, "negative trial add count, clamping to zero");
        return Admission::Hold;
    }
    if add == 0 {
        Admission::Hold
    } else {
        Admission::Add(add as u32)
    }
}

/// Number of assignments the Suggestion should hold once `add_count` more
/// Trials exist. Early stopped Trials still waiting for metrics are not
/// counted.
pub fn requested_assignments(trials: &[Trial], add_count: u32) -> u32 {
    let incomplete_early_stopped = trials
        .iter()
        .filter(|t| t.is_early_stopped() && !t.has_observation())
        .count();
    (trials.len() + add_count as usize).saturating_sub(incomplete_early_stopped) as u32
}

/// The `count` newest Trials, newest first. Ties are broken by name so the
/// choice is stable.
pub fn newest_trials(trials: &[Trial], count: usize) -> Vec<&Trial> {
    let mut ordered: Vec<&Trial> = trials.iter().collect();
    ordered.sort_by_key(|t| (Reverse(t.meta.creation_timestamp), Reverse(t.meta.name.clone())));
    ordered.truncate(count);
    ordered
}
