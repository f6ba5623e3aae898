//! Typed condition history shared by Experiments, Trials and Suggestions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// One entry of a condition history. `T` is the per-kind condition type enum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition<T> {
    #[serde(rename = "type")]
    pub condition_type: T,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_update_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

impl<T> Condition<T> {
    pub fn new(condition_type: T, status: ConditionStatus, reason: &str, message: &str) -> Self {
        let now = Utc::now();
        Self {
            condition_type,
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            last_update_time: now,
            last_transition_time: now,
        }
    }
}

/// Ordered condition history, at most one entry per type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions<T>(Vec<Condition<T>>);

impl<T> Default for Conditions<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T: Copy + PartialEq> Conditions<T> {
    pub fn get(&self, condition_type: T) -> Option<&Condition<T>> {
        self.0.iter().find(|c| c.condition_type == condition_type)
    }

    pub fn has(&self, condition_type: T) -> bool {
        self.get(condition_type).is_some()
    }

    pub fn is_true(&self, condition_type: T) -> bool {
        self.get(condition_type)
            .map(|c| c.status == ConditionStatus::True)
            .unwrap_or(false)
    }

    /// Whether `condition_type` is `True` with the given reason.
    pub fn is_true_with_reason(&self, condition_type: T, reason: &str) -> bool {
        self.get(condition_type)
            .map(|c| c.status == ConditionStatus::True && c.reason == reason)
            .unwrap_or(false)
    }

    /// The most recently appended condition.
    pub fn latest(&self) -> Option<&Condition<T>> {
        self.0.last()
    }

    /// Set a condition.
    ///
    /// No-op when status and reason are unchanged. Otherwise the entry moves
    /// to the end of the history; `last_transition_time` is kept when only
    /// the reason or message changed.
    pub fn set(&mut self, condition_type: T, status: ConditionStatus, reason: &str, message: &str) {
        let mut next = Condition::new(condition_type, status, reason, message);

        if let Some(current) = self.get(condition_type) {
            if current.status == status && current.reason == reason {
                return;
            }
            if current.status == status {
                next.last_transition_time = current.last_transition_time;
            }
        }

        self.remove(condition_type);
        self.0.push(next);
    }

    pub fn remove(&mut self, condition_type: T) {
        self.0.retain(|c| c.condition_type != condition_type);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition<T>> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
