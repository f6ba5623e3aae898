//! Bounded in-memory event log, mirrored to `tracing`.

use chrono::{DateTime, Utc};
use hs_types::{ObjectKey, Resource};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: String,
    pub key: ObjectKey,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct EventRecorder {
    events: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl EventRecorder {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn normal<R: Resource>(&self, obj: &R, reason: &str, message: &str) {
        self.record(obj, EventType::Normal, reason, message);
    }

    pub fn warning<R: Resource>(&self, obj: &R, reason: &str, message: &str) {
        self.record(obj, EventType::Warning, reason, message);
    }

    pub fn record<R: Resource>(&self, obj: &R, event_type: EventType, reason: &str, message: &str) {
        let key = obj.key();
        match event_type {
            EventType::Normal => info!(kind = R::KIND, key = %key, reason, "{}", message),
            EventType::Warning => warn!(kind = R::KIND, key = %key, reason, "{}", message),
        }

        let event = Event {
            kind: R::KIND.to_string(),
            key,
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };

        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Events recorded for one object, oldest first.
    pub fn for_object(&self, kind: &str, key: &ObjectKey) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind && &e.key == key)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Event> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
