//! Shared counters for the /health endpoint.
//! Updated by the query dispatcher and its tasks.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared health metrics. Updated by query tasks, read by API.
#[derive(Default)]
pub struct HealthState {
    queries_received: AtomicU64,
    queries_succeeded: AtomicU64,
    queries_failed: AtomicU64,
    /// Deliveries dropped without a response (unreadable or not ours).
    events_dropped: AtomicU64,
    tasks_panicked: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub queries_received: u64,
    pub queries_succeeded: u64,
    pub queries_failed: u64,
    pub events_dropped: u64,
    pub tasks_panicked: u64,
    pub in_flight: u64,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_started(&self) {
        self.queries_received.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query_finished(&self, success: bool) {
        if success {
            self.queries_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.queries_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A panicked task never reaches `query_finished`.
    pub fn task_panicked(&self) {
        self.tasks_panicked.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            queries_received: self.queries_received.load(Ordering::Relaxed),
            queries_succeeded: self.queries_succeeded.load(Ordering::Relaxed),
            queries_failed: self.queries_failed.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            tasks_panicked: self.tasks_panicked.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}
