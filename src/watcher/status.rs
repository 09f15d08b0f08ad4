//! Pipeline health: counters, bounded history and per-resource errors.
//!
//! All mutation goes through [`StatusRegistry`], whose state sits behind one
//! mutex. Every method holds the lock only for the copy or update it performs,
//! so a [`StatusSnapshot`] is never torn and readers on other threads never
//! wait on a generator call.

use std::collections::VecDeque;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::utils::unix_timestamp;

use super::event::{ChangeEvent, ProcessingOutcome};

/// Monotonic pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    /// Debounced events accepted into the queue.
    pub total_events: u64,
    /// Events that reached a terminal outcome.
    pub files_processed: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Failed attempts that were followed by another attempt.
    pub retry_attempts_total: u64,
}

/// Error state for one resource. Cleared by the next success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub error_count: u32,
    pub last_error_message: String,
}

/// Fixed-capacity history that evicts the oldest entry on overflow.
#[derive(Debug, Clone)]
pub struct HistoryBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T: Clone> HistoryBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, evicting the oldest when full.
    ///
    /// Returns the evicted item, if any.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All items, oldest first.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    /// The `limit` most recent items, oldest first.
    pub fn latest(&self, limit: usize) -> Vec<T> {
        let skip = self.items.len().saturating_sub(limit);
        self.items.iter().skip(skip).cloned().collect()
    }
}

/// Point-in-time copy of pipeline health.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub is_running: bool,
    pub started_at: Option<f64>,
    pub uptime_seconds: f64,
    pub counters: Counters,
    pub recent_events: Vec<ChangeEvent>,
    pub recent_outcomes: Vec<ProcessingOutcome>,
    pub errors_by_key: IndexMap<String, ErrorRecord>,
    /// Events queued for the worker but not yet dequeued.
    pub pending_events: usize,
    pub watched_files: usize,
    /// Changes dropped at the bridge because the pipeline was not running.
    pub bridge_dropped: u64,
}

#[derive(Debug)]
struct State {
    running: bool,
    started_at: Option<f64>,
    counters: Counters,
    events: HistoryBuffer<ChangeEvent>,
    outcomes: HistoryBuffer<ProcessingOutcome>,
    errors: IndexMap<String, ErrorRecord>,
    pending: usize,
    watched_files: usize,
}

/// Shared registry of pipeline health.
#[derive(Debug)]
pub struct StatusRegistry {
    state: Mutex<State>,
}

impl StatusRegistry {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            state: Mutex::new(State {
                running: false,
                started_at: None,
                counters: Counters::default(),
                events: HistoryBuffer::new(max_history_size),
                outcomes: HistoryBuffer::new(max_history_size),
                errors: IndexMap::new(),
                pending: 0,
                watched_files: 0,
            }),
        }
    }

    pub fn mark_started(&self) {
        let mut state = self.state.lock();
        state.running = true;
        state.started_at = Some(unix_timestamp());
    }

    pub fn mark_stopped(&self) {
        let mut state = self.state.lock();
        state.running = false;
        state.pending = 0;
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Record an event entering the worker queue.
    pub fn record_event(&self, event: &ChangeEvent) {
        let mut state = self.state.lock();
        state.counters.total_events += 1;
        state.pending += 1;
        state.events.push(event.clone());
    }

    /// Record an event leaving the queue, either for processing or discard.
    pub fn record_dequeued(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
    }

    /// Record a failed attempt against a resource.
    pub fn record_attempt_failure(&self, key: &str, message: &str) {
        let mut state = self.state.lock();
        let record = state
            .errors
            .entry(key.to_string())
            .or_insert_with(|| ErrorRecord {
                error_count: 0,
                last_error_message: String::new(),
            });
        record.error_count += 1;
        record.last_error_message = message.to_string();
    }

    /// Record that a failed attempt is being retried.
    pub fn record_retry(&self) {
        self.state.lock().counters.retry_attempts_total += 1;
    }

    /// Record a terminal outcome. A success clears the resource's error record.
    pub fn record_outcome(&self, outcome: &ProcessingOutcome) {
        let mut state = self.state.lock();
        state.counters.files_processed += 1;
        if outcome.success {
            state.counters.success_count += 1;
            state.errors.shift_remove(&outcome.resource_key);
        } else {
            state.counters.failure_count += 1;
            if let Some(message) = &outcome.error_message {
                let record = state
                    .errors
                    .entry(outcome.resource_key.clone())
                    .or_insert_with(|| ErrorRecord {
                        error_count: 1,
                        last_error_message: String::new(),
                    });
                record.last_error_message = message.clone();
            }
        }
        state.outcomes.push(outcome.clone());
    }

    pub fn set_watched_files(&self, count: usize) {
        self.state.lock().watched_files = count;
    }

    pub fn pending_events(&self) -> usize {
        self.state.lock().pending
    }

    pub fn counters(&self) -> Counters {
        self.state.lock().counters
    }

    /// Consistent copy of the whole registry.
    pub fn snapshot(&self, bridge_dropped: u64) -> StatusSnapshot {
        let state = self.state.lock();
        let uptime_seconds = match (state.running, state.started_at) {
            (true, Some(started)) => (unix_timestamp() - started).max(0.0),
            _ => 0.0,
        };

        StatusSnapshot {
            is_running: state.running,
            started_at: state.started_at,
            uptime_seconds,
            counters: state.counters,
            recent_events: state.events.to_vec(),
            recent_outcomes: state.outcomes.to_vec(),
            errors_by_key: state.errors.clone(),
            pending_events: state.pending,
            watched_files: state.watched_files,
            bridge_dropped,
        }
    }

    /// The `limit` most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<ChangeEvent> {
        self.state.lock().events.latest(limit)
    }

    /// The `limit` most recent outcomes, oldest first.
    pub fn recent_outcomes(&self, limit: usize) -> Vec<ProcessingOutcome> {
        self.state.lock().outcomes.latest(limit)
    }

    /// Current error records in the order they first failed.
    pub fn error_summary(&self) -> IndexMap<String, ErrorRecord> {
        self.state.lock().errors.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watcher::event::ChangeKind;
    use proptest::prelude::*;

    fn event(key: &str) -> ChangeEvent {
        ChangeEvent::new(key, ChangeKind::Modified, 1.0)
    }

    proptest! {
        #[test]
        fn prop_history_keeps_newest_tail(capacity in 1usize..64, pushes in 0usize..256) {
            let mut buffer = HistoryBuffer::new(capacity);
            let mut evicted = Vec::new();
            for item in 0..pushes {
                evicted.extend(buffer.push(item));
                prop_assert!(buffer.len() <= capacity);
            }

            // Oldest first out: evictions are a prefix, the buffer the tail.
            let kept = pushes.min(capacity);
            prop_assert_eq!(buffer.len(), kept);
            prop_assert_eq!(evicted, (0..pushes - kept).collect::<Vec<_>>());
            prop_assert_eq!(buffer.to_vec(), (pushes - kept..pushes).collect::<Vec<_>>());
        }

        #[test]
        fn prop_latest_is_suffix_of_history(
            capacity in 1usize..32,
            pushes in 0usize..100,
            limit in 0usize..40,
        ) {
            let mut buffer = HistoryBuffer::new(capacity);
            for item in 0..pushes {
                buffer.push(item);
            }

            let all = buffer.to_vec();
            let latest = buffer.latest(limit);
            prop_assert_eq!(latest.len(), limit.min(all.len()));
            prop_assert!(all.ends_with(&latest));
        }
    }

    #[test]
    fn test_history_push_returns_evicted() {
        let mut buffer = HistoryBuffer::new(2);
        assert_eq!(buffer.push("a"), None);
        assert_eq!(buffer.push("b"), None);
        assert_eq!(buffer.push("c"), Some("a"));
        assert_eq!(buffer.latest(1), vec!["c"]);
        assert_eq!(buffer.latest(10), vec!["b", "c"]);
    }

    #[test]
    fn test_registry_history_bounded() {
        let registry = StatusRegistry::new(100);
        for i in 0..250 {
            let e = event(&format!("f{i}.py"));
            registry.record_event(&e);
            registry.record_dequeued();
            registry.record_outcome(&ProcessingOutcome::succeeded(&e, None, 1.0));
        }

        let snapshot = registry.snapshot(0);
        assert_eq!(snapshot.recent_events.len(), 100);
        assert_eq!(snapshot.recent_outcomes.len(), 100);
        assert_eq!(snapshot.recent_events[0].resource_key, "f150.py");
        assert_eq!(snapshot.recent_events[99].resource_key, "f249.py");
        assert_eq!(snapshot.counters.total_events, 250);
        assert_eq!(snapshot.counters.files_processed, 250);
        assert_eq!(snapshot.pending_events, 0);
    }

    #[test]
    fn test_success_clears_error_record() {
        let registry = StatusRegistry::new(10);
        let e = event("a.py");

        registry.record_attempt_failure("a.py", "boom 1");
        registry.record_retry();
        registry.record_attempt_failure("a.py", "boom 2");
        registry.record_outcome(&ProcessingOutcome::failed(&e, "boom 2".into(), 3.0));

        let errors = registry.error_summary();
        assert_eq!(errors["a.py"].error_count, 2);
        assert_eq!(errors["a.py"].last_error_message, "boom 2");
        assert_eq!(registry.counters().failure_count, 1);
        assert_eq!(registry.counters().retry_attempts_total, 1);

        registry.record_outcome(&ProcessingOutcome::succeeded(&e, None, 1.0));
        assert!(registry.error_summary().is_empty());
        assert_eq!(registry.counters().success_count, 1);
    }

    #[test]
    fn test_snapshot_reflects_lifecycle() {
        let registry = StatusRegistry::new(10);
        assert!(!registry.snapshot(0).is_running);

        registry.mark_started();
        registry.record_event(&event("a.py"));
        registry.set_watched_files(4);
        let running = registry.snapshot(3);
        assert!(running.is_running);
        assert!(running.started_at.is_some());
        assert_eq!(running.pending_events, 1);
        assert_eq!(running.watched_files, 4);
        assert_eq!(running.bridge_dropped, 3);

        registry.mark_stopped();
        let stopped = registry.snapshot(3);
        assert!(!stopped.is_running);
        assert_eq!(stopped.pending_events, 0);
        assert_eq!(stopped.uptime_seconds, 0.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let registry = StatusRegistry::new(10);
        registry.record_attempt_failure("a.py", "boom");
        let json = serde_json::to_value(registry.snapshot(0)).unwrap();

        assert_eq!(json["is_running"], false);
        assert_eq!(json["errors_by_key"]["a.py"]["error_count"], 1);
        assert_eq!(json["counters"]["total_events"], 0);
    }
}
