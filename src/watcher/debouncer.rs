//! Per-key debouncing of change events.
//!
//! Bursts of changes to the same resource (auto-save, IDE formatting, editors
//! writing through a temp file) collapse into one trailing emission carrying
//! the newest event once the key has been quiet for the configured delay.
//!
//! Each pending key owns one timer task. When a timer elapses it does not emit
//! directly; it sends an [`Expired`] token back to the owner, which calls
//! [`Debouncer::fire`]. The token carries the generation of the timer that
//! produced it, so a timer that lost a race with a reschedule or a cancel is
//! recognised as stale and ignored.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use super::event::ChangeEvent;

/// Token sent by an elapsed timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expired {
    key: String,
    generation: u64,
}

impl Expired {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug)]
struct Pending {
    event: ChangeEvent,
    generation: u64,
    timer: JoinHandle<()>,
}

/// Debounces change events by resource key.
///
/// Must only be touched from the task that owns it; the map itself is not
/// shared.
#[derive(Debug)]
pub struct Debouncer {
    /// Pending changes: key -> latest event and its timer.
    pending: HashMap<String, Pending>,
    /// How long a key must be quiet before it is emitted.
    delay: Duration,
    next_generation: u64,
    expired_tx: mpsc::UnboundedSender<Expired>,
}

impl Debouncer {
    /// Create a debouncer and the receiver its timers report to.
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<Expired>) {
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let debouncer = Self {
            pending: HashMap::new(),
            delay,
            next_generation: 0,
            expired_tx,
        };
        (debouncer, expired_rx)
    }

    /// Record a change, replacing any pending event for the same key and
    /// restarting its quiet window.
    ///
    /// Returns `true` if a pending event was superseded.
    pub fn record(&mut self, event: ChangeEvent) -> bool {
        self.next_generation += 1;
        let generation = self.next_generation;
        let key = event.resource_key.clone();

        let deadline = Instant::now() + self.delay;
        let tx = self.expired_tx.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            sleep_until(deadline).await;
            let _ = tx.send(Expired {
                key: timer_key,
                generation,
            });
        });

        match self.pending.insert(
            key,
            Pending {
                event,
                generation,
                timer,
            },
        ) {
            Some(previous) => {
                previous.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Resolve an elapsed timer.
    ///
    /// Returns the latest event for the key if the token belongs to the
    /// current timer, clearing the key. Stale tokens return `None`.
    pub fn fire(&mut self, expired: Expired) -> Option<ChangeEvent> {
        let current = self
            .pending
            .get(&expired.key)
            .is_some_and(|pending| pending.generation == expired.generation);

        if !current {
            crate::debug_event!("debounce", "stale timer", "{}", expired.key);
            return None;
        }

        self.pending.remove(&expired.key).map(|pending| pending.event)
    }

    /// Drop the pending event for one key without emitting it.
    pub fn remove(&mut self, key: &str) -> Option<ChangeEvent> {
        self.pending.remove(key).map(|pending| {
            pending.timer.abort();
            pending.event
        })
    }

    /// Discard every pending timer and payload without emitting.
    ///
    /// Returns how many keys were pending.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
        }
        count
    }

    /// Check if there are any pending changes.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Get the number of pending changes.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
