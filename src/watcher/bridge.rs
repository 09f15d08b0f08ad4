//! Hand-off from the filesystem notification thread into the pipeline.
//!
//! The notify callback runs on a thread owned by the OS backend. The only
//! thing it may do is call [`EventBridge::deliver`], which turns the raw
//! change into a [`ChangeEvent`] and pushes it onto an unbounded channel
//! read by the pipeline's intake task. Nothing here ever waits: if the
//! pipeline is not running (or is in the middle of opening/closing the
//! bridge) the event is dropped and counted. A rescan on start recovers
//! anything missed this way.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::event::{ChangeEvent, ChangeKind};

/// Single entry point for cross-thread change delivery.
#[derive(Debug, Default)]
pub struct EventBridge {
    sender: RwLock<Option<mpsc::UnboundedSender<ChangeEvent>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a raw change from any thread. Never blocks.
    ///
    /// Returns `false` when the event was dropped because the processing
    /// context is not active.
    pub fn deliver(&self, path: PathBuf, kind: ChangeKind, timestamp: f64) -> bool {
        let event = ChangeEvent::new(path, kind, timestamp);

        let sent = match self.sender.try_read() {
            Some(guard) => match guard.as_ref() {
                Some(tx) => tx.send(event).map_err(|rejected| rejected.0),
                None => Err(event),
            },
            // Writer holds the lock: the bridge is being opened or closed.
            None => Err(event),
        };

        match sent {
            Ok(()) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(event) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                crate::debug_event!(
                    "bridge",
                    "dropped",
                    "{} {} (context not active, {total} dropped so far)",
                    event.kind,
                    event.resource_key
                );
                false
            }
        }
    }

    /// Open the bridge, returning the receiving end for the owning context.
    ///
    /// Replaces any previous receiver.
    pub(crate) fn open(&self) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.write() = Some(tx);
        rx
    }

    /// Close the bridge. Subsequent deliveries are dropped.
    pub(crate) fn close(&self) {
        self.sender.write().take();
    }

    /// Check if deliveries are currently accepted.
    pub fn is_open(&self) -> bool {
        self.sender.read().is_some()
    }

    /// Number of events handed to the owning context.
    pub fn delivered_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Number of events dropped because the context was not active.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_deliver_before_open_drops() {
        let bridge = EventBridge::new();

        assert!(!bridge.is_open());
        assert!(!bridge.deliver("a.py".into(), ChangeKind::Modified, 1.0));
        assert_eq!(bridge.dropped_count(), 1);
        assert_eq!(bridge.delivered_count(), 0);
    }

    #[test]
    fn test_deliver_after_open_reaches_receiver() {
        let bridge = EventBridge::new();
        let mut rx = bridge.open();

        assert!(bridge.deliver("a.py".into(), ChangeKind::Created, 3.5));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.resource_key, "a.py");
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.timestamp, 3.5);
        assert_eq!(event.attempt, 0);
        assert_eq!(bridge.delivered_count(), 1);
    }

    #[test]
    fn test_deliver_after_close_drops() {
        let bridge = EventBridge::new();
        let _rx = bridge.open();
        bridge.close();

        assert!(!bridge.deliver("a.py".into(), ChangeKind::Modified, 1.0));
        assert_eq!(bridge.dropped_count(), 1);
    }

    #[test]
    fn test_deliver_with_receiver_gone_drops() {
        let bridge = EventBridge::new();
        drop(bridge.open());

        assert!(!bridge.deliver("a.py".into(), ChangeKind::Modified, 1.0));
        assert_eq!(bridge.dropped_count(), 1);
    }

    #[test]
    fn test_deliver_from_foreign_threads() {
        let bridge = Arc::new(EventBridge::new());
        let mut rx = bridge.open();

        let producers: Vec<_> = (0..4)
            .map(|i| {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || {
                    for j in 0..25 {
                        bridge.deliver(format!("f{i}_{j}.py").into(), ChangeKind::Modified, 1.0);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 100);
        assert_eq!(bridge.dropped_count(), 0);
    }
}
