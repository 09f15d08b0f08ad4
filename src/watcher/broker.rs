//! Notification fan-out to live connections and polling subscribers.
//!
//! Publishing goes through one `tokio::sync::broadcast` channel, so
//! [`NotificationBroker::publish`] never waits on a reader. Each subscriber
//! sees at most `capacity` unread items: when it falls further behind, its
//! oldest items are skipped and counted. Pull subscribers read through a
//! [`Subscription`]; push connections get a forwarder task that writes one
//! frame per notification to a [`PushTransport`] and removes the connection
//! on the first transport failure. Replies to client messages travel on a
//! per-subscriber channel and never reach other subscribers.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::utils::unix_timestamp;

use super::error::DeliveryError;
use super::event::{ChangeEvent, ChangeKind, ProcessingOutcome};

/// Notification types published by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    FileCreated,
    FileModified,
    FileDeleted,
    GenerationStarted,
    GenerationCompleted,
    GenerationError,
    BatchStarted,
    SystemStatus,
    WatcherStatus,
    ServerStatus,
}

/// Transport-agnostic notification payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event_type: NotificationType,
    pub data: Map<String, Value>,
    pub timestamp: f64,
}

impl Notification {
    /// Build a notification. Non-object `data` is wrapped as `{"value": data}`.
    pub fn new(event_type: NotificationType, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            event_type,
            data,
            timestamp: unix_timestamp(),
        }
    }

    /// Raw change notification. Moves are reported as modifications.
    pub fn file_change(kind: ChangeKind, path: &Path) -> Self {
        let event_type = match kind {
            ChangeKind::Created => NotificationType::FileCreated,
            ChangeKind::Deleted => NotificationType::FileDeleted,
            ChangeKind::Modified | ChangeKind::Moved => NotificationType::FileModified,
        };
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::new(
            event_type,
            json!({
                "file_path": path.display().to_string(),
                "filename": filename,
            }),
        )
    }

    pub fn generation_started(event: &ChangeEvent) -> Self {
        let filename = event.file_name();
        Self::new(
            NotificationType::GenerationStarted,
            json!({
                "message": format!("Starting generation for {filename}"),
                "file_path": event.path.display().to_string(),
                "current_file": filename,
            }),
        )
    }

    pub fn generation_completed(event: &ChangeEvent, outcome: &ProcessingOutcome) -> Self {
        Self::new(
            NotificationType::GenerationCompleted,
            json!({
                "message": format!("Generated output for {}", event.file_name()),
                "file_path": event.path.display().to_string(),
                "output_path": outcome.output_ref,
                "duration_ms": outcome.duration_ms,
                "retry_count": outcome.retry_count,
            }),
        )
    }

    pub fn generation_error(event: &ChangeEvent, outcome: &ProcessingOutcome) -> Self {
        let error = outcome.error_message.clone().unwrap_or_default();
        Self::new(
            NotificationType::GenerationError,
            json!({
                "message": format!("Failed to generate output for {}: {error}", event.file_name()),
                "file_path": event.path.display().to_string(),
                "error_message": error,
                "retry_count": outcome.retry_count,
            }),
        )
    }

    pub fn batch_started(total_files: usize) -> Self {
        Self::new(
            NotificationType::BatchStarted,
            json!({
                "message": format!("Queued {total_files} files for generation"),
                "total_files": total_files,
            }),
        )
    }

    pub fn watcher_status(running: bool, watch_root: &Path) -> Self {
        let state = if running { "started" } else { "stopped" };
        Self::new(
            NotificationType::WatcherStatus,
            json!({
                "message": format!("Watcher {state}"),
                "running": running,
                "watch_root": watch_root.display().to_string(),
            }),
        )
    }

    /// Serialize to one JSON frame.
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Outbound half of a push connection.
#[async_trait]
pub trait PushTransport: Send + Sync + 'static {
    /// Send one frame. An error removes the connection.
    async fn send(&self, frame: String) -> Result<(), DeliveryError>;
}

#[async_trait]
impl PushTransport for mpsc::Sender<String> {
    async fn send(&self, frame: String) -> Result<(), DeliveryError> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| DeliveryError::Closed)
    }
}

#[async_trait]
impl PushTransport for mpsc::UnboundedSender<String> {
    async fn send(&self, frame: String) -> Result<(), DeliveryError> {
        mpsc::UnboundedSender::send(self, frame).map_err(|_| DeliveryError::Closed)
    }
}

/// Read side shared by pull subscriptions and push forwarders.
///
/// Broadcast items are read from the shared ring; private replies arrive on
/// `direct`. The broker removing the subscriber drops the sending half of
/// `direct`, which ends the inbox once its private items are drained.
#[derive(Debug)]
struct Inbox {
    receiver: Option<broadcast::Receiver<Notification>>,
    direct: mpsc::UnboundedReceiver<Notification>,
    capacity: usize,
    dropped: u64,
}

enum Step {
    Item(Notification),
    Lagged(u64),
    Closed,
}

impl Inbox {
    /// Next buffered item without waiting.
    ///
    /// The broadcast ring may hold more than `capacity` unread items; the
    /// excess oldest ones are skipped and counted as dropped.
    fn try_next(&mut self) -> Option<Notification> {
        match self.direct.try_recv() {
            Ok(reply) => return Some(reply),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.receiver = None;
                return None;
            }
            Err(mpsc::error::TryRecvError::Empty) => {}
        }

        let receiver = self.receiver.as_mut()?;
        loop {
            let overflowing = receiver.len() > self.capacity;
            match receiver.try_recv() {
                Ok(_) if overflowing => self.dropped += 1,
                Ok(notification) => return Some(notification),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.dropped += n,
                Err(_) => return None,
            }
        }
    }

    /// Wait for the next item. `None` once the subscriber is removed.
    async fn next(&mut self) -> Option<Notification> {
        loop {
            if let Some(notification) = self.try_next() {
                return Some(notification);
            }
            let receiver = self.receiver.as_mut()?;

            let step = tokio::select! {
                biased;
                reply = self.direct.recv() => match reply {
                    Some(reply) => Step::Item(reply),
                    None => Step::Closed,
                },
                result = receiver.recv() => match result {
                    Ok(notification) => Step::Item(notification),
                    Err(broadcast::error::RecvError::Lagged(n)) => Step::Lagged(n),
                    Err(broadcast::error::RecvError::Closed) => Step::Closed,
                },
            };

            match step {
                Step::Item(notification) => return Some(notification),
                Step::Lagged(n) => self.dropped += n,
                Step::Closed => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    fn len(&self) -> usize {
        let shared = self
            .receiver
            .as_ref()
            .map_or(0, |receiver| receiver.len().min(self.capacity));
        shared + self.direct.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberKind {
    Pull,
    Push,
}

#[derive(Debug)]
struct Entry {
    direct: mpsc::UnboundedSender<Notification>,
    kind: SubscriberKind,
}

/// Connection statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub active_connections: usize,
    pub active_subscribers: usize,
    pub total_connections: u64,
    pub events_sent: u64,
    pub delivery_errors: u64,
    /// Publishes that pushed an item out of some subscriber's window
    /// before that subscriber read it.
    pub dropped_on_overflow: u64,
}

#[derive(Debug)]
struct Shared {
    sender: broadcast::Sender<Notification>,
    subscribers: Mutex<IndexMap<u64, Entry>>,
    capacity: usize,
    next_id: AtomicU64,
    total_connections: AtomicU64,
    events_sent: AtomicU64,
    delivery_errors: AtomicU64,
    dropped_on_overflow: AtomicU64,
}

impl Shared {
    fn register(&self, kind: SubscriberKind) -> (u64, Inbox) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let inbox = Inbox {
            receiver: Some(self.sender.subscribe()),
            direct: direct_rx,
            capacity: self.capacity,
            dropped: 0,
        };
        self.subscribers.lock().insert(
            id,
            Entry {
                direct: direct_tx,
                kind,
            },
        );
        if kind == SubscriberKind::Push {
            self.total_connections.fetch_add(1, Ordering::Relaxed);
        }
        (id, inbox)
    }

    fn remove(&self, id: u64) -> bool {
        self.subscribers.lock().shift_remove(&id).is_some()
    }

    fn contains(&self, id: u64) -> bool {
        self.subscribers.lock().contains_key(&id)
    }

    fn send_to(&self, id: u64, notification: Notification) -> bool {
        self.subscribers
            .lock()
            .get(&id)
            .is_some_and(|entry| entry.direct.send(notification).is_ok())
    }

    fn count(&self, kind: SubscriberKind) -> usize {
        self.subscribers
            .lock()
            .values()
            .filter(|entry| entry.kind == kind)
            .count()
    }
}

/// Fan-out of pipeline notifications.
///
/// Cheap to clone; all clones share one broadcast channel and subscriber set.
#[derive(Debug, Clone)]
pub struct NotificationBroker {
    shared: Arc<Shared>,
}

impl NotificationBroker {
    /// Create a broker whose subscribers each buffer up to `capacity` items.
    ///
    /// Settings validation rejects a zero capacity; here it is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            shared: Arc::new(Shared {
                sender,
                subscribers: Mutex::new(IndexMap::new()),
                capacity,
                next_id: AtomicU64::new(0),
                total_connections: AtomicU64::new(0),
                events_sent: AtomicU64::new(0),
                delivery_errors: AtomicU64::new(0),
                dropped_on_overflow: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a polling subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (id, inbox) = self.shared.register(SubscriberKind::Pull);
        crate::debug_event!("broker", "subscribed", "id {id}");
        Subscription {
            id,
            inbox,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Detach any subscriber or connection by id.
    ///
    /// Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.shared.remove(id);
        if removed {
            crate::debug_event!("broker", "unsubscribed", "id {id}");
        }
        removed
    }

    /// Attach a push connection. Must be called inside a Tokio runtime.
    ///
    /// The connection receives a welcome `system_status` frame first.
    pub fn connect<T: PushTransport>(&self, transport: T) -> Connection {
        let (id, mut inbox) = self.shared.register(SubscriberKind::Push);
        let active = self.shared.count(SubscriberKind::Push);

        self.shared.send_to(
            id,
            Notification::new(
                NotificationType::SystemStatus,
                json!({
                    "message": "Connected to docwatch",
                    "connection_id": id,
                    "active_connections": active,
                }),
            ),
        );

        let shared = Arc::downgrade(&self.shared);
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = inbox.next().await {
                if let Err(e) = transport.send(notification.to_frame()).await {
                    tracing::warn!("[broker] connection {id} failed: {e}");
                    if let Some(shared) = shared.upgrade() {
                        shared.delivery_errors.fetch_add(1, Ordering::Relaxed);
                        shared.remove(id);
                    }
                    break;
                }
            }
            if inbox.dropped > 0 {
                crate::debug_event!("broker", "connection lagged", "id {id}: {} dropped", inbox.dropped);
            }
        });

        crate::log_event!("broker", "connected", "id {id} ({active} active)");
        Connection {
            id,
            shared: Arc::downgrade(&self.shared),
            forwarder: Some(forwarder),
        }
    }

    /// Detach a push connection. Frames not yet forwarded are discarded.
    pub fn disconnect(&self, connection: &Connection) -> bool {
        self.unsubscribe(connection.id)
    }

    /// Deliver a notification to every current subscriber without waiting.
    ///
    /// A subscriber that already holds `capacity` unread items loses its
    /// oldest one. Returns the number of subscribers it was published to.
    pub fn publish(&self, notification: Notification) -> usize {
        let listeners = self.shared.subscribers.lock().len();
        if listeners == 0 {
            crate::debug_event!("broker", "dropped", "no subscribers for {:?}", notification.event_type);
            return 0;
        }

        if self.shared.sender.len() >= self.shared.capacity {
            self.shared.dropped_on_overflow.fetch_add(1, Ordering::Relaxed);
        }
        let event_type = notification.event_type;
        if self.shared.sender.send(notification).is_err() {
            return 0;
        }
        self.shared
            .events_sent
            .fetch_add(listeners as u64, Ordering::Relaxed);

        crate::debug_event!("broker", "published", "{event_type:?} to {listeners} subscribers");
        listeners
    }

    /// Answer a message sent by a client. The reply goes only to `id`.
    ///
    /// Returns `false` if the subscriber is gone.
    pub fn handle_client_message(&self, id: u64, message: &str) -> bool {
        let reply = match serde_json::from_str::<Value>(message) {
            Ok(parsed) => {
                let message_type = parsed
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                match message_type {
                    "ping" => Notification::new(
                        NotificationType::SystemStatus,
                        json!({
                            "message": "pong",
                            "server_time": parsed.get("timestamp").cloned().unwrap_or(Value::Null),
                        }),
                    ),
                    "status_request" => {
                        let info = self.connection_info();
                        Notification::new(
                            NotificationType::ServerStatus,
                            json!({
                                "connections": info.active_connections,
                                "events_sent": info.events_sent,
                            }),
                        )
                    }
                    other => Notification::new(
                        NotificationType::SystemStatus,
                        json!({ "error": format!("Unknown message type: {other}") }),
                    ),
                }
            }
            Err(_) => Notification::new(
                NotificationType::SystemStatus,
                json!({ "error": "Invalid JSON message" }),
            ),
        };

        self.shared.send_to(id, reply)
    }

    /// Number of attached subscribers of either kind.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    /// Number of attached push connections.
    pub fn connection_count(&self) -> usize {
        self.shared.count(SubscriberKind::Push)
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            active_connections: self.shared.count(SubscriberKind::Push),
            active_subscribers: self.shared.count(SubscriberKind::Pull),
            total_connections: self.shared.total_connections.load(Ordering::Relaxed),
            events_sent: self.shared.events_sent.load(Ordering::Relaxed),
            delivery_errors: self.shared.delivery_errors.load(Ordering::Relaxed),
            dropped_on_overflow: self.shared.dropped_on_overflow.load(Ordering::Relaxed),
        }
    }
}

/// Pull-style subscriber handle. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inbox: Inbox,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take the oldest buffered notification, if any.
    pub fn try_recv(&mut self) -> Option<Notification> {
        self.inbox.try_next()
    }

    /// Wait for the next notification. `None` after unsubscribe.
    pub async fn recv(&mut self) -> Option<Notification> {
        self.inbox.next().await
    }

    /// Take everything currently buffered, oldest first.
    pub fn drain(&mut self) -> Vec<Notification> {
        std::iter::from_fn(|| self.inbox.try_next()).collect()
    }

    /// Number of buffered notifications.
    pub fn len(&self) -> usize {
        self.inbox.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifications this subscriber lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.inbox.dropped
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.contains(self.id))
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
    }
}

/// Push connection handle. Dropping it disconnects.
#[derive(Debug)]
pub struct Connection {
    id: u64,
    shared: Weak<Shared>,
    forwarder: Option<JoinHandle<()>>,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the broker still holds this connection.
    pub fn is_active(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.contains(self.id))
    }

    /// Wait until the forwarder exits, after disconnect or transport failure.
    pub async fn closed(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(self.id);
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
