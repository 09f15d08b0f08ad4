//! Sequential processing of debounced events.
//!
//! The worker pulls one [`ChangeEvent`] at a time from its queue and drives
//! the [`Generator`] through bounded retry with a fixed backoff. Exactly one
//! generator invocation is ever in flight: the next event is not dequeued
//! until the current one has a terminal outcome.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;

use super::broker::{Notification, NotificationBroker};
use super::error::GenerateError;
use super::event::{ChangeEvent, ProcessingOutcome};
use super::generator::Generator;
use super::status::StatusRegistry;

/// Retry settings taken from [`WatchConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    /// Per-attempt limit. `None` waits for the generator indefinitely.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            max_retry_attempts: config.max_retries(),
            retry_delay: config.retry_delay(),
            timeout: config.generation_timeout(),
        }
    }
}

type OutcomeCallback = Arc<dyn Fn(&ProcessingOutcome) + Send + Sync>;

/// Registered observers of terminal outcomes.
#[derive(Default)]
pub struct OutcomeCallbacks {
    callbacks: Mutex<IndexMap<u64, OutcomeCallback>>,
    next_id: AtomicU64,
}

impl OutcomeCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It stays registered until the handle is removed
    /// or dropped.
    pub fn register<F>(self: &Arc<Self>, callback: F) -> CallbackHandle
    where
        F: Fn(&ProcessingOutcome) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.callbacks.lock().insert(id, Arc::new(callback));
        CallbackHandle {
            id,
            callbacks: Arc::downgrade(self),
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, outcome: &ProcessingOutcome) {
        // Copy out so a callback may register or remove others.
        let callbacks: Vec<OutcomeCallback> = self.callbacks.lock().values().cloned().collect();
        for callback in callbacks {
            callback(outcome);
        }
    }

    fn remove(&self, id: u64) -> bool {
        self.callbacks.lock().shift_remove(&id).is_some()
    }
}

impl std::fmt::Debug for OutcomeCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeCallbacks")
            .field("registered", &self.len())
            .finish()
    }
}

/// Unregisters its callback on [`remove`](Self::remove) or drop.
#[derive(Debug)]
pub struct CallbackHandle {
    id: u64,
    callbacks: std::sync::Weak<OutcomeCallbacks>,
}

impl CallbackHandle {
    pub fn remove(self) {
        drop(self);
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(callbacks) = self.callbacks.upgrade() {
            callbacks.remove(self.id);
        }
    }
}

/// Consumer of the processing queue.
pub struct Worker {
    generator: Arc<dyn Generator>,
    registry: Arc<StatusRegistry>,
    broker: NotificationBroker,
    callbacks: Arc<OutcomeCallbacks>,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(
        generator: Arc<dyn Generator>,
        registry: Arc<StatusRegistry>,
        broker: NotificationBroker,
        callbacks: Arc<OutcomeCallbacks>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            generator,
            registry,
            broker,
            callbacks,
            policy,
        }
    }

    /// Process queued events until cancelled or the queue closes.
    ///
    /// An event already being processed when `cancel` fires is allowed to
    /// finish. Events still queued afterwards are discarded. Returns the
    /// number of events that reached a terminal outcome.
    pub async fn run(
        self,
        mut queue: mpsc::UnboundedReceiver<ChangeEvent>,
        cancel: CancellationToken,
    ) -> usize {
        let mut processed = 0;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = queue.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };

            self.registry.record_dequeued();
            self.process(event, &cancel).await;
            processed += 1;
        }

        queue.close();
        let mut discarded = 0;
        while queue.try_recv().is_ok() {
            self.registry.record_dequeued();
            discarded += 1;
        }
        if discarded > 0 {
            crate::log_event!("worker", "discarded", "{discarded} queued events");
        }

        crate::debug_event!("worker", "stopped", "{processed} processed");
        processed
    }

    /// Drive one event to its terminal outcome.
    pub async fn process(
        &self,
        mut event: ChangeEvent,
        cancel: &CancellationToken,
    ) -> ProcessingOutcome {
        let started = Instant::now();
        self.broker.publish(Notification::generation_started(&event));
        crate::debug_event!(
            "worker",
            "generating",
            "{} ({})",
            event.file_name(),
            self.generator.name()
        );

        let outcome = loop {
            let error = match self.attempt(&event).await {
                Ok(output_ref) => {
                    break ProcessingOutcome::succeeded(&event, output_ref, elapsed_ms(started));
                }
                Err(error) => error.to_string(),
            };

            self.registry
                .record_attempt_failure(&event.resource_key, &error);

            if event.attempt >= self.policy.max_retry_attempts {
                break ProcessingOutcome::failed(&event, error, elapsed_ms(started));
            }

            tracing::warn!(
                "[worker] attempt {} for {} failed: {error}",
                event.attempt + 1,
                event.file_name()
            );

            let stopped = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = sleep(self.policy.retry_delay) => false,
            };
            if stopped {
                crate::debug_event!("worker", "retries abandoned", "{}", event.file_name());
                break ProcessingOutcome::failed(&event, error, elapsed_ms(started));
            }

            self.registry.record_retry();
            event.attempt += 1;
        };

        self.registry.record_outcome(&outcome);
        if outcome.success {
            crate::log_event!(
                "worker",
                "generated",
                "{} in {:.0}ms",
                event.file_name(),
                outcome.duration_ms
            );
            self.broker
                .publish(Notification::generation_completed(&event, &outcome));
        } else {
            tracing::error!(
                "[worker] giving up on {} after {} attempts: {}",
                event.file_name(),
                outcome.retry_count + 1,
                outcome.error_message.as_deref().unwrap_or_default()
            );
            self.broker
                .publish(Notification::generation_error(&event, &outcome));
        }
        self.callbacks.notify(&outcome);

        outcome
    }

    /// One generate-and-write attempt.
    ///
    /// Runs as its own task so a panicking generator is reported as a failed
    /// attempt. On timeout the task is aborted and then awaited: a generator
    /// that blocks without reaching an `.await` still finishes before the
    /// next attempt may start.
    async fn attempt(&self, event: &ChangeEvent) -> Result<Option<String>, GenerateError> {
        let generator = Arc::clone(&self.generator);
        let job_event = event.clone();
        let mut job = tokio::spawn(async move {
            let generation = generator.generate(&job_event).await?;
            if !generation.success {
                return Err(GenerateError::Reported);
            }
            generator.write(&job_event, &generation).await
        });

        let joined = match self.policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut job).await {
                Ok(joined) => joined,
                Err(_) => {
                    job.abort();
                    let _ = job.await;
                    return Err(GenerateError::Timeout(limit));
                }
            },
            None => job.await,
        };

        joined.map_err(|e| GenerateError::Panicked(panic_message(e)))?
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
