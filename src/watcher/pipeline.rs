//! Pipeline lifecycle: wires source, debouncer, worker, status and broker.
//!
//! A running pipeline owns two tasks. The intake task reads raw changes from
//! the [`EventBridge`], broadcasts them, filters them and feeds the
//! [`Debouncer`]; emissions go onto the worker queue. The worker task consumes
//! that queue one event at a time. Status and notifications are shared with
//! callers through [`StatusRegistry`] and [`NotificationBroker`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
use crate::utils::unix_timestamp;

use super::bridge::EventBridge;
use super::broker::{Notification, NotificationBroker};
use super::debouncer::{Debouncer, Expired};
use super::error::WatchError;
use super::event::{ChangeEvent, ChangeKind, ProcessingOutcome};
use super::generator::Generator;
use super::source::{ChangeFilter, FsChangeSource};
use super::status::{ErrorRecord, StatusRegistry, StatusSnapshot};
use super::worker::{CallbackHandle, OutcomeCallbacks, RetryPolicy, Worker};

const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    config: WatchConfig,
    generator: Option<Arc<dyn Generator>>,
    broker: Option<NotificationBroker>,
    watch_filesystem: bool,
}

impl PipelineBuilder {
    pub fn config(mut self, config: WatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Share an existing broker instead of creating one.
    pub fn broker(mut self, broker: NotificationBroker) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Attach an OS file watcher on start (default `true`).
    ///
    /// Without it, changes only arrive through [`Pipeline::bridge`].
    pub fn watch_filesystem(mut self, enabled: bool) -> Self {
        self.watch_filesystem = enabled;
        self
    }

    /// Validate the configuration and build the pipeline.
    pub fn build(self) -> Result<Pipeline, WatchError> {
        self.config.validate()?;
        let filter = ChangeFilter::from_config(&self.config)?;
        let generator = self.generator.ok_or_else(|| WatchError::InitFailed {
            reason: "no generator configured".to_string(),
        })?;

        Ok(Pipeline {
            registry: Arc::new(StatusRegistry::new(self.config.max_history_size)),
            broker: self
                .broker
                .unwrap_or_else(|| NotificationBroker::new(DEFAULT_QUEUE_CAPACITY)),
            config: self.config,
            filter,
            generator,
            bridge: Arc::new(EventBridge::new()),
            callbacks: Arc::new(OutcomeCallbacks::new()),
            watch_filesystem: self.watch_filesystem,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    cancel: CancellationToken,
    source: Option<FsChangeSource>,
    filter: ChangeFilter,
    queue_tx: mpsc::UnboundedSender<ChangeEvent>,
    intake: JoinHandle<()>,
    worker: JoinHandle<usize>,
}

/// Change-detection and notification pipeline for one watch root.
pub struct Pipeline {
    config: WatchConfig,
    filter: ChangeFilter,
    generator: Arc<dyn Generator>,
    bridge: Arc<EventBridge>,
    registry: Arc<StatusRegistry>,
    broker: NotificationBroker,
    callbacks: Arc<OutcomeCallbacks>,
    watch_filesystem: bool,
    running: Mutex<Option<Running>>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder {
            config: WatchConfig::default(),
            generator: None,
            broker: None,
            watch_filesystem: true,
        }
    }

    /// Build a pipeline with its own broker and an OS file watcher.
    pub fn new(config: WatchConfig, generator: Arc<dyn Generator>) -> Result<Self, WatchError> {
        Self::builder().config(config).generator(generator).build()
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Entry point for changes coming from other threads.
    pub fn bridge(&self) -> Arc<EventBridge> {
        Arc::clone(&self.bridge)
    }

    pub fn broker(&self) -> &NotificationBroker {
        &self.broker
    }

    pub fn is_running(&self) -> bool {
        self.registry.is_running()
    }

    /// Start watching. Calling it on a running pipeline does nothing.
    pub async fn start(&self) -> Result<(), WatchError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            crate::debug_event!("pipeline", "already running");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.config.watch_root)
            .await
            .map_err(|e| WatchError::PathWatchFailed {
                path: self.config.watch_root.clone(),
                reason: e.to_string(),
            })?;
        let filter = off_runtime({
            let mut filter = self.filter.clone();
            move || {
                filter.resolve_root();
                filter
            }
        })
        .await?;

        let changes = self.bridge.open();
        let prepared = self.watch_and_scan(&filter).await;
        let (source, files) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                self.bridge.close();
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (debouncer, expired) = Debouncer::new(self.config.debounce_delay());

        let intake = Intake {
            filter: filter.clone(),
            debouncer,
            registry: Arc::clone(&self.registry),
            broker: self.broker.clone(),
            queue_tx: queue_tx.clone(),
        };
        let intake = tokio::spawn(intake.run(changes, expired, cancel.clone()));

        let worker = Worker::new(
            Arc::clone(&self.generator),
            Arc::clone(&self.registry),
            self.broker.clone(),
            Arc::clone(&self.callbacks),
            RetryPolicy::from_config(&self.config),
        );
        let worker = tokio::spawn(worker.run(queue_rx, cancel.clone()));

        self.registry.mark_started();
        self.broker
            .publish(Notification::watcher_status(true, filter.root()));

        self.registry.set_watched_files(files.len());
        if self.config.rescan_on_start && !files.is_empty() {
            self.broker.publish(Notification::batch_started(files.len()));
            for file in &files {
                let event = ChangeEvent::new(file, ChangeKind::Created, unix_timestamp());
                enqueue(&self.registry, &queue_tx, event);
            }
        }

        crate::log_event!(
            "pipeline",
            "started",
            "{} ({} files)",
            filter.root().display(),
            files.len()
        );

        *running = Some(Running {
            cancel,
            source,
            filter,
            queue_tx,
            intake,
            worker,
        });
        Ok(())
    }

    /// Attach the OS watcher (when enabled) and list the files already
    /// under the root. The watcher is attached first so nothing created
    /// during the scan is missed.
    async fn watch_and_scan(
        &self,
        filter: &ChangeFilter,
    ) -> Result<(Option<FsChangeSource>, Vec<PathBuf>), WatchError> {
        let source = if self.watch_filesystem {
            let root = filter.root().to_path_buf();
            let recursive = self.config.recursive;
            let bridge = self.bridge();
            Some(off_runtime(move || FsChangeSource::start(&root, recursive, bridge)).await??)
        } else {
            None
        };

        let files = off_runtime({
            let filter = filter.clone();
            move || filter.scan()
        })
        .await?;
        Ok((source, files))
    }

    /// Stop watching.
    ///
    /// Pending debounce timers are discarded, a generator call already in
    /// progress is allowed to finish, and queued events are dropped.
    /// Calling it on a stopped pipeline does nothing.
    pub async fn stop(&self) {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.take() else {
            crate::debug_event!("pipeline", "not running");
            return;
        };

        drop(running.source);
        self.bridge.close();
        running.cancel.cancel();

        if let Err(e) = running.intake.await {
            tracing::warn!("[pipeline] intake task failed: {e}");
        }
        drop(running.queue_tx);
        let processed = match running.worker.await {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!("[pipeline] worker task failed: {e}");
                0
            }
        };

        self.registry.mark_stopped();
        self.broker
            .publish(Notification::watcher_status(false, running.filter.root()));
        crate::log_event!("pipeline", "stopped", "{processed} events processed");
    }

    /// Run `f` with the pipeline started, stopping it afterwards whatever
    /// `f` returns.
    pub async fn scoped<'a, F, Fut, T>(&'a self, f: F) -> Result<T, WatchError>
    where
        F: FnOnce(&'a Pipeline) -> Fut,
        Fut: Future<Output = T> + 'a,
    {
        self.start().await?;
        let guard = AbortOnDrop {
            pipeline: Some(self),
        };
        let value = f(self).await;
        guard.disarm();
        self.stop().await;
        Ok(value)
    }

    /// Queue one file for generation immediately, bypassing the debounce.
    pub async fn regenerate(&self, path: impl Into<PathBuf>) -> Result<(), WatchError> {
        let guard = self.running.lock().await;
        let running = guard.as_ref().ok_or(WatchError::NotRunning)?;

        let event = ChangeEvent::new(path, ChangeKind::Modified, unix_timestamp());
        if enqueue(&self.registry, &running.queue_tx, event) {
            Ok(())
        } else {
            Err(WatchError::ChannelClosed)
        }
    }

    /// Rescan the watch root and queue every matching file.
    ///
    /// Returns the number of files queued.
    pub async fn regenerate_all(&self) -> Result<usize, WatchError> {
        let guard = self.running.lock().await;
        let running = guard.as_ref().ok_or(WatchError::NotRunning)?;

        let files = off_runtime({
            let filter = running.filter.clone();
            move || filter.scan()
        })
        .await?;
        self.registry.set_watched_files(files.len());
        self.broker.publish(Notification::batch_started(files.len()));

        for file in &files {
            let event = ChangeEvent::new(file, ChangeKind::Modified, unix_timestamp());
            if !enqueue(&self.registry, &running.queue_tx, event) {
                return Err(WatchError::ChannelClosed);
            }
        }
        Ok(files.len())
    }

    /// Register a callback for every terminal outcome.
    pub fn on_outcome<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&ProcessingOutcome) + Send + Sync + 'static,
    {
        self.callbacks.register(callback)
    }

    /// Consistent status snapshot. Callable from any thread.
    pub fn status(&self) -> StatusSnapshot {
        self.registry.snapshot(self.bridge.dropped_count())
    }

    /// The `limit` most recent change events.
    pub fn recent_events(&self, limit: usize) -> Vec<ChangeEvent> {
        self.registry.recent_events(limit)
    }

    /// The `limit` most recent outcomes.
    pub fn recent_outcomes(&self, limit: usize) -> Vec<ProcessingOutcome> {
        self.registry.recent_outcomes(limit)
    }

    pub fn error_summary(&self) -> IndexMap<String, ErrorRecord> {
        self.registry.error_summary()
    }

    /// Tear down without waiting. Used when an async stop is impossible.
    fn abort(&self) {
        let Ok(mut guard) = self.running.try_lock() else {
            return;
        };
        if let Some(running) = guard.take() {
            self.bridge.close();
            running.cancel.cancel();
            self.registry.mark_stopped();
            crate::debug_event!("pipeline", "aborted");
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Stops the pipeline if a scoped body unwinds.
struct AbortOnDrop<'a> {
    pipeline: Option<&'a Pipeline>,
}

impl AbortOnDrop<'_> {
    fn disarm(mut self) {
        self.pipeline = None;
    }
}

impl Drop for AbortOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline {
            pipeline.abort();
        }
    }
}

/// Run directory walks and watcher setup on the blocking pool.
async fn off_runtime<T, F>(f: F) -> Result<T, WatchError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| WatchError::InitFailed {
            reason: e.to_string(),
        })
}

/// Record and queue an event for the worker.
fn enqueue(
    registry: &StatusRegistry,
    queue: &mpsc::UnboundedSender<ChangeEvent>,
    event: ChangeEvent,
) -> bool {
    registry.record_event(&event);
    if queue.send(event).is_err() {
        registry.record_dequeued();
        return false;
    }
    true
}

/// Owns the debouncer; runs until cancelled.
struct Intake {
    filter: ChangeFilter,
    debouncer: Debouncer,
    registry: Arc<StatusRegistry>,
    broker: NotificationBroker,
    queue_tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl Intake {
    async fn run(
        mut self,
        mut changes: mpsc::UnboundedReceiver<ChangeEvent>,
        mut expired: mpsc::UnboundedReceiver<Expired>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(token) = expired.recv() => {
                    if let Some(event) = self.debouncer.fire(token) {
                        crate::debug_event!("intake", "debounced", "{}", event.resource_key);
                        enqueue(&self.registry, &self.queue_tx, event);
                    }
                }
                change = changes.recv() => match change {
                    Some(event) => self.accept(event),
                    None => break,
                },
            }
        }

        let discarded = self.debouncer.cancel_all();
        if discarded > 0 {
            crate::debug_event!("intake", "cancelled", "{discarded} pending changes");
        }
    }

    fn accept(&mut self, event: ChangeEvent) {
        if !self.filter.within_root(&event.path) {
            return;
        }
        self.broker
            .publish(Notification::file_change(event.kind, &event.path));

        if !self.filter.matches(&event.path) {
            crate::debug_event!("intake", "ignored", "{}", event.path.display());
            return;
        }
        if self.debouncer.record(event) {
            crate::debug_event!("intake", "superseded pending change");
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("watch_root", &self.config.watch_root)
            .field("generator", &self.generator.name())
            .field("watch_filesystem", &self.watch_filesystem)
            .finish()
    }
}

