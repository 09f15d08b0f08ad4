//! Change-detection and notification pipeline.
//!
//! Watches a directory of source files and regenerates an artifact once per
//! burst of changes to a file, retrying bounded failures, while broadcasting
//! live status to any number of observers.
//!
//! # Architecture
//!
//! ```text
//! FsChangeSource (notify thread)
//!        |
//!    EventBridge            the only cross-thread hand-off
//!        |
//!   intake task: ChangeFilter -> Debouncer
//!        |
//!   worker task: Worker -> Generator
//!        |
//!  StatusRegistry + NotificationBroker
//! ```

mod bridge;
mod broker;
mod debouncer;
mod error;
mod event;
mod generator;
mod pipeline;
mod source;
mod status;
mod worker;

pub use bridge::EventBridge;
pub use broker::{
    Connection, ConnectionInfo, Notification, NotificationBroker, NotificationType,
    PushTransport, Subscription,
};
pub use debouncer::{Debouncer, Expired};
pub use error::{DeliveryError, GenerateError, WatchError};
pub use event::{ChangeEvent, ChangeKind, ProcessingOutcome, resource_key};
pub use generator::{CommandGenerator, Generation, Generator};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use source::{ChangeFilter, FsChangeSource, classify};
pub use status::{Counters, ErrorRecord, HistoryBuffer, StatusRegistry, StatusSnapshot};
pub use worker::{CallbackHandle, OutcomeCallbacks, RetryPolicy, Worker};
