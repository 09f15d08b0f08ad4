pub mod cli;
pub mod config;
pub mod logging;
pub mod utils;
pub mod watcher;

pub use config::{Settings, WatchConfig};
pub use watcher::{
    ChangeEvent, ChangeKind, Generator, NotificationBroker, Pipeline, ProcessingOutcome,
    StatusSnapshot,
};
