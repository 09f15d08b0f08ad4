//! Tracing setup for the watch pipeline.
//!
//! Output goes to stderr so `docwatch watch --events` can keep stdout for
//! notification frames. Levels come from the `[logging]` table:
//!
//! ```toml
//! [logging]
//! default = "warn"
//!
//! [logging.modules]
//! "docwatch::watcher" = "debug"
//! ```
//!
//! A set `RUST_LOG` replaces the table entirely, e.g.
//! `RUST_LOG=docwatch::watcher=trace docwatch watch -- pydoc-md`.

use std::sync::Once;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Wall-clock time of day with milliseconds, e.g. `14:03:07.512`.
struct ClockTime;

impl FormatTime for ClockTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%H:%M:%S%.3f"))
    }
}

/// Render `[logging]` as an `EnvFilter` directive list.
///
/// Module overrides are sorted so the directive string is stable.
fn directives(config: &LoggingConfig) -> String {
    let mut overrides: Vec<(&String, &String)> = config.modules.iter().collect();
    overrides.sort();

    overrides
        .into_iter()
        .fold(config.default.clone(), |mut acc, (target, level)| {
            acc.push(',');
            acc.push_str(target);
            acc.push('=');
            acc.push_str(level);
            acc
        })
}

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) if !value.trim().is_empty() => EnvFilter::new(value),
        _ => EnvFilter::new(directives(config)),
    }
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_with_config(config: &LoggingConfig) {
    INIT.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_timer(ClockTime)
            .with_target(true)
            .with_filter(env_filter(config));

        // A subscriber installed by an embedding application wins.
        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
}

/// Install the subscriber with the quiet default (`warn`).
pub fn init() {
    init_with_config(&LoggingConfig::default());
}

/// Info-level event tagged with the pipeline component that emitted it.
///
/// ```ignore
/// log_event!("worker", "generated", "{}", path.display());
/// log_event!("pipeline", "started");
/// ```
#[macro_export]
macro_rules! log_event {
    ($component:expr, $event:expr) => {
        tracing::info!(component = $component, "[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::info!(
            component = $component,
            "[{}] {}: {}",
            $component,
            $event,
            format!($($arg)*)
        )
    };
}

/// Debug-level counterpart of [`log_event!`].
#[macro_export]
macro_rules! debug_event {
    ($component:expr, $event:expr) => {
        tracing::debug!(component = $component, "[{}] {}", $component, $event)
    };
    ($component:expr, $event:expr, $($arg:tt)*) => {
        tracing::debug!(
            component = $component,
            "[{}] {}: {}",
            $component,
            $event,
            format!($($arg)*)
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_directives_default_only() {
        assert_eq!(directives(&LoggingConfig::default()), "warn");
    }

    #[test]
    fn test_directives_sorted_overrides() {
        let config = LoggingConfig {
            default: "info".to_string(),
            modules: HashMap::from([
                ("notify".to_string(), "error".to_string()),
                ("docwatch::watcher".to_string(), "debug".to_string()),
            ]),
        };
        assert_eq!(
            directives(&config),
            "info,docwatch::watcher=debug,notify=error"
        );
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_config(&LoggingConfig {
            default: "trace".to_string(),
            modules: HashMap::new(),
        });
        crate::debug_event!("test", "after init");
    }
}
