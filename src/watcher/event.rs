//! Change events flowing through the pipeline and their terminal outcomes.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Kind of filesystem change reported by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Moved,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Moved => "moved",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change to one resource.
///
/// A fresher event for the same key replaces this one while it is still
/// pending in the debouncer; nothing is merged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// Identity used for coalescing and error tracking.
    pub resource_key: String,
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Seconds since UNIX_EPOCH when the change was observed.
    pub timestamp: f64,
    /// Zero-based attempt counter, bumped on every retry.
    pub attempt: u32,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind, timestamp: f64) -> Self {
        let path = path.into();
        Self {
            resource_key: resource_key(&path),
            path,
            kind,
            timestamp,
            attempt: 0,
        }
    }

    /// File name for log lines and notification payloads.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.resource_key.clone())
    }
}

/// Resource key for a path.
pub fn resource_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Terminal result for one change event. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingOutcome {
    pub resource_key: String,
    pub success: bool,
    pub output_ref: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: f64,
    pub retry_count: u32,
}

impl ProcessingOutcome {
    pub fn succeeded(
        event: &ChangeEvent,
        output_ref: Option<String>,
        duration_ms: f64,
    ) -> Self {
        Self {
            resource_key: event.resource_key.clone(),
            success: true,
            output_ref,
            error_message: None,
            duration_ms,
            retry_count: event.attempt,
        }
    }

    pub fn failed(event: &ChangeEvent, error_message: String, duration_ms: f64) -> Self {
        Self {
            resource_key: event.resource_key.clone(),
            success: false,
            output_ref: None,
            error_message: Some(error_message),
            duration_ms,
            retry_count: event.attempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_key_follows_path() {
        let event = ChangeEvent::new("/apps/lights.py", ChangeKind::Modified, 10.0);
        assert_eq!(event.resource_key, "/apps/lights.py");
        assert_eq!(event.file_name(), "lights.py");
        assert_eq!(event.attempt, 0);
    }

    #[test]
    fn test_outcome_carries_attempt_as_retry_count() {
        let mut event = ChangeEvent::new("a.py", ChangeKind::Created, 1.0);
        event.attempt = 2;

        let ok = ProcessingOutcome::succeeded(&event, Some("docs/a.md".into()), 5.0);
        assert!(ok.success);
        assert_eq!(ok.retry_count, 2);
        assert!(ok.error_message.is_none());

        let failed = ProcessingOutcome::failed(&event, "boom".into(), 5.0);
        assert!(!failed.success);
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert!(failed.output_ref.is_none());
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ChangeKind::Moved).unwrap();
        assert_eq!(json, "\"moved\"");
        assert_eq!(ChangeKind::Deleted.to_string(), "deleted");
    }
}
