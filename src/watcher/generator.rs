//! Generator trait and a command-backed implementation.
//!
//! The pipeline does not know how artifacts are produced. It hands each
//! debounced event to a [`Generator`] and, when generation succeeds, asks the
//! same generator to persist the result.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::ConfigError;

use super::error::GenerateError;
use super::event::{ChangeEvent, ChangeKind};

/// Result of one generator invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub payload: String,
    /// `false` is treated exactly like an error by the worker.
    pub success: bool,
}

impl Generation {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            success: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            payload: String::new(),
            success: false,
        }
    }
}

/// Produces and persists the artifact for a changed resource.
///
/// Implementations may be slow; the worker never runs two invocations at
/// once.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generator name for logging.
    fn name(&self) -> &str;

    /// Produce the artifact for `event`.
    async fn generate(&self, event: &ChangeEvent) -> Result<Generation, GenerateError>;

    /// Persist a successful generation. Returns a reference to the output
    /// (usually a path), if one exists.
    async fn write(
        &self,
        event: &ChangeEvent,
        generation: &Generation,
    ) -> Result<Option<String>, GenerateError>;
}

/// Runs an external command per file and writes its stdout to the output root.
///
/// The command is invoked as `<program> <args...> <source path>`. A non-zero
/// exit status is a failed attempt. Deleted sources remove their output.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    output_root: PathBuf,
    extension: String,
}

impl CommandGenerator {
    pub fn new(
        command: Vec<String>,
        output_root: impl Into<PathBuf>,
        extension: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let mut parts = command.into_iter();
        let program = parts.next().ok_or(ConfigError::EmptyCommand)?;

        Ok(Self {
            program,
            args: parts.collect(),
            output_root: output_root.into(),
            extension: extension.into(),
        })
    }

    /// Output file for a source: `<output_root>/<stem>.<extension>`.
    pub fn output_path(&self, source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "index".to_string());
        self.output_root.join(format!("{stem}.{}", self.extension))
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    fn name(&self) -> &str {
        "command"
    }

    async fn generate(&self, event: &ChangeEvent) -> Result<Generation, GenerateError> {
        if event.kind == ChangeKind::Deleted {
            return Ok(Generation::ok(String::new()));
        }

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&event.path)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| GenerateError::Io {
                path: PathBuf::from(&self.program),
                source,
            })?;

        if !output.status.success() {
            return Err(GenerateError::Command {
                command: self.command_line(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(Generation::ok(String::from_utf8_lossy(&output.stdout)))
    }

    async fn write(
        &self,
        event: &ChangeEvent,
        generation: &Generation,
    ) -> Result<Option<String>, GenerateError> {
        let output_path = self.output_path(&event.path);

        if event.kind == ChangeKind::Deleted {
            return match tokio::fs::remove_file(&output_path).await {
                Ok(()) => Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(GenerateError::Io {
                    path: output_path,
                    source,
                }),
            };
        }

        tokio::fs::create_dir_all(&self.output_root)
            .await
            .map_err(|source| GenerateError::Io {
                path: self.output_root.clone(),
                source,
            })?;
        tokio::fs::write(&output_path, &generation.payload)
            .await
            .map_err(|source| GenerateError::Io {
                path: output_path.clone(),
                source,
            })?;

        Ok(Some(output_path.display().to_string()))
    }
}
