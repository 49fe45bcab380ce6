//! Structured error types for probe runs.
//!
//! Every error is scoped to one fixture: a batch never aborts because a
//! single fixture failed to parse, resolve or talk to its backend.

use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Structured error type for a fixture run.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("cannot resolve annotation at line {line}: {reason}")]
    Resolution { line: usize, reason: String },

    #[error("unsupported directive `{keyword}` at line {line}")]
    UnsupportedDirective { line: usize, keyword: String },

    #[error("backend not ready after {timeout:?}")]
    BackendNotReady { timeout: Duration },

    #[error("backend communication failed: {reason}")]
    BackendCommunication { reason: String },

    #[error("run cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Serializable classification of a [`ProbeError`], used by reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    Resolution,
    UnsupportedDirective,
    BackendNotReady,
    BackendCommunication,
    Cancelled,
    Io,
}

impl ProbeError {
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Self::Parse {
            line,
            reason: reason.into(),
        }
    }

    pub fn resolution(line: usize, reason: impl Into<String>) -> Self {
        Self::Resolution {
            line,
            reason: reason.into(),
        }
    }

    pub fn backend(reason: impl std::fmt::Display) -> Self {
        Self::BackendCommunication {
            reason: reason.to_string(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Resolution { .. } => ErrorKind::Resolution,
            Self::UnsupportedDirective { .. } => ErrorKind::UnsupportedDirective,
            Self::BackendNotReady { .. } => ErrorKind::BackendNotReady,
            Self::BackendCommunication { .. } => ErrorKind::BackendCommunication,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Io { .. } => ErrorKind::Io,
        }
    }

    /// One-based fixture line the error points at, when it has one.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Parse { line, .. }
            | Self::Resolution { line, .. }
            | Self::UnsupportedDirective { line, .. } => Some(*line),
            _ => None,
        }
    }
}

/// Release and discovery paths keep going after a failure. The failure is
/// logged with what was being attempted and the value dropped, so it never
/// replaces the fixture outcome that is already decided.
pub trait BestEffort<T> {
    fn best_effort(self, action: &str) -> Option<T>;
}

impl<T, E: std::fmt::Display> BestEffort<T> for Result<T, E> {
    fn best_effort(self, action: &str) -> Option<T> {
        self.map_err(|e| warn!(action, error = %e, "Continuing after failure"))
            .ok()
    }
}
