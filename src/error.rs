//! Error taxonomy for the cache and pipeline core.
//!
//! Every variant is fatal for the request that raised it; nothing here is
//! retried internally.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Non-finite or missing field in a parameter bundle.
    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    /// A template anchor could not be located.
    #[error("anchor '{anchor}' not found in template {}", path.display())]
    TemplateAnchorNotFound { path: PathBuf, anchor: String },

    /// The edited row or field lies outside the template.
    #[error(
        "field {field} of line {line} is out of range in template {} ({available} available)",
        path.display()
    )]
    TemplateFieldOutOfRange {
        path: PathBuf,
        line: usize,
        field: usize,
        available: usize,
    },

    /// A support file could not be staged into the working directory.
    #[error("failed to stage resource {}: {reason}", path.display())]
    ResourceCopyFailed { path: PathBuf, reason: String },

    /// An external process exited nonzero or did not produce its declared output.
    #[error("external tool '{tool}' failed at stage {stage}: {reason}")]
    ExternalToolFailed {
        stage: usize,
        tool: String,
        reason: String,
    },

    /// Solver output did not match the expected layout.
    #[error("malformed output {} at line {line}: {reason}", path.display())]
    MalformedOutput {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Another writer holds the cache directory.
    #[error("cache directory {} is locked by another writer", path.display())]
    CacheLocked { path: PathBuf },

    /// A stored result file could not be read back.
    #[error("corrupt cache file {}: {reason}", path.display())]
    CorruptCacheFile { path: PathBuf, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedOutput {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    /// Pipeline stage that failed, if this is an external tool failure.
    pub fn stage(&self) -> Option<usize> {
        match self {
            Self::ExternalToolFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
