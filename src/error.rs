//! Error Types

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn engine for instance {instance}: {source}")]
    Spawn {
        instance: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Unreadable snapshot {path}: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    #[error("Invalid configuration in {source_name}: {reason}")]
    Config { source_name: String, reason: String },
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(source_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            source_name: source_name.into(),
            reason: reason.into(),
        }
    }
}

/// Registry conflicts reported by [`crate::Orchestrator::create_instance`].
///
/// These are expected caller-facing outcomes, not failures of the supervisor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateError {
    #[error("Instance '{0}' already exists")]
    AlreadyExists(String),

    #[error("Instance limit reached ({max} instances)")]
    LimitReached { max: usize },

    #[error("Invalid instance id '{0}'")]
    InvalidId(String),

    #[error("No free port at or above {start}")]
    PortsExhausted { start: u16 },
}
