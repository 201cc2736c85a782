//! Error types for docker-forensics

use std::path::PathBuf;
use thiserror::Error;

/// Result type for forensics operations
pub type Result<T> = std::result::Result<T, ForensicsError>;

/// Errors that abort the reconstruction of a single image.
///
/// Problems scoped to one layer or one file are not errors: they are
/// collected as [`crate::report::Issue`] values in the run summary.
#[derive(Error, Debug)]
pub enum ForensicsError {
    #[error("Docker root not found under {0}")]
    DockerRootNotFound(PathBuf),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Image ID {id} is ambiguous, matches: {}", candidates.join(", "))]
    Ambiguous { id: String, candidates: Vec<String> },

    #[error("Malformed image metadata in {path}: {message}")]
    MalformedMetadata { path: PathBuf, message: String },

    #[error("Failed to write {path}: {source}")]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Refusing to write inside the evidence mount: {0}")]
    EvidenceWrite(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ForensicsError {
    /// Wrap an output-side IO failure with the path being written
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ForensicsError::WriteError {
            path: path.into(),
            source,
        }
    }

    /// True when the image could not be resolved in the metadata store at all
    pub fn is_lookup_failure(&self) -> bool {
        matches!(
            self,
            ForensicsError::DockerRootNotFound(_)
                | ForensicsError::NotFound(_)
                | ForensicsError::Ambiguous { .. }
                | ForensicsError::MalformedMetadata { .. }
        )
    }
}
