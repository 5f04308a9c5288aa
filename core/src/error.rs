use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Failure taxonomy for the history engine. Capture extraction failures
/// never cross a component boundary (the monitor logs and skips the tick),
/// so they have no variant here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store failure: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid snapshot: {0}")]
    ImportValidation(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("corrupt history row: {0}")]
    InvalidData(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl EngineError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
