use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building a generation profile.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile I/O error for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("profile file {0} is empty")]
    EmptyFile(PathBuf),

    #[error("column '{column}' not found in header of {path}")]
    MissingColumn { column: String, path: PathBuf },

    #[error("profile '{label}' has no valid samples ({skipped} rows skipped)")]
    NoValidSamples { label: String, skipped: usize },
}
