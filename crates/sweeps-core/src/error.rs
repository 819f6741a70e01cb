use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Fatal to whatever operation asked for the script identity.
    #[error("script unreadable: {}: {source}", path.display())]
    ScriptUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid sweep definition {}: {message}", path.display())]
    InvalidSweep { path: PathBuf, message: String },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error("operation_in_progress: {} is held by another coordinator", .0.display())]
    Locked(PathBuf),
}

impl SweepError {
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        SweepError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn invalid_sweep(path: &Path, message: impl Into<String>) -> Self {
        SweepError::InvalidSweep {
            path: path.to_path_buf(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
