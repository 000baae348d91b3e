//! Settings error types.

use std::path::PathBuf;

use thiserror::Error;

/// Why a node's settings could not be loaded or were rejected.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("cannot read settings file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// `key` is the camelCase path of the offending setting.
    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl SettingsError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }

    /// The offending key for validation failures.
    pub fn key(&self) -> Option<&'static str> {
        match self {
            Self::Invalid { key, .. } => Some(key),
            Self::Read { .. } | Self::Json(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SettingsError>;
