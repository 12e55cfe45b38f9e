//! Configuration error types

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Merging the layered sources failed, or the merged tree does not
    /// deserialize into [`crate::RaConfig`].
    #[error("failed to merge configuration sources: {0}")]
    Merge(#[from] config::ConfigError),

    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("no user configuration directory on this platform")]
    NoUserConfigDir,
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
