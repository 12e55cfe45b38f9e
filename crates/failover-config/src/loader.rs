//! Configuration loader with multi-source merging

use crate::paths::Layer;
use crate::{ConfigError, Paths, RaConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "FAILOVER".to_string(),
            include_user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "FAILOVER")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip the per-user config file.
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    fn paths(&self) -> Paths {
        let paths = Paths::discover(&self.project_dir);
        if self.include_user_config {
            paths
        } else {
            paths.without_user_dir()
        }
    }

    /// Files that [`Self::load`] will merge, lowest precedence first.
    pub fn layers(&self) -> Vec<(Layer, PathBuf)> {
        self.paths().existing_layers()
    }

    /// Merges defaults, the file layers and the environment, then validates.
    pub fn load(self) -> Result<RaConfig, ConfigError> {
        let defaults = RaConfig::default();
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);

        for (_, file) in self.layers() {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // FAILOVER_TIMING__MESSAGE_RETRY_INTERVAL_MS=...
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let ra_config: RaConfig = builder.build()?.try_deserialize()?;
        ra_config.validate()?;
        Ok(ra_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> RaConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
