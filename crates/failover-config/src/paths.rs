//! Configuration file layers of a node.

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Cluster-wide settings shipped with the deployment.
pub const PROJECT_FILE: &str = "failover.toml";
/// Per-node overrides, kept out of version control.
pub const LOCAL_FILE: &str = "failover.local.toml";
const USER_FILE: &str = "config.toml";

/// A file layer, in increasing precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    User,
    Project,
    Local,
}

/// Where a node looks for its configuration files.
#[derive(Debug, Clone)]
pub struct Paths {
    user_dir: Option<PathBuf>,
    project_dir: PathBuf,
}

impl Paths {
    /// Layers rooted at `project_dir`, plus the platform user directory
    /// (`~/.config/failover` on Linux) when one exists.
    pub fn discover(project_dir: impl AsRef<Path>) -> Self {
        Self {
            user_dir: ProjectDirs::from("io", "Failover", "failover")
                .map(|dirs| dirs.config_dir().to_path_buf()),
            project_dir: project_dir.as_ref().to_path_buf(),
        }
    }

    pub fn without_user_dir(mut self) -> Self {
        self.user_dir = None;
        self
    }

    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        self.user_dir
            .as_ref()
            .map(|dir| dir.join(USER_FILE))
            .ok_or(ConfigError::NoUserConfigDir)
    }

    pub fn file(&self, layer: Layer) -> Option<PathBuf> {
        match layer {
            Layer::User => self.user_config_file().ok(),
            Layer::Project => Some(self.project_dir.join(PROJECT_FILE)),
            Layer::Local => Some(self.project_dir.join(LOCAL_FILE)),
        }
    }

    /// Layers whose file exists, lowest precedence first.
    pub fn existing_layers(&self) -> Vec<(Layer, PathBuf)> {
        [Layer::User, Layer::Project, Layer::Local]
            .into_iter()
            .filter_map(|layer| self.file(layer).map(|path| (layer, path)))
            .filter(|(_, path)| path.is_file())
            .collect()
    }
}
