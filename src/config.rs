//! Aggregated configuration.
//!
//! Every component receives its slice of [`RalphConfig`] at construction;
//! nothing reads configuration from globals. Values are layered as
//! defaults, then `.ralph/config.toml`, then `RALPH__*` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::agent::AgentCommandConfig;
use crate::checkpoint::CheckpointConfig;
use crate::complexity::ComplexityConfig;
use crate::daemon::DaemonConfig;
use crate::engine::EngineConfig;
use crate::error::{RalphError, Result};
use crate::lock::LockConfig;
use crate::parallel::CoordinatorConfig;
use crate::quality::GateCommandConfig;
use crate::timeout::TimeoutConfig;

/// Directory holding all orchestrator state inside a project.
pub const STATE_DIR_NAME: &str = ".ralph";
/// Config file name inside [`STATE_DIR_NAME`].
pub const CONFIG_FILE_NAME: &str = "config.toml";
/// Environment variable prefix; nesting uses a double underscore.
pub const ENV_PREFIX: &str = "RALPH";

/// Top-level configuration passed into every component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RalphConfig {
    pub engine: EngineConfig,
    pub checkpoint: CheckpointConfig,
    pub coordinator: CoordinatorConfig,
    pub complexity: ComplexityConfig,
    pub daemon: DaemonConfig,
    pub lock: LockConfig,
    pub timeout: TimeoutConfig,
    pub agent: AgentCommandConfig,
    pub gates: GateCommandConfig,
}

impl RalphConfig {
    /// Load configuration for a project rooted at `project_root`.
    pub fn load(project_root: &Path) -> Result<Self> {
        Self::load_from(&config_path(project_root))
    }

    /// Load configuration from an explicit file path (missing file is fine).
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| RalphError::Config(e.to_string()))?;

        let config: RalphConfig = settings
            .try_deserialize()
            .map_err(|e| RalphError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make components misbehave.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=10.0).contains(&self.complexity.threshold) {
            return Err(RalphError::Config(format!(
                "complexity.threshold must be within 0..=10, got {}",
                self.complexity.threshold
            )));
        }
        if self.coordinator.max_concurrency == 0 {
            return Err(RalphError::Config(
                "coordinator.max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.daemon.workers == 0 {
            return Err(RalphError::Config(
                "daemon.workers must be at least 1".to_string(),
            ));
        }
        if self.engine.max_iterations == 0 {
            return Err(RalphError::Config(
                "engine.max_iterations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Render this configuration as TOML (used by `ralph init-config`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RalphError::Config(e.to_string()))
    }
}

/// Path of the project config file.
pub fn config_path(project_root: &Path) -> PathBuf {
    state_dir(project_root).join(CONFIG_FILE_NAME)
}

/// Path of the `.ralph` state directory.
pub fn state_dir(project_root: &Path) -> PathBuf {
    project_root.join(STATE_DIR_NAME)
}

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
