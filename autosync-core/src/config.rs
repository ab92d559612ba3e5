//! YAML service configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.autosync/
//!   config.yaml   (settings + one entry per managed agent: mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function has two forms:
//! - `fn_at(home: &Path, …)`: explicit home; used in tests with `TempDir`
//! - `fn(…)`: derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! Tests must NEVER call the no-arg wrappers; always use `_at`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};
use crate::settings::Settings;
use crate::types::ControllerConfiguration;

/// Root of the service configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub agents: Vec<ControllerConfiguration>,
}

impl ServiceConfig {
    /// Configuration for `agent_name` (case-insensitive).
    pub fn agent(&self, agent_name: &str) -> Option<&ControllerConfiguration> {
        self.agents
            .iter()
            .find(|a| a.agent_name.eq_ignore_ascii_case(agent_name))
    }

    /// Reject documents the controllers cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for agent in &self.agents {
            let name = agent.agent_name.trim();
            if name.is_empty() {
                return Err(ConfigError::Invalid("agent with empty name".to_string()));
            }
            if !names.insert(name.to_ascii_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "agent '{name}' is configured more than once"
                )));
            }

            let mut partitions = HashSet::new();
            for partition in &agent.partitions {
                if !partitions.insert(partition.id) {
                    return Err(ConfigError::Invalid(format!(
                        "agent '{name}' lists partition {} more than once",
                        partition.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.autosync/`: pure, no I/O.
pub fn config_dir_at(home: &Path) -> PathBuf {
    home.join(".autosync")
}

/// `<home>/.autosync/config.yaml`: pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    config_dir_at(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// 2. Load
// ---------------------------------------------------------------------------

/// Load and validate `<home>/.autosync/config.yaml`.
///
/// Returns `ConfigError::ConfigNotFound` if absent,
/// `ConfigError::Parse` (with path + line context) if malformed YAML,
/// `ConfigError::Invalid` if the document fails validation.
pub fn load_at(home: &Path) -> Result<ServiceConfig, ConfigError> {
    load_file(&config_path_at(home))
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<ServiceConfig, ConfigError> {
    load_at(&home()?)
}

/// Load and validate a configuration document from an arbitrary path.
pub fn load_file(path: &Path) -> Result<ServiceConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let config: ServiceConfig =
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// 3. Save (atomic)
// ---------------------------------------------------------------------------

/// Atomically save the configuration to `<home>/.autosync/config.yaml`.
///
/// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &ServiceConfig) -> Result<(), ConfigError> {
    config.validate()?;

    let dir = config_dir_at(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        set_dir_permissions(&dir)?;
    }

    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml).map_err(|e| io_err(&tmp_path, e))?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// `save_at` convenience wrapper.
pub fn save(config: &ServiceConfig) -> Result<(), ConfigError> {
    save_at(&home()?, config)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::types::{PartitionConfiguration, PartitionId};

    fn make_home() -> TempDir {
        TempDir::new().expect("tempdir")
    }

    #[test]
    fn config_path_is_correct() {
        let home = make_home();
        let path = config_path_at(home.path());
        assert!(path.ends_with(".autosync/config.yaml"));
    }

    #[test]
    fn save_and_load_roundtrip_keeps_agents() {
        let home = make_home();
        let mut config = ServiceConfig::default();
        config.agents.push(ControllerConfiguration::new("AD"));
        config.agents.push(ControllerConfiguration::new("HR"));

        save_at(home.path(), &config).expect("save");
        let loaded = load_at(home.path()).expect("load");
        assert_eq!(loaded, config);
        assert!(loaded.agent("ad").is_some());
    }

    #[test]
    fn load_missing_config_returns_not_found() {
        let home = make_home();
        let err = load_at(home.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ConfigNotFound { .. }));
    }

    #[test]
    fn duplicate_agent_names_are_rejected() {
        let mut config = ServiceConfig::default();
        config.agents.push(ControllerConfiguration::new("AD"));
        config.agents.push(ControllerConfiguration::new("ad"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"), "got: {err}");
    }

    #[test]
    fn duplicate_partition_ids_are_rejected() {
        let mut agent = ControllerConfiguration::new("AD");
        let id = PartitionId::new_v4();
        agent.partitions.push(PartitionConfiguration::new(id, "one"));
        agent.partitions.push(PartitionConfiguration::new(id, "two"));
        let config = ServiceConfig {
            agents: vec![agent],
            ..ServiceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(ConfigError::HomeNotFound.to_string().contains("home directory"));
    }
}
