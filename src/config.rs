// ABOUTME: Configuration loading: ~/.execbox/config.toml with serde defaults for every section
// EXECBOX_CONFIG overrides the path; a missing file yields the default configuration

use crate::capabilities::MissingRootPolicy;
use crate::sandbox::IsolationMode;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_ENV: &str = "EXECBOX_CONFIG";
const CONFIG_DIR: &str = ".execbox";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not determine a home directory for configuration or data")]
    NoHome,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Root for all persistent state (sessions, workspaces). Defaults to the
    /// platform data dir, e.g. `~/.local/share/execbox` on Linux.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(default)]
    pub isolation: IsolationConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IsolationConfig {
    #[serde(default)]
    pub mode: IsolationMode,

    /// Permit unsandboxed execution when namespace isolation is unavailable.
    /// Off by default; flipping it on is an explicit operator decision.
    #[serde(default)]
    pub allow_fallback: bool,

    /// Extra host directories exposed read-only in every sandbox, for
    /// site-local interpreter installs.
    #[serde(default)]
    pub extra_ro_binds: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Per-output cap on rendered text before the driver truncates it.
    #[serde(default = "default_max_text_bytes")]
    pub max_text_bytes: usize,

    /// Row cap for tabular output; anything longer is marked truncated.
    #[serde(default = "default_table_max_rows")]
    pub table_max_rows: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            python_bin: default_python_bin(),
            default_timeout_secs: default_timeout_secs(),
            max_text_bytes: default_max_text_bytes(),
            table_max_rows: default_table_max_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatewayConfig {
    /// Destinations sessions under restricted networking may reach:
    /// `host`, `host:port`, or `*.domain`. Empty means deny everything.
    #[serde(default)]
    pub allow: Vec<String>,

    /// Optional TCP listen address for operating the gateway as a shared
    /// proxy; per-session unix sockets are always available regardless.
    #[serde(default)]
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapabilitiesConfig {
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    #[serde(default)]
    pub on_missing: MissingRootPolicy,
}

impl AppConfig {
    /// Loads from `$EXECBOX_CONFIG` if set, else `~/.execbox/config.toml`.
    /// A missing file is not an error; every field has a default.
    pub fn load() -> Result<Self, ConfigError> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => dirs::home_dir()
                .ok_or(ConfigError::NoHome)?
                .join(CONFIG_DIR)
                .join(CONFIG_FILE),
        };
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        ProjectDirs::from("", "", "execbox")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or(ConfigError::NoHome)
    }

    pub fn sessions_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("sessions"))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.execution.default_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session.idle_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.session.cleanup_interval_secs)
    }
}

fn default_python_bin() -> String {
    "python3".to_string()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_text_bytes() -> usize {
    64 * 1024
}

fn default_table_max_rows() -> usize {
    50
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    5 * 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_a_file() {
        let config = AppConfig::default();
        assert_eq!(config.isolation.mode, IsolationMode::Auto);
        assert!(!config.isolation.allow_fallback);
        assert_eq!(config.execution.python_bin, "python3");
        assert_eq!(config.default_timeout(), Duration::from_secs(120));
        assert_eq!(config.idle_timeout(), Duration::from_secs(1800));
        assert!(config.gateway.allow.is_empty());
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/execbox"

[isolation]
allow_fallback = true

[gateway]
allow = ["api.github.com", "*.internal.example.com:443"]

[capabilities]
roots = ["/opt/execbox/capabilities"]
on_missing = "degrade"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.data_dir().unwrap(), PathBuf::from("/var/lib/execbox"));
        assert_eq!(
            config.sessions_dir().unwrap(),
            PathBuf::from("/var/lib/execbox/sessions")
        );
        assert!(config.isolation.allow_fallback);
        assert_eq!(config.isolation.mode, IsolationMode::Auto);
        assert_eq!(config.gateway.allow.len(), 2);
        assert_eq!(
            config.capabilities.on_missing,
            MissingRootPolicy::Degrade
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.execution.table_max_rows, 50);
    }

    #[test]
    fn test_unparseable_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "isolation = 5").unwrap();
        assert!(matches!(
            AppConfig::load_from(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_isolation_mode_names() {
        let config: AppConfig =
            toml::from_str("[isolation]\nmode = \"namespace\"").unwrap();
        assert_eq!(config.isolation.mode, IsolationMode::Namespace);
        let config: AppConfig = toml::from_str("[isolation]\nmode = \"none\"").unwrap();
        assert_eq!(config.isolation.mode, IsolationMode::None);
    }
}
