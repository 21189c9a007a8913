//! Daemon configuration.
//!
//! Layers, lowest to highest: built-in defaults, `~/.pulse/daemon.toml`, environment
//! (`PULSE_CONFIG`, `PULSE_PORT`, `PULSE_OUTPUT`), command-line flags.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const CONFIG_DIR: &str = ".pulse";
const CONFIG_FILE: &str = "daemon.toml";
const OUTPUT_FILE: &str = "sessions.json";

pub const ENV_CONFIG: &str = "PULSE_CONFIG";
pub const ENV_PORT: &str = "PULSE_PORT";
pub const ENV_OUTPUT: &str = "PULSE_OUTPUT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("home directory not found")]
    HomeNotFound,

    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub bind_address: String,
    pub port: u16,
    pub output_path: Option<PathBuf>,
    pub quiet_period_secs: u64,
    pub completed_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub broadcast_interval_secs: u64,
    pub orphan_check_interval_secs: u64,
    pub expiry_check_interval_secs: u64,
    pub notify_on_completion: bool,
    pub process_fallback: bool,
    pub process_scan_interval_secs: u64,
    pub window: WindowCommandConfig,
    pub notify: NotifyCommandConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 4318,
            output_path: None,
            quiet_period_secs: 5,
            completed_timeout_secs: 30,
            session_timeout_secs: 1800,
            broadcast_interval_secs: 5,
            orphan_check_interval_secs: 5,
            expiry_check_interval_secs: 60,
            notify_on_completion: false,
            process_fallback: false,
            process_scan_interval_secs: 10,
            window: WindowCommandConfig::default(),
            notify: NotifyCommandConfig::default(),
        }
    }
}

/// External commands used to learn which window has focus and which windows exist.
/// Each command is a program followed by its arguments.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowCommandConfig {
    /// Prints `window_id<TAB>project` for the focused window.
    pub focused_command: Vec<String>,
    /// Prints one live window id per line.
    pub list_command: Vec<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyCommandConfig {
    pub command: Vec<String>,
}

impl DaemonConfig {
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_secs(self.quiet_period_secs)
    }

    pub fn completed_timeout(&self) -> Duration {
        Duration::from_secs(self.completed_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn orphan_check_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_check_interval_secs)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs)
    }

    pub fn process_scan_interval(&self) -> Duration {
        Duration::from_secs(self.process_scan_interval_secs)
    }

    pub fn resolved_output_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.output_path {
            Some(path) => Ok(path.clone()),
            None => default_output_path(),
        }
    }

    /// Zero-length intervals would spin or fire immediately; they fall back to defaults.
    pub fn normalized(mut self) -> Self {
        let defaults = DaemonConfig::default();
        let fields: [(&str, &mut u64, u64); 7] = [
            ("quiet_period_secs", &mut self.quiet_period_secs, defaults.quiet_period_secs),
            (
                "completed_timeout_secs",
                &mut self.completed_timeout_secs,
                defaults.completed_timeout_secs,
            ),
            (
                "session_timeout_secs",
                &mut self.session_timeout_secs,
                defaults.session_timeout_secs,
            ),
            (
                "broadcast_interval_secs",
                &mut self.broadcast_interval_secs,
                defaults.broadcast_interval_secs,
            ),
            (
                "orphan_check_interval_secs",
                &mut self.orphan_check_interval_secs,
                defaults.orphan_check_interval_secs,
            ),
            (
                "expiry_check_interval_secs",
                &mut self.expiry_check_interval_secs,
                defaults.expiry_check_interval_secs,
            ),
            (
                "process_scan_interval_secs",
                &mut self.process_scan_interval_secs,
                defaults.process_scan_interval_secs,
            ),
        ];
        for (name, value, default) in fields {
            if *value == 0 {
                warn!(field = name, default, "Zero duration in config; using default");
                *value = default;
            }
        }
        self
    }
}

/// Values supplied outside the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub output_path: Option<PathBuf>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let port = non_empty(ENV_PORT).and_then(|value| match value.trim().parse::<u16>() {
            Ok(port) => Some(port),
            Err(err) => {
                warn!(value = %value, error = %err, "Ignoring invalid {}", ENV_PORT);
                None
            }
        });

        Self {
            config_path: non_empty(ENV_CONFIG).map(PathBuf::from),
            port,
            output_path: non_empty(ENV_OUTPUT).map(PathBuf::from),
        }
    }

    /// Fields set on `higher` win.
    pub fn overlay(self, higher: Overrides) -> Overrides {
        Overrides {
            config_path: higher.config_path.or(self.config_path),
            port: higher.port.or(self.port),
            output_path: higher.output_path.or(self.output_path),
        }
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(CONFIG_DIR).join(CONFIG_FILE))
}

pub fn default_output_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
    Ok(home.join(CONFIG_DIR).join(OUTPUT_FILE))
}

/// A missing file is not an error; it means "all defaults".
pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    if !path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the file named by the overrides (or the default path) and applies the overrides.
/// Never fails: an unreadable or malformed file is logged and replaced by defaults.
pub fn resolve(overrides: &Overrides) -> DaemonConfig {
    let path = match &overrides.config_path {
        Some(path) => Some(path.clone()),
        None => match default_config_path() {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %err, "Failed to resolve config path; using defaults");
                None
            }
        },
    };

    let mut config = match path {
        Some(path) => match load_config(&path) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "Failed to load config; using defaults");
                DaemonConfig::default()
            }
        },
        None => DaemonConfig::default(),
    };

    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(output) = &overrides.output_path {
        config.output_path = Some(output.clone());
    }
    config.normalized()
}
