use crate::command::{CommandBuilder, Program};
use crate::paths::Paths;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Where group documents live; defaults to `<data>/conf.d`.
    pub config_dir: Option<PathBuf>,
    pub launcher: Program,
    pub limiter: Program,
    pub supervisor: SupervisorSettings,
    pub daemon: DaemonSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorSettings {
    /// How long `stop` waits after SIGTERM before sending SIGKILL.
    pub kill_timeout_ms: u64,
    /// Upper bound for one reachability probe in `status`.
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
    pub watch: bool,
    pub autostart: bool,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_dir: None,
            launcher: Program::autossh(),
            limiter: Program::trickle(),
            supervisor: SupervisorSettings::default(),
            daemon: DaemonSettings::default(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            watch: true,
            autostart: true,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl SupervisorSettings {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings in {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Settings {
    /// Load from `SSHTUNNEL_SETTINGS` or `<data>/settings.toml`. A missing file
    /// means defaults.
    pub fn load(paths: &Paths) -> Result<Self, SettingsError> {
        let path = std::env::var_os("SSHTUNNEL_SETTINGS")
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.settings_file());
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(SettingsError::Io { path, source }),
        };
        Self::parse(&content).map_err(|source| SettingsError::Parse { path, source })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply the `config_dir` override to a path layout.
    pub fn apply(&self, paths: Paths) -> Paths {
        match self.config_dir {
            Some(ref dir) => paths.with_config_dir(dir.clone()),
            None => paths,
        }
    }

    pub fn command_builder(&self) -> CommandBuilder {
        CommandBuilder::new(self.launcher.clone(), self.limiter.clone())
    }
}
