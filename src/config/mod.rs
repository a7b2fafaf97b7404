//! Configuration management for fleetdiag.
//!
//! This module handles loading and saving the settings that drive a
//! diagnostic session: which agent binary to run, where reports go, how
//! remote hosts are reached and how long artifact collection may wait.
//!
//! # Configuration File Location
//!
//! The configuration file is stored at:
//! - Linux: `~/.config/fleetdiag/config.yml`
//! - macOS: `~/Library/Application Support/fleetdiag/config.yml`
//! - Windows: `C:\Users\<User>\AppData\Roaming\fleetdiag\config.yml`
//!
//! # Example Configuration
//!
//! ```yaml
//! tool_path: "azcmagent"
//! report_root: "/var/tmp/agent-diagnostics"
//! remote:
//!   user: "ops"
//!   port: 22
//!   ssh_key: "~/.ssh/id_ed25519"
//!   timeout: 15
//! artifacts:
//!   local_wait_secs: 30
//!   remote_wait_secs: 15
//! execution:
//!   max_parallel_hosts: 4
//!   step_timeout_secs: 900
//!   on_missing_tool: continue
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default agent binary name
const DEFAULT_TOOL_PATH: &str = "azcmagent";

/// Default directory that receives logs and per-host artifact folders
const DEFAULT_REPORT_ROOT: &str = "agent-diagnostics";

/// Default SSH port
const DEFAULT_SSH_PORT: u16 = 22;

/// Default timeout for remote probes in seconds
const DEFAULT_PROBE_TIMEOUT: u64 = 15;

/// Default parent directory for remote staging folders
const DEFAULT_STAGING_ROOT: &str = "/tmp";

/// Main configuration structure for fleetdiag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Path or name of the diagnostic agent binary
    #[serde(default = "default_tool_path")]
    pub tool_path: String,

    /// Directory that receives the consolidated log and host folders
    #[serde(default = "default_report_root")]
    pub report_root: PathBuf,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub artifacts: ArtifactSettings,

    #[serde(default)]
    pub execution: ExecutionSettings,
}

/// How remote hosts are reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteSettings {
    /// SSH user; the current user when absent
    pub user: Option<String>,

    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Path to an SSH private key file
    pub ssh_key: Option<String>,

    /// Probe and connection timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub timeout: u64,

    /// Parent directory for per-run staging folders on the target
    #[serde(default = "default_staging_root")]
    pub staging_root: String,

    /// Extra connection attempts after the first one fails
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

/// Artifact discovery and stabilisation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSettings {
    /// File extensions treated as archives produced by the agent
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Tokens the agent writes instead of the real host name
    #[serde(default = "default_placeholder_tokens")]
    pub placeholder_tokens: Vec<String>,

    #[serde(default = "default_local_wait")]
    pub local_wait_secs: u64,

    #[serde(default = "default_remote_wait")]
    pub remote_wait_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Scheduling and failure policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Per-step timeout; steps may block indefinitely when absent
    pub step_timeout_secs: Option<u64>,

    /// Upper bound on hosts processed at once (1 = sequential)
    #[serde(default = "default_max_parallel")]
    pub max_parallel_hosts: usize,

    #[serde(default)]
    pub on_missing_tool: MissingToolPolicy,
}

/// What to do when the agent binary cannot be located before the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingToolPolicy {
    #[default]
    Abort,
    Continue,
}

fn default_tool_path() -> String {
    DEFAULT_TOOL_PATH.to_string()
}

fn default_report_root() -> PathBuf {
    PathBuf::from(DEFAULT_REPORT_ROOT)
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT
}

fn default_staging_root() -> String {
    DEFAULT_STAGING_ROOT.to_string()
}

fn default_connect_retries() -> u32 {
    2
}

fn default_extensions() -> Vec<String> {
    vec!["zip".to_string(), "tar.gz".to_string(), "tgz".to_string()]
}

fn default_placeholder_tokens() -> Vec<String> {
    vec!["%COMPUTERNAME%".to_string(), "UNKNOWN_HOST".to_string()]
}

fn default_local_wait() -> u64 {
    30
}

fn default_remote_wait() -> u64 {
    15
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_max_parallel() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tool_path: default_tool_path(),
            report_root: default_report_root(),
            remote: RemoteSettings::default(),
            artifacts: ArtifactSettings::default(),
            execution: ExecutionSettings::default(),
        }
    }
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            user: None,
            port: DEFAULT_SSH_PORT,
            ssh_key: None,
            timeout: DEFAULT_PROBE_TIMEOUT,
            staging_root: default_staging_root(),
            connect_retries: default_connect_retries(),
        }
    }
}

impl Default for ArtifactSettings {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            placeholder_tokens: default_placeholder_tokens(),
            local_wait_secs: default_local_wait(),
            remote_wait_secs: default_remote_wait(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: None,
            max_parallel_hosts: default_max_parallel(),
            on_missing_tool: MissingToolPolicy::Abort,
        }
    }
}

impl Config {
    /// Returns the default configuration file path for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("fleetdiag").join("config.yml"))
    }

    /// Loads configuration from the default location.
    ///
    /// Returns `Ok(Config::default())` if no config file exists.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Config::default()),
        }
    }

    /// Loads configuration from a specific file path.
    ///
    /// Returns `Ok(Config::default())` if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to read config file: {}\n\n\
                     File path: {}\n\n\
                     Suggestions:\n\
                     • Check file permissions: ls -la {}\n\
                     • Recreate it with: fleetdiag config init --force",
                    e,
                    path.display(),
                    path.display()
                ),
            ))
        })?;

        let config: Config = serde_yaml::from_str(&contents).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file: {}\n\n\
                 File path: {}\n\n\
                 Suggestions:\n\
                 • Check YAML syntax in the config file\n\
                 • Verify indentation uses spaces, not tabs\n\
                 • Backup and recreate: mv {} {}.bak && fleetdiag config init",
                e,
                path.display(),
                path.display(),
                path.display()
            ))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a specific file path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::Io(std::io::Error::new(
                        e.kind(),
                        format!(
                            "Failed to create config directory {}: {}",
                            parent.display(),
                            e
                        ),
                    ))
                })?;
            }
        }

        let contents = self.to_yaml()?;
        fs::write(path, contents).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to write config file {}: {}", path.display(), e),
            ))
        })?;

        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Rejects values that would make a session meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.tool_path.trim().is_empty() {
            return Err(Error::Config("tool_path must not be empty".to_string()));
        }
        if self.execution.max_parallel_hosts == 0 {
            return Err(Error::Config(
                "execution.max_parallel_hosts must be at least 1".to_string(),
            ));
        }
        if self.artifacts.poll_interval_ms == 0 {
            return Err(Error::Config(
                "artifacts.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.artifacts.extensions.is_empty() {
            return Err(Error::Config(
                "artifacts.extensions must list at least one extension".to_string(),
            ));
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.execution.step_timeout_secs.map(Duration::from_secs)
    }
}

impl RemoteSettings {
    /// Effective login user: configured user or the invoking user.
    pub fn effective_user(&self) -> String {
        self.user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .unwrap_or_else(|| "root".to_string())
    }

    /// Expands the SSH key path, replacing ~ with the home directory.
    pub fn expanded_ssh_key(&self) -> Option<PathBuf> {
        self.ssh_key.as_deref().map(expand_path)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl ArtifactSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn wait_ceiling(&self, is_local: bool) -> Duration {
        if is_local {
            Duration::from_secs(self.local_wait_secs)
        } else {
            Duration::from_secs(self.remote_wait_secs)
        }
    }
}

/// Expands ~ in paths to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
