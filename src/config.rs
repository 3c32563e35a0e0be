//! Configuration management for ransomwatch

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Detection policy constants
    #[serde(default)]
    pub detection: DetectionConfig,

    /// Initial command-line trust set
    #[serde(default)]
    pub whitelist: WhitelistConfig,

    /// Tracer subprocess configuration
    #[serde(default)]
    pub tracer: TracerConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Detection policy constants. The ratio divisor and both windows are
/// tunable policy, not structural invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// A terminal event matches only when the pid's cumulative write
    /// volume is at least `total_read / write_read_divisor`.
    #[serde(default = "default_write_read_divisor")]
    pub write_read_divisor: u64,

    /// Profiles idle longer than this many seconds are reaped once their
    /// pid is confirmed dead.
    #[serde(default = "default_obsolescence_secs")]
    pub obsolescence_secs: u64,

    /// Reaper pass period in seconds.
    #[serde(default = "default_reap_period_secs")]
    pub reap_period_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            write_read_divisor: default_write_read_divisor(),
            obsolescence_secs: default_obsolescence_secs(),
            reap_period_secs: default_reap_period_secs(),
        }
    }
}

/// Initial whitelist loaded at startup. Entries are exact-match command
/// lines; additions from runtime allow decisions are not written back.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WhitelistConfig {
    #[serde(default)]
    pub cmdlines: Vec<String>,
}

/// Tracer subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracerConfig {
    /// Command spawning the external tracer. Its stdout must carry one
    /// JSON activity record per line with absolute paths, and it should
    /// already exclude the daemon's own pid.
    #[serde(default = "default_tracer_command")]
    pub command: Vec<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            command: default_tracer_command(),
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// PID file path
    #[serde(default = "default_pid_path")]
    pub pid_file: PathBuf,

    /// Socket path for IPC
    #[serde(default = "default_socket_path")]
    pub socket: PathBuf,

    /// Log file path
    #[serde(default = "default_log_path")]
    pub log_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_path(),
            socket: default_socket_path(),
            log_file: default_log_path(),
        }
    }
}

// Default value functions for serde

fn default_write_read_divisor() -> u64 {
    2
}

fn default_obsolescence_secs() -> u64 {
    10
}

fn default_reap_period_secs() -> u64 {
    2
}

fn default_tracer_command() -> Vec<String> {
    vec!["/usr/libexec/ransomwatch-tracer".to_string()]
}

fn default_pid_path() -> PathBuf {
    PathBuf::from("/run/ransomwatch.pid")
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/ransomwatch.sock")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/ransomwatch.log")
}
