//! Settings file management

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Also write daily rolling log files under `<base_dir>/logs`
    #[serde(default = "default_true")]
    pub log_to_file: bool,

    /// Storage root. Defaults to the platform location.
    #[serde(default)]
    pub base_dir: Option<String>,

    /// Host used in public URLs
    #[serde(default = "default_public_host")]
    pub public_host: String,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub ports: PortSettings,

    #[serde(default)]
    pub container: ContainerSettings,

    #[serde(default)]
    pub janitor: JanitorSettings,
}

fn default_true() -> bool {
    true
}

fn default_public_host() -> String {
    "localhost".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: true,
            base_dir: None,
            public_host: default_public_host(),
            server: ServerSettings::default(),
            ports: PortSettings::default(),
            container: ContainerSettings::default(),
            janitor: JanitorSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from `file`. A missing file means defaults.
    pub async fn load(file: &File) -> Result<Self, EngineError> {
        if !file.exists().await {
            info!("No settings at {}, using defaults", file.path().display());
            return Ok(Self::default());
        }
        file.read_json().await.map_err(|e| {
            EngineError::ConfigError(format!(
                "Invalid settings file {}: {}",
                file.path().display(),
                e
            ))
        })
    }
}

/// HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Largest accepted archive upload
    #[serde(default = "default_max_archive_mb")]
    pub max_archive_mb: usize,

    /// Allow cross-origin requests
    #[serde(default)]
    pub cors: bool,
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8000
}

fn default_max_archive_mb() -> usize {
    100
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            max_archive_mb: default_max_archive_mb(),
            cors: false,
        }
    }
}

/// Host port pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSettings {
    /// First port of the pool
    #[serde(default = "default_port_start")]
    pub start: u16,

    /// End of the pool, exclusive
    #[serde(default = "default_port_end")]
    pub end: u16,

    #[serde(default = "default_reservation_ttl")]
    pub reservation_ttl_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

fn default_port_start() -> u16 {
    3000
}

fn default_port_end() -> u16 {
    4000
}

fn default_reservation_ttl() -> u64 {
    15 * 60
}

fn default_probe_timeout() -> u64 {
    250
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            start: default_port_start(),
            end: default_port_end(),
            reservation_ttl_secs: default_reservation_ttl(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

/// Container runtime settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    #[serde(default = "default_git_bin")]
    pub git_bin: String,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: u64,

    /// Share of one CPU core
    #[serde(default = "default_cpu_fraction")]
    pub cpu_fraction: f64,

    /// Wait before checking a fresh container is still running
    #[serde(default = "default_start_grace")]
    pub start_grace_ms: u64,
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_git_bin() -> String {
    "git".to_string()
}

fn default_memory_mb() -> u64 {
    512
}

fn default_cpu_fraction() -> f64 {
    0.5
}

fn default_start_grace() -> u64 {
    2000
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            docker_bin: default_docker_bin(),
            git_bin: default_git_bin(),
            memory_mb: default_memory_mb(),
            cpu_fraction: default_cpu_fraction(),
            start_grace_ms: default_start_grace(),
        }
    }
}

/// Stale artifact cleanup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_janitor_interval")]
    pub interval_secs: u64,

    /// Artifacts older than this are removed
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_janitor_interval() -> u64 {
    10 * 60
}

fn default_max_age() -> u64 {
    6 * 60 * 60
}

impl Default for JanitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_janitor_interval(),
            max_age_secs: default_max_age(),
        }
    }
}
