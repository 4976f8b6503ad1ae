//! Application configuration options

use std::time::Duration;

use crate::deploy::docker::ResourceLimits;
use crate::deploy::ports::PortRange;
use crate::deploy::{coordinator, orchestrator, ports};
use crate::errors::EngineError;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::janitor;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Server configuration
    pub server: ServerOptions,

    /// Container runtime binary
    pub docker_bin: String,

    pub git_bin: String,

    /// Port allocator options
    pub ports: ports::Options,

    /// Timeout of the TCP probe run on allocation candidates
    pub probe_timeout: Duration,

    /// Container orchestrator options
    pub orchestrator: orchestrator::Options,

    /// Deployment coordinator options
    pub coordinator: coordinator::Options,

    /// Enable janitor worker
    pub enable_janitor: bool,

    /// Janitor worker options
    pub janitor: janitor::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        let layout = StorageLayout::default();
        Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions::default(),
            docker_bin: "docker".to_string(),
            git_bin: "git".to_string(),
            ports: ports::Options::default(),
            probe_timeout: Duration::from_millis(250),
            orchestrator: orchestrator::Options::default(),
            coordinator: coordinator::Options {
                uploads_dir: layout.uploads_dir().path().to_path_buf(),
                ..Default::default()
            },
            enable_janitor: true,
            janitor: janitor::Options {
                dirs: vec![
                    layout.clones_dir().path().to_path_buf(),
                    layout.uploads_dir().path().to_path_buf(),
                ],
                ..Default::default()
            },
            layout,
        }
    }
}

impl AppOptions {
    /// Build options from a settings file rooted at `layout`
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Result<Self, EngineError> {
        let range = PortRange::new(settings.ports.start, settings.ports.end)?;
        let cpu = settings.container.cpu_fraction;
        if cpu.is_nan() || cpu <= 0.0 {
            return Err(EngineError::ConfigError(format!(
                "cpu_fraction must be positive, got {}",
                settings.container.cpu_fraction
            )));
        }
        let mb = settings.server.max_archive_mb;
        let (max_archive_bytes, max_body_bytes) = mb
            .checked_mul(1024 * 1024)
            .and_then(|bytes| Some((bytes, bytes.checked_add(64 * 1024)?)))
            .ok_or_else(|| EngineError::ConfigError(format!("max_archive_mb too large: {}", mb)))?;

        Ok(Self {
            lifecycle: LifecycleOptions::default(),
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                max_body_bytes,
                cors: settings.server.cors,
            },
            docker_bin: settings.container.docker_bin.clone(),
            git_bin: settings.container.git_bin.clone(),
            ports: ports::Options {
                range,
                reservation_ttl: Duration::from_secs(settings.ports.reservation_ttl_secs),
            },
            probe_timeout: Duration::from_millis(settings.ports.probe_timeout_ms),
            orchestrator: orchestrator::Options {
                limits: ResourceLimits {
                    memory_mb: settings.container.memory_mb,
                    cpu_fraction: settings.container.cpu_fraction,
                },
                start_grace: Duration::from_millis(settings.container.start_grace_ms),
                ..Default::default()
            },
            coordinator: coordinator::Options {
                public_host: settings.public_host.clone(),
                uploads_dir: layout.uploads_dir().path().to_path_buf(),
                max_archive_bytes,
                ..Default::default()
            },
            enable_janitor: settings.janitor.enabled,
            janitor: janitor::Options {
                interval: Duration::from_secs(settings.janitor.interval_secs),
                max_age: Duration::from_secs(settings.janitor.max_age_secs),
                dirs: vec![
                    layout.clones_dir().path().to_path_buf(),
                    layout.uploads_dir().path().to_path_buf(),
                ],
            },
            layout,
        })
    }
}

/// Lifecycle options for the engine
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Request body limit
    pub max_body_bytes: usize,

    /// Permissive CORS
    pub cors: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_body_bytes: 100 * 1024 * 1024 + 64 * 1024,
            cors: false,
        }
    }
}
