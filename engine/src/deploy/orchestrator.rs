//! Container orchestration
//!
//! Builds images, starts containers and tears them down again. Any failure
//! after a container object exists rolls back that container and its port
//! before the error is returned.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::deploy::cleanup::CleanupChain;
use crate::deploy::docker::{ContainerRuntime, ContainerState, ResourceLimits, RunSpec};
use crate::deploy::manifest::BuildManifest;
use crate::deploy::ports::PortAllocator;
use crate::errors::EngineError;
use crate::utils::{sanitize_name, short_id};

/// Label carrying the owning deployment id
pub const DEPLOYMENT_LABEL: &str = "zipp.deployment";

/// Number of container log lines kept in start failure diagnostics
const DIAGNOSTIC_LINES: usize = 30;

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct Options {
    pub limits: ResourceLimits,

    /// Wait between starting a container and checking it is still up
    pub start_grace: Duration,

    /// Prefix of generated container names
    pub name_prefix: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            start_grace: Duration::from_secs(2),
            name_prefix: "zipp".to_string(),
        }
    }
}

/// A container that passed its start check
#[derive(Debug, Clone)]
pub struct Launch {
    pub container_id: String,
    pub name: String,
    pub log: Vec<String>,
}

pub struct ContainerOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    ports: Arc<PortAllocator>,
    options: Options,
}

impl ContainerOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, ports: Arc<PortAllocator>, options: Options) -> Self {
        Self {
            runtime,
            ports,
            options,
        }
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Build `image_tag` from the project tree.
    ///
    /// Writes a synthesized build file first when needed. Returns the build
    /// output with each line prefixed `BUILD: `.
    #[instrument(skip(self, manifest), fields(project = %project_path.display()))]
    pub async fn build(
        &self,
        project_path: &Path,
        manifest: &BuildManifest,
        image_tag: &str,
    ) -> Result<Vec<String>, EngineError> {
        manifest
            .materialize(project_path)
            .await
            .map_err(|e| EngineError::BuildFailed(format!("Unable to write build file: {}", e)))?;

        info!("Building image {}", image_tag);
        let output = self
            .runtime
            .build_image(project_path, image_tag)
            .await
            .map_err(|e| match e {
                EngineError::BuildFailed(msg) => EngineError::BuildFailed(msg),
                other => EngineError::BuildFailed(other.to_string()),
            })?;

        info!("Built image {}", image_tag);
        Ok(output.into_iter().map(|l| format!("BUILD: {}", l)).collect())
    }

    /// Start a container from `image_tag` on an already reserved `external_port`.
    ///
    /// On any failure the container, if one was created, is stopped and
    /// removed and `external_port` is released.
    #[instrument(skip(self))]
    pub async fn run(
        &self,
        image_tag: &str,
        internal_port: u16,
        external_port: u16,
        holder: &str,
    ) -> Result<Launch, EngineError> {
        let name = format!(
            "{}_{}_{}",
            self.options.name_prefix,
            sanitize_name(holder, 40),
            short_id()
        );
        let spec = RunSpec {
            image: image_tag.to_string(),
            name: name.clone(),
            internal_port,
            external_port,
            limits: self.options.limits,
            labels: vec![(DEPLOYMENT_LABEL.to_string(), holder.to_string())],
        };

        let mut log = vec![format!(
            "Starting container {} ({} -> {})",
            name, external_port, internal_port
        )];

        let container_id = match self.runtime.run_container(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to create container {}: {}", name, e);
                // the runtime may have created it before failing
                self.rollback(&name, external_port).await;
                return Err(EngineError::ContainerStartFailed(e.to_string()));
            }
        };
        log.push(format!("Container started: {}", short_container_id(&container_id)));

        tokio::time::sleep(self.options.start_grace).await;

        let state = self.runtime.container_state(&container_id).await;
        if let Ok(ContainerState::Running) = state {
            self.ports.confirm(external_port).await;
            info!("Container {} is running on port {}", name, external_port);
            log.push(format!("Container status: {}", ContainerState::Running));
            return Ok(Launch {
                container_id,
                name,
                log,
            });
        }

        let reason = match state {
            Ok(other) => format!("Container is {} after start", other),
            Err(e) => format!("Unable to read container state: {}", e),
        };
        let diagnostics = match self.runtime.container_logs(&container_id).await {
            Ok(raw) => tail(&raw, DIAGNOSTIC_LINES),
            Err(e) => format!("<logs unavailable: {}>", e),
        };
        error!("{}: {}", reason, diagnostics);

        self.rollback(&container_id, external_port).await;
        Err(EngineError::ContainerStartFailed(format!(
            "{}. Container output:\n{}",
            reason, diagnostics
        )))
    }

    /// Stop a container. Failures are logged, never raised.
    pub async fn stop(&self, container_id: &str) -> bool {
        match self.runtime.stop_container(container_id).await {
            Ok(()) => {
                info!("Stopped container {}", container_id);
                true
            }
            Err(e) => {
                warn!("Failed to stop container {}: {}", container_id, e);
                false
            }
        }
    }

    /// Stop and remove a container, then release its port
    pub async fn remove(&self, container_id: &str, port: Option<u16>) -> bool {
        let ports = Arc::clone(&self.ports);
        let mut chain = CleanupChain::new(format!("remove {}", container_id))
            .step("stop", self.runtime.stop_container(container_id))
            .step("remove", self.runtime.remove_container(container_id));
        if let Some(port) = port {
            chain = chain.step("release port", async move {
                ports.release(port).await;
                Ok(())
            });
        }
        chain.run().await.is_clean()
    }

    /// Remove a built image. Failures are logged, never raised.
    pub async fn remove_image(&self, image_tag: &str) -> bool {
        match self.runtime.remove_image(image_tag).await {
            Ok(()) => {
                info!("Removed image {}", image_tag);
                true
            }
            Err(e) => {
                warn!("Failed to remove image {}: {}", image_tag, e);
                false
            }
        }
    }

    /// Container output as lines. A failure becomes a single diagnostic line.
    pub async fn logs(&self, container_id: &str) -> Vec<String> {
        match self.runtime.container_logs(container_id).await {
            Ok(raw) => raw.lines().map(str::to_string).collect(),
            Err(e) => {
                warn!("Failed to read logs of {}: {}", container_id, e);
                vec![format!("Error getting logs: {}", e)]
            }
        }
    }

    async fn rollback(&self, container: &str, port: u16) {
        let report = CleanupChain::new(format!("rollback {}", container))
            .step("stop", self.runtime.stop_container(container))
            .step("remove", self.runtime.remove_container(container))
            .step("release port", async {
                self.ports.release(port).await;
                Ok(())
            })
            .run()
            .await;
        if !report.is_clean() {
            warn!(
                "Rollback of {} incomplete: {} of {} steps failed",
                container,
                report.failures.len(),
                report.attempted
            );
        }
    }
}

fn short_container_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn tail(raw: &str, lines: usize) -> String {
    let all: Vec<&str> = raw.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
