//! Container runtime backed by the Docker CLI

use std::collections::HashSet;
use std::path::Path;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::errors::EngineError;

/// Number of trailing output lines kept in build error messages
const ERROR_TAIL_LINES: usize = 20;

/// CFS scheduling period used with `--cpu-quota`
pub const CPU_PERIOD_US: u64 = 100_000;

/// Memory and CPU ceilings applied to every container
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub memory_mb: u64,

    /// Fraction of one core, e.g. 0.5
    pub cpu_fraction: f64,
}

impl ResourceLimits {
    pub fn cpu_quota_us(&self) -> u64 {
        let quota = (self.cpu_fraction * CPU_PERIOD_US as f64).round();
        // the kernel rejects quotas under 1ms
        quota.max(1_000.0) as u64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_fraction: 0.5,
        }
    }
}

/// Everything needed to start one detached container
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub internal_port: u16,
    pub external_port: u16,
    pub limits: ResourceLimits,
    pub labels: Vec<(String, String)>,
}

/// Container state as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Other(String),
}

impl ContainerState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "running" => ContainerState::Running,
            other => ContainerState::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Running => f.write_str("running"),
            ContainerState::Other(state) => f.write_str(state),
        }
    }
}

/// Operations the orchestrator needs from a container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from `context` and return its output lines
    async fn build_image(&self, context: &Path, tag: &str) -> Result<Vec<String>, EngineError>;

    /// Start a detached container and return its id
    async fn run_container(&self, spec: &RunSpec) -> Result<String, EngineError>;

    async fn container_state(&self, container: &str) -> Result<ContainerState, EngineError>;

    /// Combined stdout/stderr of a container
    async fn container_logs(&self, container: &str) -> Result<String, EngineError>;

    async fn stop_container(&self, container: &str) -> Result<(), EngineError>;

    async fn remove_container(&self, container: &str) -> Result<(), EngineError>;

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError>;

    /// Host ports published by currently running containers
    async fn published_ports(&self) -> Result<HashSet<u16>, EngineError>;
}

/// [`ContainerRuntime`] that drives the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn exec(&self, args: &[&str], current_dir: Option<&Path>) -> Result<Output, EngineError> {
        debug!("{} {}", self.binary, args.join(" "));
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = current_dir {
            cmd.current_dir(dir);
        }
        cmd.output().await.map_err(|e| {
            EngineError::RuntimeError(format!("Failed to run {} {}: {}", self.binary, args[0], e))
        })
    }

    async fn exec_checked(&self, args: &[&str]) -> Result<String, EngineError> {
        let output = self.exec(args, None).await?;
        if !output.status.success() {
            return Err(EngineError::RuntimeError(format!(
                "{} {} failed: {}",
                self.binary,
                args[0],
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn build_image(&self, context: &Path, tag: &str) -> Result<Vec<String>, EngineError> {
        let output = self
            .exec(&["build", "--rm", "--force-rm", "-t", tag, "."], Some(context))
            .await
            .map_err(|e| EngineError::BuildFailed(e.to_string()))?;

        // BuildKit reports progress on stderr
        let mut lines = output_lines(&output.stdout);
        lines.extend(output_lines(&output.stderr));

        if !output.status.success() {
            let tail = lines
                .iter()
                .skip(lines.len().saturating_sub(ERROR_TAIL_LINES))
                .cloned()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(EngineError::BuildFailed(format!(
                "docker build exited with {}: {}",
                output.status, tail
            )));
        }
        Ok(lines)
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String, EngineError> {
        let publish = format!("{}:{}", spec.external_port, spec.internal_port);
        let memory = format!("{}m", spec.limits.memory_mb);
        let cpu_period = CPU_PERIOD_US.to_string();
        let cpu_quota = spec.limits.cpu_quota_us().to_string();
        let labels: Vec<String> = spec
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut args = vec![
            "run",
            "-d",
            "--name",
            spec.name.as_str(),
            "-p",
            publish.as_str(),
            "--memory",
            memory.as_str(),
            "--cpu-period",
            cpu_period.as_str(),
            "--cpu-quota",
            cpu_quota.as_str(),
        ];
        for label in &labels {
            args.push("--label");
            args.push(label.as_str());
        }
        args.push(spec.image.as_str());

        let container_id = self.exec_checked(&args).await?;
        if container_id.is_empty() {
            return Err(EngineError::RuntimeError(
                "docker run returned no container id".to_string(),
            ));
        }
        Ok(container_id)
    }

    async fn container_state(&self, container: &str) -> Result<ContainerState, EngineError> {
        let raw = self
            .exec_checked(&["inspect", "--format", "{{.State.Status}}", container])
            .await?;
        Ok(ContainerState::parse(&raw))
    }

    async fn container_logs(&self, container: &str) -> Result<String, EngineError> {
        let output = self.exec(&["logs", container], None).await?;
        if !output.status.success() {
            return Err(EngineError::RuntimeError(format!(
                "docker logs failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
        logs.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(logs)
    }

    async fn stop_container(&self, container: &str) -> Result<(), EngineError> {
        self.exec_checked(&["stop", container]).await.map(|_| ())
    }

    async fn remove_container(&self, container: &str) -> Result<(), EngineError> {
        self.exec_checked(&["rm", "--force", container]).await.map(|_| ())
    }

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError> {
        self.exec_checked(&["rmi", "--force", tag]).await.map(|_| ())
    }

    async fn published_ports(&self) -> Result<HashSet<u16>, EngineError> {
        let raw = self.exec_checked(&["ps", "--format", "{{.Ports}}"]).await?;
        Ok(parse_published_ports(&raw))
    }
}

fn output_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Extract host ports from `docker ps --format {{.Ports}}` output
///
/// Handles lines like `0.0.0.0:3001->3000/tcp, :::3001->3000/tcp` and port
/// ranges like `0.0.0.0:3001-3003->3001-3003/tcp`. Exposed-only ports
/// (`3000/tcp`) are not bound on the host and are ignored.
pub fn parse_published_ports(raw: &str) -> HashSet<u16> {
    let mut ports = HashSet::new();
    for mapping in raw.lines().flat_map(|l| l.split(',')) {
        let Some((host, _)) = mapping.trim().split_once("->") else {
            continue;
        };
        let Some((_, host_ports)) = host.rsplit_once(':') else {
            continue;
        };
        match host_ports.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) {
                    ports.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(port) = host_ports.parse::<u16>() {
                    ports.insert(port);
                }
            }
        }
    }
    ports
}

/// Scripted in-memory runtime for tests and dry runs
pub mod testing {
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{ContainerRuntime, ContainerState, RunSpec};
    use crate::errors::EngineError;

    #[derive(Debug, Clone)]
    pub struct FakeContainer {
        pub name: String,
        pub image: String,
        pub external_port: u16,
        pub state: String,
    }

    #[derive(Debug, Default)]
    struct Inner {
        images: HashSet<String>,
        containers: HashMap<String, FakeContainer>,
        published: HashSet<u16>,
        created: usize,
        next_id: usize,
        fail_build: bool,
        fail_run: bool,
        fail_stop: bool,
        start_state: Option<String>,
    }

    /// Runtime that keeps containers in memory
    #[derive(Debug, Default)]
    pub struct FakeRuntime {
        inner: Mutex<Inner>,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Make every image build fail
        pub fn fail_builds(&self) {
            self.lock().fail_build = true;
        }

        /// Make `run_container` fail before a container id is returned
        pub fn fail_runs(&self) {
            self.lock().fail_run = true;
        }

        pub fn fail_stops(&self) {
            self.lock().fail_stop = true;
        }

        /// State new containers report after the grace period
        pub fn start_in_state(&self, state: &str) {
            self.lock().start_state = Some(state.to_string());
        }

        /// Pretend a container outside our inventory publishes `port`
        pub fn publish_port(&self, port: u16) {
            self.lock().published.insert(port);
        }

        pub fn containers(&self) -> Vec<(String, FakeContainer)> {
            self.lock()
                .containers
                .iter()
                .map(|(id, c)| (id.clone(), c.clone()))
                .collect()
        }

        /// Total containers ever created, removed or not
        pub fn created_count(&self) -> usize {
            self.lock().created
        }

        pub fn has_image(&self, tag: &str) -> bool {
            self.lock().images.contains(tag)
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn build_image(&self, context: &Path, tag: &str) -> Result<Vec<String>, EngineError> {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.fail_build {
                return Err(EngineError::BuildFailed("scripted build failure".to_string()));
            }
            if !context.join("Dockerfile").exists() {
                return Err(EngineError::BuildFailed("no Dockerfile in context".to_string()));
            }
            inner.images.insert(tag.to_string());
            Ok(vec![format!("Successfully tagged {}", tag)])
        }

        async fn run_container(&self, spec: &RunSpec) -> Result<String, EngineError> {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.fail_run {
                return Err(EngineError::RuntimeError("scripted run failure".to_string()));
            }
            if !inner.images.contains(&spec.image) {
                return Err(EngineError::RuntimeError(format!("no such image: {}", spec.image)));
            }
            inner.next_id += 1;
            inner.created += 1;
            let id = format!("fake{:08}", inner.next_id);
            let state = inner.start_state.clone().unwrap_or_else(|| "running".to_string());
            if state == "running" {
                inner.published.insert(spec.external_port);
            }
            inner.containers.insert(
                id.clone(),
                FakeContainer {
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    external_port: spec.external_port,
                    state,
                },
            );
            Ok(id)
        }

        async fn container_state(&self, container: &str) -> Result<ContainerState, EngineError> {
            let inner = self.lock();
            find(&inner, container)
                .map(|(_, c)| ContainerState::parse(&c.state))
                .ok_or_else(|| EngineError::RuntimeError(format!("no such container: {}", container)))
        }

        async fn container_logs(&self, container: &str) -> Result<String, EngineError> {
            let inner = self.lock();
            find(&inner, container)
                .map(|(_, c)| format!("{} says hello\n", c.name))
                .ok_or_else(|| EngineError::RuntimeError(format!("no such container: {}", container)))
        }

        async fn stop_container(&self, container: &str) -> Result<(), EngineError> {
            let mut guard = self.lock();
            let inner = &mut *guard;
            if inner.fail_stop {
                return Err(EngineError::RuntimeError("scripted stop failure".to_string()));
            }
            let id = find(inner, container)
                .map(|(id, _)| id)
                .ok_or_else(|| EngineError::RuntimeError(format!("no such container: {}", container)))?;
            if let Some(c) = inner.containers.get_mut(&id) {
                c.state = "exited".to_string();
                let port = c.external_port;
                inner.published.remove(&port);
            }
            Ok(())
        }

        async fn remove_container(&self, container: &str) -> Result<(), EngineError> {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let id = find(inner, container)
                .map(|(id, _)| id)
                .ok_or_else(|| EngineError::RuntimeError(format!("no such container: {}", container)))?;
            if let Some(c) = inner.containers.remove(&id) {
                inner.published.remove(&c.external_port);
            }
            Ok(())
        }

        async fn remove_image(&self, tag: &str) -> Result<(), EngineError> {
            if self.lock().images.remove(tag) {
                Ok(())
            } else {
                Err(EngineError::RuntimeError(format!("no such image: {}", tag)))
            }
        }

        async fn published_ports(&self) -> Result<HashSet<u16>, EngineError> {
            Ok(self.lock().published.clone())
        }
    }

    fn find(inner: &Inner, container: &str) -> Option<(String, FakeContainer)> {
        inner
            .containers
            .iter()
            .find(|(id, c)| id.as_str() == container || c.name == container)
            .map(|(id, c)| (id.clone(), c.clone()))
    }
}
