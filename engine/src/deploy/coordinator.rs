//! Deployment coordinator
//!
//! Sequences acquisition, manifest detection, image build, port allocation
//! and container start for each submission. Every stage change is persisted
//! through the record store before the next stage begins; any failure, panics
//! included, ends the deployment in FAILED with the reason in its log.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::deploy::archive::looks_like_zip;
use crate::deploy::cleanup::CleanupChain;
use crate::deploy::fsm::{DeploymentEvent, DeploymentFsm, DeploymentStatus};
use crate::deploy::manifest;
use crate::deploy::orchestrator::ContainerOrchestrator;
use crate::deploy::routing::{direct_url, PublicRouter};
use crate::deploy::source::SourceAcquirer;
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deployment::{Deployment, DeploymentPatch, NewDeployment, SourceRef};
use crate::storage::records::RecordStore;
use crate::utils::{generate_uuid, sanitize_name, short_id};

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;
const MAX_BRANCH_LEN: usize = 255;
const REPO_SCHEMES: &[&str] = &["http", "https", "ssh", "git", "file"];

/// Coordinator options
#[derive(Debug, Clone)]
pub struct Options {
    /// Host used in public URLs when no router is configured
    pub public_host: String,

    /// Where uploaded archives wait for their pipeline
    pub uploads_dir: PathBuf,

    pub max_archive_bytes: usize,

    /// Prefix of built image tags
    pub image_prefix: String,

    /// Branch requested when a git submission names none
    pub default_branch: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            uploads_dir: PathBuf::from("uploads"),
            max_archive_bytes: 100 * 1024 * 1024,
            image_prefix: "zipp".to_string(),
            default_branch: "main".to_string(),
        }
    }
}

/// A git deployment request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitRequest {
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Name and description of an archive deployment
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchiveRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A queued deployment and its background pipeline
#[derive(Debug)]
pub struct Submission {
    pub deployment_id: String,
    pub pipeline: JoinHandle<()>,
}

/// Transient inputs removed once a pipeline ends
#[derive(Debug, Default)]
struct Artifacts {
    workspace: Option<PathBuf>,
    archive: Option<PathBuf>,
}

pub struct DeploymentCoordinator {
    store: Arc<dyn RecordStore>,
    acquirer: SourceAcquirer,
    orchestrator: Arc<ContainerOrchestrator>,
    router: Option<Arc<dyn PublicRouter>>,
    options: Options,
}

impl DeploymentCoordinator {
    pub fn new(
        store: Arc<dyn RecordStore>,
        acquirer: SourceAcquirer,
        orchestrator: Arc<ContainerOrchestrator>,
        router: Option<Arc<dyn PublicRouter>>,
        options: Options,
    ) -> Self {
        Self {
            store,
            acquirer,
            orchestrator,
            router,
            options,
        }
    }

    pub fn orchestrator(&self) -> &Arc<ContainerOrchestrator> {
        &self.orchestrator
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Queue a deployment of a git repository
    pub async fn submit_git_deployment(
        self: &Arc<Self>,
        owner_id: &str,
        request: GitRequest,
    ) -> Result<Submission, EngineError> {
        let repo_url = validate_repo_url(&request.repo_url)?;
        let branch = match request.branch.as_deref().map(str::trim) {
            Some(b) if !b.is_empty() => validate_branch(b)?,
            _ => self.options.default_branch.clone(),
        };
        let name = validate_name(request.name.as_deref(), "git-deploy")?;
        let description = validate_description(request.description.as_deref())?;

        let id = self
            .store
            .create(NewDeployment {
                owner_id: owner_id.to_string(),
                name,
                description,
                source: SourceRef::Git {
                    repo_url: repo_url.clone(),
                    branch: branch.clone(),
                },
                build_logs: vec!["Deployment queued...".to_string()],
            })
            .await?;
        info!("Queued git deployment {} of {} ({})", id, repo_url, branch);

        Ok(self.spawn_pipeline(id))
    }

    /// Queue a deployment of an uploaded ZIP archive
    pub async fn submit_archive_deployment(
        self: &Arc<Self>,
        owner_id: &str,
        archive: &[u8],
        request: ArchiveRequest,
    ) -> Result<Submission, EngineError> {
        if archive.is_empty() {
            return Err(EngineError::InputError("Archive is empty".to_string()));
        }
        if !looks_like_zip(archive) {
            return Err(EngineError::InputError(
                "Only ZIP archives are supported".to_string(),
            ));
        }
        if archive.len() > self.options.max_archive_bytes {
            return Err(EngineError::InputError(format!(
                "Archive is {} bytes, the limit is {}",
                archive.len(),
                self.options.max_archive_bytes
            )));
        }
        let name = validate_name(request.name.as_deref(), "zip-deploy")?;
        let description = validate_description(request.description.as_deref())?;

        let upload = Dir::new(&self.options.uploads_dir).file(&format!("{}.zip", generate_uuid()));
        upload.write_bytes(archive).await?;

        let created = self
            .store
            .create(NewDeployment {
                owner_id: owner_id.to_string(),
                name,
                description,
                source: SourceRef::Archive {
                    path: upload.path().to_string_lossy().into_owned(),
                },
                build_logs: vec!["ZIP file uploaded, deployment queued...".to_string()],
            })
            .await;
        let id = match created {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = upload.delete().await {
                    warn!("Failed to remove upload {}: {}", upload.path().display(), cleanup);
                }
                return Err(e);
            }
        };
        info!("Queued archive deployment {} ({} bytes)", id, archive.len());

        Ok(self.spawn_pipeline(id))
    }

    /// Stop the container of a RUNNING deployment. Its port stays reserved.
    pub async fn stop_deployment(&self, id: &str) -> Result<Deployment, EngineError> {
        let deployment = self.require(id).await?;
        DeploymentFsm::resume(deployment.status).process(DeploymentEvent::Stop)?;
        let Some(container_id) = deployment.container_id.as_deref() else {
            return Err(EngineError::InputError("No container to stop".to_string()));
        };

        if !self.orchestrator.stop(container_id).await {
            return Err(EngineError::RuntimeError(format!(
                "Failed to stop container {}",
                container_id
            )));
        }
        info!("Stopped deployment {}", id);
        self.store
            .update(
                id,
                DeploymentPatch::status(DeploymentStatus::Stopped)
                    .with_logs(["Deployment stopped"]),
            )
            .await
    }

    /// Tear down everything a deployment holds and drop its record
    pub async fn delete_deployment(&self, id: &str) -> Result<(), EngineError> {
        let deployment = self.require(id).await?;

        match (&deployment.container_id, deployment.port) {
            (Some(container_id), port) => {
                if !self.orchestrator.remove(container_id, port).await {
                    warn!("Teardown of deployment {} was incomplete", id);
                }
            }
            (None, Some(port)) => {
                self.orchestrator.ports().release(port).await;
            }
            (None, None) => {}
        }
        if let Some(tag) = &deployment.image_tag {
            self.orchestrator.remove_image(tag).await;
        }
        if let Some(router) = &self.router {
            if let Err(e) = router.withdraw(id).await {
                warn!("Failed to withdraw public route of {}: {}", id, e);
            }
        }

        self.store.delete(id).await?;
        info!("Deleted deployment {}", id);
        Ok(())
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, EngineError> {
        self.store.get(id).await
    }

    pub async fn list_deployments(&self, owner_id: &str) -> Result<Vec<Deployment>, EngineError> {
        self.store.list(owner_id).await
    }

    /// Output of a deployment's container
    pub async fn deployment_logs(&self, id: &str) -> Result<Vec<String>, EngineError> {
        let deployment = self.require(id).await?;
        match deployment.container_id.as_deref() {
            Some(container_id) => Ok(self.orchestrator.logs(container_id).await),
            None => Err(EngineError::InputError(
                "Deployment has no container".to_string(),
            )),
        }
    }

    async fn require(&self, id: &str) -> Result<Deployment, EngineError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Deployment {}", id)))
    }

    fn spawn_pipeline(self: &Arc<Self>, id: String) -> Submission {
        let coordinator = Arc::clone(self);
        let pipeline = tokio::spawn({
            let id = id.clone();
            async move { coordinator.run_pipeline(id).await }
        });
        Submission {
            deployment_id: id,
            pipeline,
        }
    }

    async fn run_pipeline(&self, id: String) {
        let mut artifacts = Artifacts::default();
        let outcome = AssertUnwindSafe(self.execute(&id, &mut artifacts))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => info!("Deployment {} is running", id),
            Ok(Err(e)) => self.fail(&id, &e.to_string()).await,
            Err(panic) => self.fail(&id, &panic_message(panic)).await,
        }

        self.discard(artifacts).await;
    }

    async fn execute(&self, id: &str, artifacts: &mut Artifacts) -> Result<(), EngineError> {
        let deployment = self.require(id).await?;
        let mut fsm = DeploymentFsm::resume(deployment.status);

        let start_line = match &deployment.source {
            SourceRef::Git { .. } => "Starting Git clone process...",
            SourceRef::Archive { path } => {
                artifacts.archive = Some(PathBuf::from(path));
                "Starting ZIP extraction..."
            }
        };
        self.advance(id, &mut fsm, DeploymentEvent::Acquire, DeploymentPatch::default().with_logs([start_line]))
            .await?;

        let acquired = match &deployment.source {
            SourceRef::Git { repo_url, branch } => self.acquirer.clone(repo_url, branch).await?,
            SourceRef::Archive { path } => self.acquirer.extract(&PathBuf::from(path)).await?,
        };
        artifacts.workspace = Some(acquired.workspace.clone());

        let mut patch = DeploymentPatch::default()
            .with_logs(acquired.log)
            .with_logs(["Starting Docker build..."]);
        patch.checked_out_branch = acquired.branch;
        self.advance(id, &mut fsm, DeploymentEvent::Build, patch).await?;

        let manifest = manifest::detect(&acquired.project_root).await?;
        self.append_logs(id, [manifest.describe()]).await?;

        let image_tag = format!(
            "{}_{}_{}_{}",
            self.options.image_prefix,
            sanitize_name(&deployment.owner_id, 32),
            sanitize_name(&deployment.name, 32),
            short_id()
        );
        let build_log = self
            .orchestrator
            .build(&acquired.project_root, &manifest, &image_tag)
            .await?;
        let mut patch = DeploymentPatch::default().with_logs(build_log);
        patch.image_tag = Some(image_tag.clone());
        self.store.update(id, patch).await?;

        let port = self.orchestrator.ports().acquire(id).await?;
        let launch = self
            .orchestrator
            .run(&image_tag, manifest.internal_port, port, id)
            .await?;
        let public_url = self.public_url(id, port).await;

        let mut patch = DeploymentPatch::default()
            .with_logs(launch.log)
            .with_logs(["Deployment successful!".to_string(), format!("Public URL: {}", public_url)]);
        patch.container_id = Some(launch.container_id.clone());
        patch.port = Some(port);
        patch.public_url = Some(public_url);

        if let Err(e) = self.advance(id, &mut fsm, DeploymentEvent::Launched, patch).await {
            error!("Unable to record running state of {}, removing its container", id);
            self.orchestrator.remove(&launch.container_id, Some(port)).await;
            if let Some(router) = &self.router {
                if let Err(e) = router.withdraw(id).await {
                    warn!("Failed to withdraw public route of {}: {}", id, e);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Validate the transition locally, then persist it with `patch`
    async fn advance(
        &self,
        id: &str,
        fsm: &mut DeploymentFsm,
        event: DeploymentEvent,
        mut patch: DeploymentPatch,
    ) -> Result<(), EngineError> {
        let mut next = fsm.clone();
        patch.status = Some(next.process(event)?);
        self.store.update(id, patch).await?;
        *fsm = next;
        Ok(())
    }

    async fn append_logs<I, S>(&self, id: &str, lines: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store
            .update(id, DeploymentPatch::default().with_logs(lines))
            .await
            .map(|_| ())
    }

    async fn public_url(&self, id: &str, port: u16) -> String {
        if let Some(router) = &self.router {
            match router.provision(id, port).await {
                Ok(url) => return url,
                Err(e) => warn!("Public routing for {} failed, using direct URL: {}", id, e),
            }
        }
        direct_url(&self.options.public_host, port)
    }

    /// Move a deployment to FAILED through the state machine and log why
    async fn fail(&self, id: &str, reason: &str) {
        error!("Deployment {} failed: {}", id, reason);
        let deployment = match self.store.get(id).await {
            Ok(Some(deployment)) => deployment,
            Ok(None) => {
                warn!("Deployment {} vanished before its failure was recorded", id);
                return;
            }
            Err(e) => {
                warn!("Unable to record failure of {}: {}", id, e);
                return;
            }
        };

        let mut fsm = DeploymentFsm::resume(deployment.status);
        let status = match fsm.process(DeploymentEvent::Fail(reason.to_string())) {
            Ok(status) => status,
            Err(e) => {
                warn!("Failure of {} not recorded: {}", id, e);
                return;
            }
        };
        let patch = DeploymentPatch::status(status)
            .with_logs([format!("Deployment failed: {}", fsm.error().unwrap_or(reason))]);
        if let Err(e) = self.store.update(id, patch).await {
            warn!("Unable to record failure of {}: {}", id, e);
        }

        // no container outlives a failed pipeline, so its image has no user
        if let Some(tag) = &deployment.image_tag {
            self.orchestrator.remove_image(tag).await;
        }
    }

    async fn discard(&self, artifacts: Artifacts) {
        let mut chain = CleanupChain::new("discard artifacts");
        if let Some(workspace) = artifacts.workspace {
            chain = chain.step("workspace", async move { Dir::new(workspace).delete().await });
        }
        if let Some(archive) = artifacts.archive {
            chain = chain.step("archive", async move { File::new(archive).delete().await });
        }
        chain.run().await;
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let text = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("internal error: {}", text)
}

fn validate_repo_url(raw: &str) -> Result<String, EngineError> {
    let repo_url = raw.trim();
    if repo_url.is_empty() {
        return Err(EngineError::InputError("Repository URL is required".to_string()));
    }
    if repo_url.starts_with('-') || repo_url.chars().any(char::is_whitespace) {
        return Err(EngineError::InputError(format!("Invalid repository URL: {}", repo_url)));
    }

    // scp-like syntax, git@host:owner/repo.git
    if let Some((user_host, path)) = repo_url.split_once(':') {
        if user_host.contains('@') && !user_host.contains('/') && !path.starts_with("//") {
            if path.is_empty() {
                return Err(EngineError::InputError(format!("Invalid repository URL: {}", repo_url)));
            }
            return Ok(repo_url.to_string());
        }
    }

    let url = url::Url::parse(repo_url)
        .map_err(|e| EngineError::InputError(format!("Invalid repository URL {}: {}", repo_url, e)))?;
    if !REPO_SCHEMES.contains(&url.scheme()) {
        return Err(EngineError::InputError(format!(
            "Unsupported repository URL scheme: {}",
            url.scheme()
        )));
    }
    if url.scheme() != "file" && url.host_str().map_or(true, str::is_empty) {
        return Err(EngineError::InputError(format!(
            "Repository URL has no host: {}",
            repo_url
        )));
    }
    Ok(repo_url.to_string())
}

fn validate_branch(branch: &str) -> Result<String, EngineError> {
    let invalid = branch.len() > MAX_BRANCH_LEN
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("@{")
        || branch
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || "~^:?*[\\".contains(c));
    if invalid {
        return Err(EngineError::InputError(format!("Invalid branch name: {}", branch)));
    }
    Ok(branch.to_string())
}

fn validate_name(name: Option<&str>, default_prefix: &str) -> Result<String, EngineError> {
    match name.map(str::trim) {
        Some(n) if n.chars().count() > MAX_NAME_LEN => Err(EngineError::InputError(format!(
            "Name is longer than {} characters",
            MAX_NAME_LEN
        ))),
        Some(n) if !n.is_empty() => Ok(n.to_string()),
        _ => Ok(format!("{}-{}", default_prefix, short_id())),
    }
}

fn validate_description(description: Option<&str>) -> Result<Option<String>, EngineError> {
    match description.map(str::trim) {
        Some(d) if d.chars().count() > MAX_DESCRIPTION_LEN => Err(EngineError::InputError(
            format!("Description is longer than {} characters", MAX_DESCRIPTION_LEN),
        )),
        Some(d) if !d.is_empty() => Ok(Some(d.to_string())),
        _ => Ok(None),
    }
}
