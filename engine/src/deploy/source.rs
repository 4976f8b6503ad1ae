//! Source acquisition
//!
//! Produces a normalized project tree from either a git reference or an
//! uploaded ZIP archive. Every acquisition gets its own workspace directory
//! under the clones root; callers discard it once the image is built.

use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::deploy::archive;
use crate::deploy::git::GitCloner;
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::utils::format_megabytes;

/// A project tree ready for manifest detection
#[derive(Debug, Clone)]
pub struct AcquiredSource {
    /// Directory to delete once the pipeline is done with it
    pub workspace: PathBuf,
    /// Directory holding the project files. Equal to, or inside, `workspace`.
    pub project_root: PathBuf,
    /// Branch actually checked out, for git sources
    pub branch: Option<String>,
    pub size_bytes: u64,
    /// Chronological acquisition log
    pub log: Vec<String>,
}

/// Clones repositories and extracts archives into the clones root
#[derive(Debug, Clone)]
pub struct SourceAcquirer {
    clones_dir: Dir,
    git: GitCloner,
}

impl SourceAcquirer {
    pub fn new(clones_dir: impl Into<PathBuf>, git: GitCloner) -> Self {
        Self {
            clones_dir: Dir::new(clones_dir),
            git,
        }
    }

    pub fn clones_dir(&self) -> &Path {
        self.clones_dir.path()
    }

    /// Shallow-clone `repo_url`, falling back through common branch names
    pub async fn clone(&self, repo_url: &str, branch: &str) -> Result<AcquiredSource, EngineError> {
        self.clones_dir.create().await?;
        let workspace = self.clones_dir.unique_child("git");

        let mut log = vec![
            format!("Cloning repository: {}", repo_url),
            format!("Requested branch: {}", branch),
        ];

        let checkout = match self.git.clone(repo_url, branch, workspace.path()).await {
            Ok(checkout) => checkout,
            Err(e) => {
                error!("Clone of {} failed: {}", repo_url, e);
                discard(&workspace).await;
                return Err(e);
            }
        };
        log.extend(checkout.attempts);

        let size_bytes = match workspace.size_bytes().await {
            Ok(size) => size,
            Err(e) => {
                discard(&workspace).await;
                return Err(e);
            }
        };
        log.push("Successfully cloned repository".to_string());
        log.push(format!("Repository size: {} MB", format_megabytes(size_bytes)));
        info!(
            "Cloned {} ({}) into {}",
            repo_url,
            checkout.branch,
            workspace.path().display()
        );

        Ok(AcquiredSource {
            workspace: workspace.path().to_path_buf(),
            project_root: workspace.path().to_path_buf(),
            branch: Some(checkout.branch),
            size_bytes,
            log,
        })
    }

    /// Unpack a ZIP archive into a fresh workspace
    pub async fn extract(&self, archive_path: &Path) -> Result<AcquiredSource, EngineError> {
        let workspace = self.clones_dir.create_unique("zip").await?;

        let mut log = vec![format!("Extracting ZIP file: {}", archive_path.display())];
        match self.unpack(archive_path, &workspace).await {
            Ok((project_root, size_bytes)) => {
                log.push("Successfully extracted ZIP file".to_string());
                log.push(format!("Extracted size: {} MB", format_megabytes(size_bytes)));
                info!(
                    "Extracted {} into {}",
                    archive_path.display(),
                    project_root.display()
                );
                Ok(AcquiredSource {
                    workspace: workspace.path().to_path_buf(),
                    project_root,
                    branch: None,
                    size_bytes,
                    log,
                })
            }
            Err(e) => {
                error!("Extraction of {} failed: {}", archive_path.display(), e);
                discard(&workspace).await;
                Err(e)
            }
        }
    }

    async fn unpack(&self, archive_path: &Path, workspace: &Dir) -> Result<(PathBuf, u64), EngineError> {
        archive::extract(archive_path, workspace.path()).await?;
        let project_root = archive::project_root(workspace.path()).await?;
        let size_bytes = Dir::new(&project_root).size_bytes().await?;
        Ok((project_root, size_bytes))
    }
}

async fn discard(workspace: &Dir) {
    if let Err(e) = workspace.delete().await {
        error!("Failed to remove workspace {}: {}", workspace.path().display(), e);
    }
}
