//! Shallow git checkout with branch fallback

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::errors::EngineError;

/// Branches tried, in order, when the requested one does not exist
pub const FALLBACK_BRANCHES: &[&str] = &["master", "main", "develop", "dev"];

/// Why a single clone attempt failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneFailure {
    /// The remote has no such branch. Worth trying another one.
    BranchNotFound(String),
    /// Network, auth, bad URL and everything else
    Fatal(String),
}

/// Classify `git clone` stderr
pub fn classify_clone_failure(stderr: &str) -> CloneFailure {
    let lower = stderr.to_lowercase();
    let missing_branch = (lower.contains("remote branch") && lower.contains("not found"))
        || lower.contains("could not find remote branch")
        || lower.contains("couldn't find remote ref")
        || lower.contains("not found in upstream origin");
    let message = stderr.trim().to_string();
    if missing_branch {
        CloneFailure::BranchNotFound(message)
    } else {
        CloneFailure::Fatal(message)
    }
}

/// Result of a successful checkout
#[derive(Debug, Clone)]
pub struct Checkout {
    /// Branch actually checked out
    pub branch: String,
    /// Every attempt in order, failures included
    pub attempts: Vec<String>,
}

/// Runs `git clone` through the CLI
#[derive(Debug, Clone)]
pub struct GitCloner {
    git_bin: String,
}

impl Default for GitCloner {
    fn default() -> Self {
        Self::new("git")
    }
}

impl GitCloner {
    pub fn new(git_bin: impl Into<String>) -> Self {
        Self {
            git_bin: git_bin.into(),
        }
    }

    /// Clone `repo_url` into `target`, which must not exist yet.
    ///
    /// Tries `branch`, then [`FALLBACK_BRANCHES`] in order, then the remote
    /// default. Only a "branch not found" failure moves on to the next
    /// candidate. `target` is removed if every attempt fails.
    pub async fn clone(
        &self,
        repo_url: &str,
        branch: &str,
        target: &Path,
    ) -> Result<Checkout, EngineError> {
        let mut candidates: Vec<Option<&str>> = vec![Some(branch)];
        candidates.extend(
            FALLBACK_BRANCHES
                .iter()
                .filter(|b| **b != branch)
                .map(|b| Some(*b)),
        );
        candidates.push(None);

        let mut attempts = Vec::new();
        for candidate in candidates {
            let label = candidate.unwrap_or("<remote default>");
            info!("Cloning {} (branch: {})", repo_url, label);

            match self.clone_once(repo_url, candidate, target).await? {
                Ok(()) => {
                    let checked_out = match candidate {
                        Some(b) => b.to_string(),
                        None => self.current_branch(target).await?,
                    };
                    attempts.push(format!("Cloned branch '{}'", checked_out));
                    return Ok(Checkout {
                        branch: checked_out,
                        attempts,
                    });
                }
                Err(CloneFailure::BranchNotFound(msg)) => {
                    debug!("Branch {} not found: {}", label, msg);
                    attempts.push(format!("Branch '{}' not found", label));
                    remove_partial(target).await;
                }
                Err(CloneFailure::Fatal(msg)) => {
                    attempts.push(format!("Clone of branch '{}' failed: {}", label, msg));
                    remove_partial(target).await;
                    return Err(EngineError::AcquisitionError(format!(
                        "git clone failed: {} ({})",
                        msg,
                        attempts.join("; ")
                    )));
                }
            }
        }

        remove_partial(target).await;
        Err(EngineError::AcquisitionError(format!(
            "No usable branch found in {} ({})",
            repo_url,
            attempts.join("; ")
        )))
    }

    /// One attempt. The outer error means git itself could not be run.
    async fn clone_once(
        &self,
        repo_url: &str,
        branch: Option<&str>,
        target: &Path,
    ) -> Result<Result<(), CloneFailure>, EngineError> {
        let mut cmd = Command::new(&self.git_bin);
        cmd.args(["clone", "--depth", "1", "--single-branch"]);
        if let Some(b) = branch {
            cmd.args(["--branch", b]);
        }
        cmd.arg("--")
            .arg(repo_url)
            .arg(target)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await.map_err(|e| {
            EngineError::AcquisitionError(format!("Failed to run {}: {}", self.git_bin, e))
        })?;

        if output.status.success() {
            return Ok(Ok(()));
        }
        Ok(Err(classify_clone_failure(&String::from_utf8_lossy(
            &output.stderr,
        ))))
    }

    async fn current_branch(&self, repo: &Path) -> Result<String, EngineError> {
        let output = Command::new(&self.git_bin)
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(repo)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| EngineError::AcquisitionError(format!("Failed to run git rev-parse: {}", e)))?;
        if !output.status.success() {
            return Err(EngineError::AcquisitionError(format!(
                "git rev-parse failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

async fn remove_partial(target: &Path) {
    match tokio::fs::remove_dir_all(target).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial clone {}: {}", target.display(), e),
    }
}
