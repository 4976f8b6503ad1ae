//! Git acquisition tests against a local repository
//!
//! Skipped when no git binary is available.

use std::path::Path;
use std::process::Command;

use zippd::deploy::coordinator::GitRequest;
use zippd::deploy::fsm::DeploymentStatus;
use zippd::deploy::git::GitCloner;
use zippd::deploy::source::SourceAcquirer;
use zippd::errors::EngineError;

use crate::support::Harness;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=zipp", "-c", "user.email=zipp@localhost"])
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

/// Repository whose only branch is `branch`
fn single_branch_repo(dir: &Path, branch: &str) -> String {
    git(dir, &["init", "-q"]);
    git(dir, &["checkout", "-q", "-b", branch]);
    std::fs::write(
        dir.join("package.json"),
        r#"{"name":"repo-app","dependencies":{"express":"^4.18.0"}}"#,
    )
    .unwrap();
    std::fs::write(dir.join("index.js"), "console.log('up');\n").unwrap();
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "init"]);
    format!("file://{}", dir.display())
}

#[tokio::test]
async fn test_missing_branch_falls_back() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let repo = tempfile::tempdir().unwrap();
    let url = single_branch_repo(repo.path(), "develop");
    let clones = tempfile::tempdir().unwrap();
    let acquirer = SourceAcquirer::new(clones.path(), GitCloner::default());

    let source = acquirer.clone(&url, "feature-x").await.unwrap();
    assert_eq!(source.branch.as_deref(), Some("develop"));
    assert!(source.project_root.join("package.json").exists());
    assert!(source.log.iter().any(|l| l == "Branch 'feature-x' not found"));
    assert!(source.log.iter().any(|l| l == "Cloned branch 'develop'"));
    assert!(source.log.iter().any(|l| l.starts_with("Repository size:")));
}

#[tokio::test]
async fn test_remote_default_branch_is_last_resort() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let repo = tempfile::tempdir().unwrap();
    let url = single_branch_repo(repo.path(), "trunk");
    let clones = tempfile::tempdir().unwrap();
    let acquirer = SourceAcquirer::new(clones.path(), GitCloner::default());

    let source = acquirer.clone(&url, "feature").await.unwrap();
    assert_eq!(source.branch.as_deref(), Some("trunk"));

    let attempts: Vec<&str> = source
        .log
        .iter()
        .map(String::as_str)
        .filter(|l| l.starts_with("Branch '") || l.starts_with("Cloned branch"))
        .collect();
    assert_eq!(
        attempts,
        vec![
            "Branch 'feature' not found",
            "Branch 'master' not found",
            "Branch 'main' not found",
            "Branch 'develop' not found",
            "Branch 'dev' not found",
            "Cloned branch 'trunk'",
        ]
    );
}

#[tokio::test]
async fn test_requested_branch_is_not_retried() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let repo = tempfile::tempdir().unwrap();
    let url = single_branch_repo(repo.path(), "trunk");
    let clones = tempfile::tempdir().unwrap();
    let acquirer = SourceAcquirer::new(clones.path(), GitCloner::default());

    let source = acquirer.clone(&url, "main").await.unwrap();
    let main_attempts = source
        .log
        .iter()
        .filter(|l| l.as_str() == "Branch 'main' not found")
        .count();
    assert_eq!(main_attempts, 1);
    assert_eq!(source.branch.as_deref(), Some("trunk"));
}

#[tokio::test]
async fn test_unreachable_repository_fails_without_leftovers() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let clones = tempfile::tempdir().unwrap();
    let missing = clones.path().join("no-such-repo");
    let acquirer = SourceAcquirer::new(clones.path().join("work"), GitCloner::default());

    let result = acquirer
        .clone(&format!("file://{}", missing.display()), "main")
        .await;
    assert!(matches!(result, Err(EngineError::AcquisitionError(_))));
    let left = std::fs::read_dir(clones.path().join("work")).unwrap().count();
    assert_eq!(left, 0);
}

#[tokio::test]
async fn test_git_deployment_records_checked_out_branch() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let repo = tempfile::tempdir().unwrap();
    let url = single_branch_repo(repo.path(), "develop");
    let h = Harness::new(6100, 6110).await;

    let submission = h
        .coordinator
        .submit_git_deployment(
            "alice",
            GitRequest {
                repo_url: url,
                branch: Some("main".to_string()),
                name: Some("repo-app".to_string()),
                description: Some("from git".to_string()),
            },
        )
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let deployment = h.deployment(&submission.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert_eq!(deployment.checked_out_branch.as_deref(), Some("develop"));
    assert_eq!(deployment.build_logs[0], "Deployment queued...");
    assert_eq!(deployment.build_logs[1], "Starting Git clone process...");
    assert_eq!(h.leftovers(h.layout.clones_dir().path()), 0);
}
