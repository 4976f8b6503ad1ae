//! Deployment pipeline tests

use zippd::deploy::coordinator::{ArchiveRequest, GitRequest};
use zippd::deploy::fsm::DeploymentStatus;
use zippd::errors::EngineError;
use zippd::models::deployment::{DeploymentPatch, NewDeployment, SourceRef};
use zippd::storage::records::{MemoryRecordStore, RecordStore};

use crate::support::{is_terminal_or_running, node_project, zip_archive, Harness};

fn named(name: &str) -> ArchiveRequest {
    ArchiveRequest {
        name: Some(name.to_string()),
        description: None,
    }
}

#[tokio::test]
async fn test_archive_deployment_reaches_running() {
    let h = Harness::new(6000, 6010).await;

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named("hello"))
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let deployment = h.deployment(&submission.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert_eq!(deployment.port, Some(6000));
    assert_eq!(deployment.public_url.as_deref(), Some("http://localhost:6000"));
    assert!(deployment.container_id.is_some());
    assert!(deployment.checked_out_branch.is_none());

    let logs = &deployment.build_logs;
    assert_eq!(logs[0], "ZIP file uploaded, deployment queued...");
    assert!(logs.iter().any(|l| l.contains("generated one for a node project")));
    assert!(logs.iter().any(|l| l.starts_with("BUILD: ")));
    assert!(logs.iter().any(|l| l == "Deployment successful!"));
    assert_eq!(logs.last().unwrap(), "Public URL: http://localhost:6000");

    assert_eq!(h.runtime.containers().len(), 1);
    assert_eq!(h.reserved_ports().await, vec![6000]);
    assert!(h.runtime.has_image(deployment.image_tag.as_deref().unwrap()));

    // upload and workspace are gone once the pipeline ends
    assert_eq!(h.leftovers(h.layout.uploads_dir().path()), 0);
    assert_eq!(h.leftovers(h.layout.clones_dir().path()), 0);
}

#[tokio::test]
async fn test_supplied_dockerfile_port_is_used() {
    let h = Harness::new(6000, 6010).await;
    let archive = zip_archive(&[
        ("Dockerfile", "FROM busybox\nEXPOSE 9090\nCMD [\"httpd\"]\n"),
        ("index.html", "<h1>hi</h1>"),
    ]);

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &archive, ArchiveRequest::default())
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let deployment = h.deployment(&submission.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert!(deployment.name.starts_with("zip-deploy-"));
    assert!(deployment
        .build_logs
        .iter()
        .any(|l| l == "Using project Dockerfile (port 9090)"));
}

#[tokio::test]
async fn test_build_failure_leaves_nothing_behind() {
    let h = Harness::new(6000, 6010).await;
    h.runtime.fail_builds();

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named("broken"))
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let deployment = h.deployment(&submission.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.port.is_none());
    assert!(deployment.container_id.is_none());
    assert!(deployment
        .build_logs
        .last()
        .unwrap()
        .starts_with("Deployment failed: Build failed"));

    assert_eq!(h.runtime.created_count(), 0);
    assert!(h.reserved_ports().await.is_empty());
    assert_eq!(h.leftovers(h.layout.uploads_dir().path()), 0);
    assert_eq!(h.leftovers(h.layout.clones_dir().path()), 0);
}

#[tokio::test]
async fn test_start_failure_rolls_back_container_and_port() {
    let h = Harness::new(6000, 6010).await;
    h.runtime.start_in_state("exited");

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named("crashy"))
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let deployment = h.deployment(&submission.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(deployment.port.is_none());

    let failure = deployment.build_logs.last().unwrap();
    assert!(failure.contains("Container failed to start"));
    assert!(failure.contains("says hello"));

    assert_eq!(h.runtime.created_count(), 1);
    assert!(h.runtime.containers().is_empty());
    assert!(h.reserved_ports().await.is_empty());

    // the image built for the failed container is removed too
    let tag = deployment.image_tag.as_deref().unwrap();
    assert!(!h.runtime.has_image(tag));
}

#[tokio::test]
async fn test_container_create_failure_releases_port() {
    let h = Harness::new(6000, 6010).await;
    h.runtime.fail_runs();

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named("nope"))
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let deployment = h.deployment(&submission.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert!(h.reserved_ports().await.is_empty());
}

#[tokio::test]
async fn test_corrupt_archive_fails_pipeline() {
    let h = Harness::new(6000, 6010).await;
    let mut bogus = b"PK\x03\x04".to_vec();
    bogus.extend_from_slice(&[0u8; 64]);

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &bogus, named("bogus"))
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let deployment = h.deployment(&submission.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Failed);
    assert_eq!(h.runtime.created_count(), 0);
    assert_eq!(h.leftovers(h.layout.uploads_dir().path()), 0);
    assert_eq!(h.leftovers(h.layout.clones_dir().path()), 0);
}

#[tokio::test]
async fn test_stop_then_delete() {
    let h = Harness::new(6000, 6010).await;
    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named("hello"))
        .await
        .unwrap();
    submission.pipeline.await.unwrap();
    let id = submission.deployment_id;

    let logs = h.coordinator.deployment_logs(&id).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert!(logs[0].ends_with("says hello"));

    let stopped = h.coordinator.stop_deployment(&id).await.unwrap();
    assert_eq!(stopped.status, DeploymentStatus::Stopped);
    assert_eq!(stopped.build_logs.last().unwrap(), "Deployment stopped");
    // a stopped deployment keeps its port until deleted
    assert_eq!(h.reserved_ports().await, vec![6000]);

    let again = h.coordinator.stop_deployment(&id).await;
    assert!(matches!(again, Err(EngineError::InvalidTransition(_))));

    let tag = stopped.image_tag.clone().unwrap();
    assert!(h.runtime.has_image(&tag));

    h.coordinator.delete_deployment(&id).await.unwrap();
    assert!(!h.runtime.has_image(&tag));
    assert!(h.coordinator.get_deployment(&id).await.unwrap().is_none());
    assert!(h.coordinator.list_deployments("alice").await.unwrap().is_empty());
    assert!(h.runtime.containers().is_empty());
    assert!(h.reserved_ports().await.is_empty());

    let missing = h.coordinator.delete_deployment(&id).await;
    assert!(matches!(missing, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn test_stop_failure_keeps_running_status() {
    let h = Harness::new(6000, 6010).await;
    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named("hello"))
        .await
        .unwrap();
    submission.pipeline.await.unwrap();
    h.runtime.fail_stops();

    let result = h.coordinator.stop_deployment(&submission.deployment_id).await;
    assert!(matches!(result, Err(EngineError::RuntimeError(_))));
    assert_eq!(
        h.deployment(&submission.deployment_id).await.status,
        DeploymentStatus::Running
    );
}

#[tokio::test]
async fn test_port_pool_exhaustion() {
    let h = Harness::new(6000, 6003).await;

    let mut submissions = Vec::new();
    for i in 0..4 {
        submissions.push(
            h.coordinator
                .submit_archive_deployment("alice", &node_project(), named(&format!("app-{}", i)))
                .await
                .unwrap(),
        );
    }
    let mut ids = Vec::new();
    for submission in submissions {
        submission.pipeline.await.unwrap();
        ids.push(submission.deployment_id);
    }

    let mut ports = Vec::new();
    let mut failed = 0;
    for id in &ids {
        let deployment = h.deployment(id).await;
        assert!(is_terminal_or_running(deployment.status));
        match deployment.status {
            DeploymentStatus::Running => ports.push(deployment.port.unwrap()),
            DeploymentStatus::Failed => {
                failed += 1;
                assert!(deployment
                    .build_logs
                    .last()
                    .unwrap()
                    .contains("No free port in range 6000..6003"));
                assert!(!h.runtime.has_image(deployment.image_tag.as_deref().unwrap()));
            }
            other => panic!("unexpected status {}", other),
        }
    }
    ports.sort_unstable();
    assert_eq!(ports, vec![6000, 6001, 6002]);
    assert_eq!(failed, 1);
    assert_eq!(h.runtime.containers().len(), 3);
}

#[tokio::test]
async fn test_freed_port_is_reused() {
    let h = Harness::new(6000, 6001).await;

    let first = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named("first"))
        .await
        .unwrap();
    first.pipeline.await.unwrap();
    h.coordinator.delete_deployment(&first.deployment_id).await.unwrap();

    let second = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named("second"))
        .await
        .unwrap();
    second.pipeline.await.unwrap();
    assert_eq!(h.deployment(&second.deployment_id).await.port, Some(6000));
}

#[tokio::test]
async fn test_list_is_scoped_to_owner() {
    let h = Harness::new(6000, 6010).await;
    for owner in ["alice", "alice", "bob"] {
        h.coordinator
            .submit_archive_deployment(owner, &node_project(), ArchiveRequest::default())
            .await
            .unwrap()
            .pipeline
            .await
            .unwrap();
    }

    let alice = h.coordinator.list_deployments("alice").await.unwrap();
    assert_eq!(alice.len(), 2);
    assert!(alice.iter().all(|d| d.owner_id == "alice"));
    assert!(alice[0].created_at >= alice[1].created_at);
    assert_eq!(h.coordinator.list_deployments("bob").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected_before_queueing() {
    let h = Harness::new(6000, 6010).await;

    let empty = h
        .coordinator
        .submit_archive_deployment("alice", &[], ArchiveRequest::default())
        .await;
    assert!(matches!(empty, Err(EngineError::InputError(_))));

    let tarball = h
        .coordinator
        .submit_archive_deployment("alice", b"\x1f\x8b\x08\x00", ArchiveRequest::default())
        .await;
    assert!(matches!(tarball, Err(EngineError::InputError(_))));

    let long_name = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), named(&"x".repeat(101)))
        .await;
    assert!(matches!(long_name, Err(EngineError::InputError(_))));

    let bad_url = h
        .coordinator
        .submit_git_deployment(
            "alice",
            GitRequest {
                repo_url: "not a url".to_string(),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(bad_url, Err(EngineError::InputError(_))));

    let bad_branch = h
        .coordinator
        .submit_git_deployment(
            "alice",
            GitRequest {
                repo_url: "https://github.com/example/app.git".to_string(),
                branch: Some("feature..x".to_string()),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(bad_branch, Err(EngineError::InputError(_))));

    assert!(h.coordinator.list_deployments("alice").await.unwrap().is_empty());
    assert_eq!(h.leftovers(h.layout.uploads_dir().path()), 0);
}

#[tokio::test]
async fn test_logs_without_container() {
    let h = Harness::new(6000, 6010).await;
    h.runtime.fail_builds();
    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), ArchiveRequest::default())
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let logs = h.coordinator.deployment_logs(&submission.deployment_id).await;
    assert!(matches!(logs, Err(EngineError::InputError(_))));
}

#[tokio::test]
async fn test_store_rejects_backwards_transitions() {
    let store = MemoryRecordStore::new();
    let id = store
        .create(NewDeployment {
            owner_id: "alice".to_string(),
            name: "app".to_string(),
            description: None,
            source: SourceRef::Archive {
                path: "/tmp/app.zip".to_string(),
            },
            build_logs: Vec::new(),
        })
        .await
        .unwrap();

    let skip = store
        .update(&id, DeploymentPatch::status(DeploymentStatus::Running))
        .await;
    assert!(matches!(skip, Err(EngineError::InvalidTransition(_))));

    for status in [
        DeploymentStatus::Cloning,
        DeploymentStatus::Building,
        DeploymentStatus::Running,
        DeploymentStatus::Stopped,
    ] {
        store
            .update(&id, DeploymentPatch::status(status))
            .await
            .unwrap();
    }
    let back = store
        .update(&id, DeploymentPatch::status(DeploymentStatus::Running))
        .await;
    assert!(matches!(back, Err(EngineError::InvalidTransition(_))));
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        DeploymentStatus::Stopped
    );
}
