//! Public routing tests

use std::sync::Arc;

use zippd::deploy::fsm::DeploymentStatus;

use crate::support::{node_project, Harness, RecordingRouter};

#[tokio::test]
async fn test_provisioned_url_is_recorded() {
    let router = Arc::new(RecordingRouter::default());
    let h = Harness::with_router(6300, 6310, router.clone()).await;

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), Default::default())
        .await
        .unwrap();
    submission.pipeline.await.unwrap();
    let id = submission.deployment_id;

    let deployment = h.deployment(&id).await;
    assert_eq!(deployment.status, DeploymentStatus::Running);
    let expected = format!("https://{}.apps.example.com", id);
    assert_eq!(deployment.public_url.as_deref(), Some(expected.as_str()));
    assert_eq!(
        deployment.build_logs.last().unwrap(),
        &format!("Public URL: {}", expected)
    );
    assert_eq!(*router.provisioned.lock().unwrap(), vec![(id, 6300)]);
}

#[tokio::test]
async fn test_provision_error_falls_back_to_direct_url() {
    let router = Arc::new(RecordingRouter::refusing());
    let h = Harness::with_router(6300, 6310, router.clone()).await;

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), Default::default())
        .await
        .unwrap();
    submission.pipeline.await.unwrap();

    let deployment = h.deployment(&submission.deployment_id).await;
    assert_eq!(deployment.status, DeploymentStatus::Running);
    assert_eq!(deployment.public_url.as_deref(), Some("http://apps.local:6300"));
    assert!(router.provisioned.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_withdraws_route() {
    let router = Arc::new(RecordingRouter::default());
    let h = Harness::with_router(6300, 6310, router.clone()).await;

    let submission = h
        .coordinator
        .submit_archive_deployment("alice", &node_project(), Default::default())
        .await
        .unwrap();
    submission.pipeline.await.unwrap();
    let id = submission.deployment_id;

    h.coordinator.delete_deployment(&id).await.unwrap();
    assert_eq!(*router.withdrawn.lock().unwrap(), vec![id]);
    assert!(h.reserved_ports().await.is_empty());
}
