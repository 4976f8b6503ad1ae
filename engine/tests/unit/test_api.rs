//! HTTP API tests

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use zippd::app::options::ServerOptions;
use zippd::server::handlers::OWNER_HEADER;
use zippd::server::serve::router;
use zippd::server::state::ServerState;

use crate::support::{node_project, Harness};

fn app(h: &Harness) -> Router {
    router(
        &ServerOptions::default(),
        Arc::new(ServerState::new(h.coordinator.clone())),
    )
}

fn request(method: Method, uri: &str, owner: Option<&str>, body: Body) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(owner) = owner {
        builder = builder.header(OWNER_HEADER, owner);
    }
    builder.body(body).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Submit the sample project as `owner` and wait for its pipeline
async fn deployed(h: &Harness, owner: &str) -> String {
    let submission = h
        .coordinator
        .submit_archive_deployment(owner, &node_project(), Default::default())
        .await
        .unwrap();
    submission.pipeline.await.unwrap();
    submission.deployment_id
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new(6200, 6210).await;
    let response = app(&h)
        .oneshot(request(Method::GET, "/health", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["service"], "zippd");
}

#[tokio::test]
async fn test_missing_owner_is_unauthorized() {
    let h = Harness::new(6200, 6210).await;
    let response = app(&h)
        .oneshot(request(Method::GET, "/deployments", None, Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_archive_upload_is_accepted() {
    let h = Harness::new(6200, 6210).await;
    let response = app(&h)
        .oneshot(request(
            Method::POST,
            "/deployments/archive?name=uploaded",
            Some("alice"),
            Body::from(node_project()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = json_body(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "pending");
    let id = body["data"]["deployment_id"].as_str().unwrap().to_string();

    let deployment = h.coordinator.get_deployment(&id).await.unwrap().unwrap();
    assert_eq!(deployment.owner_id, "alice");
    assert_eq!(deployment.name, "uploaded");
}

#[tokio::test]
async fn test_invalid_upload_is_bad_request() {
    let h = Harness::new(6200, 6210).await;
    let response = app(&h)
        .oneshot(request(
            Method::POST,
            "/deployments/archive",
            Some("alice"),
            Body::from("definitely not a zip"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error_code"], "invalid_input");
}

#[tokio::test]
async fn test_git_submission_with_bad_url() {
    let h = Harness::new(6200, 6210).await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/deployments/git")
        .header(OWNER_HEADER, "alice")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"repo_url":"ftp://example.com/app.git"}"#))
        .unwrap();
    let response = app(&h).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_foreign_deployment_is_forbidden() {
    let h = Harness::new(6200, 6210).await;
    let id = deployed(&h, "alice").await;

    let uri = format!("/deployments/{}", id);
    let response = app(&h)
        .oneshot(request(Method::GET, &uri, Some("mallory"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app(&h)
        .oneshot(request(Method::DELETE, &uri, Some("mallory"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(h.coordinator.get_deployment(&id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_deployment_is_not_found() {
    let h = Harness::new(6200, 6210).await;
    let response = app(&h)
        .oneshot(request(
            Method::GET,
            "/deployments/does-not-exist",
            Some("alice"),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stop_twice_conflicts() {
    let h = Harness::new(6200, 6210).await;
    let id = deployed(&h, "alice").await;
    let uri = format!("/deployments/{}/stop", id);

    let response = app(&h)
        .oneshot(request(Method::POST, &uri, Some("alice"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], "stopped");

    let response = app(&h)
        .oneshot(request(Method::POST, &uri, Some("alice"), Body::empty()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_logs_and_list() {
    let h = Harness::new(6200, 6210).await;
    let id = deployed(&h, "alice").await;

    let response = app(&h)
        .oneshot(request(
            Method::GET,
            &format!("/deployments/{}/logs", id),
            Some("alice"),
            Body::empty(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["data"][0].as_str().unwrap().ends_with("says hello"));

    let response = app(&h)
        .oneshot(request(Method::GET, "/deployments", Some("alice"), Body::empty()))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["status"], "running");
}
