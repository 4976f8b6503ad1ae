//! HTTP request handlers
//!
//! Authentication happens in front of this service. The gateway forwards the
//! verified owner id in the `X-Owner-Id` header.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use crate::deploy::coordinator::{ArchiveRequest, GitRequest};
use crate::deploy::fsm::DeploymentStatus;
use crate::errors::EngineError;
use crate::models::deployment::Deployment;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Header carrying the authenticated owner id
pub const OWNER_HEADER: &str = "x-owner-id";

/// Standard response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            data: Some(data),
        })
    }
}

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    pub error_code: String,
}

/// Handler error
#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    Unauthorized,
    Forbidden,
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::Engine(e) => match e {
                EngineError::InputError(_) | EngineError::InvalidArchive(_) => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::NotFound(_) => StatusCode::NOT_FOUND,
                EngineError::InvalidTransition(_) => StatusCode::CONFLICT,
                EngineError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, error_code) = match &self {
            ApiError::Unauthorized => ("Missing owner id".to_string(), "unauthorized"),
            ApiError::Forbidden => ("Access denied".to_string(), "forbidden"),
            ApiError::Engine(e) => (e.to_string(), e.code()),
        };
        if status.is_server_error() {
            error!("Request failed: {}", message);
        }
        let body = ErrorResponse {
            success: false,
            message,
            error_code: error_code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Authenticated owner of the request
#[derive(Debug, Clone)]
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or(ApiError::Unauthorized)
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "zippd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    Json(version_info())
}

/// Returned when a deployment is queued
#[derive(Debug, Serialize)]
pub struct Queued {
    pub deployment_id: String,
    pub status: DeploymentStatus,
}

pub async fn create_git_handler(
    State(state): State<Arc<ServerState>>,
    Owner(owner): Owner,
    Json(request): Json<GitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state
        .coordinator
        .submit_git_deployment(&owner, request)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        ApiResponse::ok(
            "Git deployment queued",
            Queued {
                deployment_id: submission.deployment_id,
                status: DeploymentStatus::Pending,
            },
        ),
    ))
}

pub async fn create_archive_handler(
    State(state): State<Arc<ServerState>>,
    Owner(owner): Owner,
    Query(request): Query<ArchiveRequest>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let submission = state
        .coordinator
        .submit_archive_deployment(&owner, &body, request)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        ApiResponse::ok(
            "ZIP deployment queued",
            Queued {
                deployment_id: submission.deployment_id,
                status: DeploymentStatus::Pending,
            },
        ),
    ))
}

pub async fn list_handler(
    State(state): State<Arc<ServerState>>,
    Owner(owner): Owner,
) -> Result<impl IntoResponse, ApiError> {
    let deployments = state.coordinator.list_deployments(&owner).await?;
    Ok(ApiResponse::ok(
        format!("{} deployments", deployments.len()),
        deployments,
    ))
}

pub async fn get_handler(
    State(state): State<Arc<ServerState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deployment = owned(&state, &owner, &id).await?;
    Ok(ApiResponse::ok("Deployment found", deployment))
}

pub async fn delete_handler(
    State(state): State<Arc<ServerState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    owned(&state, &owner, &id).await?;
    state.coordinator.delete_deployment(&id).await?;
    Ok(ApiResponse::ok("Deployment deleted", id))
}

pub async fn stop_handler(
    State(state): State<Arc<ServerState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    owned(&state, &owner, &id).await?;
    let deployment = state.coordinator.stop_deployment(&id).await?;
    Ok(ApiResponse::ok("Deployment stopped", deployment))
}

pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Owner(owner): Owner,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    owned(&state, &owner, &id).await?;
    let lines = state.coordinator.deployment_logs(&id).await?;
    Ok(ApiResponse::ok("Container logs", lines))
}

/// Fetch a deployment and check it belongs to `owner`
async fn owned(state: &ServerState, owner: &str, id: &str) -> Result<Deployment, ApiError> {
    let deployment = state
        .coordinator
        .get_deployment(id)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("Deployment {}", id)))?;
    if deployment.owner_id != owner {
        return Err(ApiError::Forbidden);
    }
    Ok(deployment)
}
