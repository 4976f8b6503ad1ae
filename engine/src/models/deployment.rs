//! Deployment records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deploy::fsm::DeploymentStatus;

/// How the source of a deployment was submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentType {
    Git,
    Archive,
}

/// Where the project tree comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceRef {
    /// A git repository and the requested branch
    Git { repo_url: String, branch: String },

    /// An uploaded archive, stored on local disk until the pipeline ends
    Archive { path: String },
}

impl SourceRef {
    pub fn deployment_type(&self) -> DeploymentType {
        match self {
            SourceRef::Git { .. } => DeploymentType::Git,
            SourceRef::Archive { .. } => DeploymentType::Archive,
        }
    }
}

/// A deployment as persisted in the record store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,

    pub owner_id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub deployment_type: DeploymentType,

    pub status: DeploymentStatus,

    pub source: SourceRef,

    /// Branch actually checked out, which differs from the requested one
    /// when the clone fell back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_out_branch: Option<String>,

    /// Image built for this deployment, removed along with it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,

    /// External (host) port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,

    #[serde(default)]
    pub build_logs: Vec<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a deployment record is first created
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub owner_id: String,
    pub name: String,
    pub description: Option<String>,
    pub source: SourceRef,
    pub build_logs: Vec<String>,
}

/// A partial update with merge semantics
///
/// `None` leaves a field untouched, `append_logs` is appended to the existing
/// log lines. `clear_port` drops the assigned port after it has been released.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentPatch {
    pub status: Option<DeploymentStatus>,
    pub checked_out_branch: Option<String>,
    pub image_tag: Option<String>,
    pub container_id: Option<String>,
    pub port: Option<u16>,
    pub clear_port: bool,
    pub public_url: Option<String>,
    pub append_logs: Vec<String>,
}

impl DeploymentPatch {
    pub fn status(status: DeploymentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_logs<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.append_logs.extend(lines.into_iter().map(Into::into));
        self
    }

    /// Merge this patch into `deployment`, stamping `updated_at`
    pub fn apply(self, deployment: &mut Deployment, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            deployment.status = status;
        }
        if let Some(branch) = self.checked_out_branch {
            deployment.checked_out_branch = Some(branch);
        }
        if let Some(tag) = self.image_tag {
            deployment.image_tag = Some(tag);
        }
        if let Some(container_id) = self.container_id {
            deployment.container_id = Some(container_id);
        }
        if self.clear_port {
            deployment.port = None;
            deployment.public_url = None;
        }
        if let Some(port) = self.port {
            deployment.port = Some(port);
        }
        if let Some(url) = self.public_url {
            deployment.public_url = Some(url);
        }
        deployment.build_logs.extend(self.append_logs);
        deployment.updated_at = now;
    }
}
