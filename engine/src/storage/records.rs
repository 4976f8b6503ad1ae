//! Deployment record store
//!
//! The coordinator persists every status change through [`RecordStore`].
//! Updates that would move a deployment outside the lifecycle transition
//! table are rejected here as well, so no writer can regress a record.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::deploy::fsm::DeploymentStatus;
use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::models::deployment::{Deployment, DeploymentPatch, NewDeployment};
use crate::utils::generate_uuid;

/// Log line appended to pipelines cut short by a restart
pub const INTERRUPTED_LOG: &str = "Deployment failed: interrupted by engine restart";

/// Persistent storage for deployment records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a PENDING record and return its id
    async fn create(&self, new: NewDeployment) -> Result<String, EngineError>;

    /// Merge `patch` into the record and return the result
    async fn update(&self, id: &str, patch: DeploymentPatch) -> Result<Deployment, EngineError>;

    async fn get(&self, id: &str) -> Result<Option<Deployment>, EngineError>;

    /// Records of `owner_id`, newest first
    async fn list(&self, owner_id: &str) -> Result<Vec<Deployment>, EngineError>;

    /// Returns false if there was nothing to delete
    async fn delete(&self, id: &str) -> Result<bool, EngineError>;
}

/// In-memory record store, optionally mirrored to a JSON file
pub struct MemoryRecordStore {
    records: RwLock<HashMap<String, Deployment>>,
    file: Option<File>,
}

impl MemoryRecordStore {
    /// Store that lives only as long as the process
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            file: None,
        }
    }

    /// Store mirrored to `file`, loading whatever it already holds.
    ///
    /// Records left mid-pipeline by a previous process are marked FAILED,
    /// since nothing will ever resume them.
    pub async fn persistent(file: File) -> Result<Self, EngineError> {
        let mut records: HashMap<String, Deployment> = HashMap::new();
        if file.exists().await {
            let stored: Vec<Deployment> = file
                .read_json()
                .await
                .map_err(|e| EngineError::StoreError(format!("Unable to load records: {}", e)))?;
            records = stored.into_iter().map(|d| (d.id.clone(), d)).collect();
        }

        let now = Utc::now();
        let mut interrupted = 0;
        for deployment in records.values_mut() {
            if deployment.status.can_transition_to(DeploymentStatus::Failed)
                && deployment.status != DeploymentStatus::Running
            {
                DeploymentPatch::status(DeploymentStatus::Failed)
                    .with_logs([INTERRUPTED_LOG])
                    .apply(deployment, now);
                interrupted += 1;
            }
        }
        info!(
            "Loaded {} deployment records from {} ({} interrupted)",
            records.len(),
            file.path().display(),
            interrupted
        );

        let store = Self {
            records: RwLock::new(records),
            file: Some(file),
        };
        if interrupted > 0 {
            let records = store.records.read().await;
            store.flush(&records).await?;
        }
        Ok(store)
    }

    async fn flush(&self, records: &HashMap<String, Deployment>) -> Result<(), EngineError> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut snapshot: Vec<&Deployment> = records.values().collect();
        snapshot.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        file.write_json_atomic(&snapshot)
            .await
            .map_err(|e| EngineError::StoreError(format!("Unable to persist records: {}", e)))
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, new: NewDeployment) -> Result<String, EngineError> {
        let now = Utc::now();
        let id = generate_uuid();
        let deployment = Deployment {
            id: id.clone(),
            owner_id: new.owner_id,
            name: new.name,
            description: new.description,
            deployment_type: new.source.deployment_type(),
            status: DeploymentStatus::Pending,
            source: new.source,
            checked_out_branch: None,
            image_tag: None,
            container_id: None,
            port: None,
            public_url: None,
            build_logs: new.build_logs,
            created_at: now,
            updated_at: now,
        };

        let mut records = self.records.write().await;
        records.insert(id.clone(), deployment);
        if let Err(e) = self.flush(&records).await {
            records.remove(&id);
            return Err(e);
        }
        debug!("Created deployment record {}", id);
        Ok(id)
    }

    async fn update(&self, id: &str, patch: DeploymentPatch) -> Result<Deployment, EngineError> {
        let mut records = self.records.write().await;
        let current = records
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("Deployment {}", id)))?;

        if let Some(next) = patch.status {
            if !current.status.can_transition_to(next) {
                warn!(
                    "Rejected update of {}: {} -> {}",
                    id, current.status, next
                );
                return Err(EngineError::InvalidTransition(format!(
                    "{} -> {}",
                    current.status, next
                )));
            }
        }

        let previous = current.clone();
        let mut updated = previous.clone();
        patch.apply(&mut updated, Utc::now());
        records.insert(id.to_string(), updated.clone());

        if let Err(e) = self.flush(&records).await {
            records.insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(updated)
    }

    async fn get(&self, id: &str) -> Result<Option<Deployment>, EngineError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<Deployment>, EngineError> {
        let records = self.records.read().await;
        let mut owned: Vec<Deployment> = records
            .values()
            .filter(|d| d.owner_id == owner_id)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(owned)
    }

    async fn delete(&self, id: &str) -> Result<bool, EngineError> {
        let mut records = self.records.write().await;
        let Some(removed) = records.remove(id) else {
            return Ok(false);
        };
        if let Err(e) = self.flush(&records).await {
            records.insert(id.to_string(), removed);
            return Err(e);
        }
        debug!("Deleted deployment record {}", id);
        Ok(true)
    }
}
