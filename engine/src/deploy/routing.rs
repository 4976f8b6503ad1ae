//! Public URL provisioning

use async_trait::async_trait;

use crate::errors::EngineError;

/// Makes a deployment reachable from outside the host
#[async_trait]
pub trait PublicRouter: Send + Sync {
    /// Route public traffic to `external_port` and return the public URL
    async fn provision(&self, deployment_id: &str, external_port: u16) -> Result<String, EngineError>;

    /// Remove whatever `provision` set up. Unknown ids are not an error.
    async fn withdraw(&self, deployment_id: &str) -> Result<(), EngineError>;
}

/// URL used when no router is configured
pub fn direct_url(public_host: &str, port: u16) -> String {
    format!("http://{}:{}", public_host, port)
}
