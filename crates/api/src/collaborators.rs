//! Narrow interfaces to the systems the lifecycle calls out to.
//!
//! Every method has a default so deployments only implement what they have.
//! [`Noop`] implements all of them with the defaults.

use std::sync::Arc;

use fabrik_core::{FabrikError, FabrikResult};
use serde_json::Value;

pub const FEATURE_BACKUP: &str = "backup";
pub const FEATURE_DEPROVISION: &str = "lifecycle.deprovision";

/// The agent running inside a deployment.
#[async_trait::async_trait]
pub trait ServiceAgent: Send + Sync {
    fn supports(&self, _feature: &str) -> bool { false }

    async fn deprovision(&self, deployment_name: &str) -> FabrikResult<()> {
        Err(FabrikError::FeatureNotSupported(format!("deprovision of '{}'", deployment_name)))
    }

    async fn create_credentials(&self, deployment_name: &str, _binding_id: &str, _parameters: &Value) -> FabrikResult<Value> {
        Err(FabrikError::FeatureNotSupported(format!("credentials for '{}'", deployment_name)))
    }

    async fn delete_credentials(&self, deployment_name: &str, _credentials: &Value) -> FabrikResult<()> {
        Err(FabrikError::FeatureNotSupported(format!("credentials for '{}'", deployment_name)))
    }
}

/// Platform-specific steps around each lifecycle operation.
#[async_trait::async_trait]
pub trait PlatformHooks: Send + Sync {
    async fn post_instance_provision(&self, _instance_id: &str, _context: &Value) -> FabrikResult<()> { Ok(()) }
    async fn post_instance_update(&self, _instance_id: &str, _context: &Value) -> FabrikResult<()> { Ok(()) }
    async fn pre_instance_delete(&self, _instance_id: &str, _context: &Value) -> FabrikResult<()> { Ok(()) }
    async fn pre_bind(&self, _binding_id: &str, _context: &Value) -> FabrikResult<()> { Ok(()) }
    async fn post_bind(&self, _binding_id: &str, _context: &Value) -> FabrikResult<()> { Ok(()) }
    async fn pre_unbind(&self, _binding_id: &str) -> FabrikResult<()> { Ok(()) }
}

/// Periodic job scheduling.
#[async_trait::async_trait]
pub trait Scheduler: Send + Sync {
    async fn schedule_auto_update(&self, _instance_id: &str) -> FabrikResult<()> { Ok(()) }
    async fn schedule_backup(&self, _instance_id: &str) -> FabrikResult<()> { Ok(()) }
}

#[async_trait::async_trait]
pub trait BackupStore: Send + Sync {
    async fn delete_restore_file(&self, _instance_id: &str, _plan_id: &str) -> FabrikResult<()> { Ok(()) }
}

/// Collaborator that does nothing and supports no agent feature.
#[derive(Debug, Clone, Copy, Default)]
pub struct Noop;

impl ServiceAgent for Noop {}
impl PlatformHooks for Noop {}
impl Scheduler for Noop {}
impl BackupStore for Noop {}

#[derive(Clone)]
pub struct Collaborators {
    pub agent: Arc<dyn ServiceAgent>,
    pub hooks: Arc<dyn PlatformHooks>,
    pub scheduler: Arc<dyn Scheduler>,
    pub backups: Arc<dyn BackupStore>,
}

impl Default for Collaborators {
    fn default() -> Self { Self { agent: Arc::new(Noop), hooks: Arc::new(Noop), scheduler: Arc::new(Noop), backups: Arc::new(Noop) } }
}
