//! Operation Queue contract: deferred deployments keyed by deployment name and
//! dispatched task ids keyed by instance id.

use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FabrikResult;

/// A deferred dispatch, persisted as `bosh/deployments/<name>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedDeployment {
    pub plan_id: String,
    pub deployment_name: String,
    pub params: Value,
    pub args: Value,
}

#[async_trait::async_trait]
pub trait OperationQueue: Send + Sync {
    /// Store a deferred deployment. A second save for the same name is a no-op;
    /// returns whether a new entry was written.
    async fn save_deployment(&self, plan_id: &str, deployment_name: &str, params: &Value, args: &Value) -> FabrikResult<bool>;
    async fn contains_deployment(&self, deployment_name: &str) -> FabrikResult<bool>;
    async fn get_deployment_by_name(&self, deployment_name: &str) -> FabrikResult<Option<QueuedDeployment>>;
    async fn delete_deployment_from_cache(&self, deployment_name: &str) -> FabrikResult<()>;
    async fn save_bosh_task(&self, instance_id: &str, task_id: &str) -> FabrikResult<()>;
    async fn get_bosh_task(&self, instance_id: &str) -> FabrikResult<Option<String>>;
    /// True when exactly one queued deployment name ends with `instance_id`.
    async fn contains_service_instance(&self, instance_id: &str) -> FabrikResult<bool>;
    async fn delete_bosh_task(&self, instance_id: &str) -> FabrikResult<()>;
    /// Queued deployment names, oldest first.
    async fn get_deployment_names(&self) -> FabrikResult<Vec<String>>;
}

#[derive(Default)]
struct Inner {
    deployments: Vec<QueuedDeployment>,
    tasks: FxHashMap<String, String>,
}

/// In-process queue. State lives only as long as the process.
#[derive(Default)]
pub struct MemoryOperationQueue {
    inner: Mutex<Inner>,
}

impl MemoryOperationQueue {
    pub fn new() -> Self { Self::default() }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }
}

#[async_trait::async_trait]
impl OperationQueue for MemoryOperationQueue {
    async fn save_deployment(&self, plan_id: &str, deployment_name: &str, params: &Value, args: &Value) -> FabrikResult<bool> {
        Ok(self.with(|i| {
            if i.deployments.iter().any(|d| d.deployment_name == deployment_name) {
                return false;
            }
            i.deployments.push(QueuedDeployment {
                plan_id: plan_id.to_string(),
                deployment_name: deployment_name.to_string(),
                params: params.clone(),
                args: args.clone(),
            });
            true
        }))
    }

    async fn contains_deployment(&self, deployment_name: &str) -> FabrikResult<bool> {
        Ok(self.with(|i| i.deployments.iter().any(|d| d.deployment_name == deployment_name)))
    }

    async fn get_deployment_by_name(&self, deployment_name: &str) -> FabrikResult<Option<QueuedDeployment>> {
        Ok(self.with(|i| i.deployments.iter().find(|d| d.deployment_name == deployment_name).cloned()))
    }

    async fn delete_deployment_from_cache(&self, deployment_name: &str) -> FabrikResult<()> {
        self.with(|i| i.deployments.retain(|d| d.deployment_name != deployment_name));
        Ok(())
    }

    async fn save_bosh_task(&self, instance_id: &str, task_id: &str) -> FabrikResult<()> {
        self.with(|i| i.tasks.insert(instance_id.to_string(), task_id.to_string()));
        Ok(())
    }

    async fn get_bosh_task(&self, instance_id: &str) -> FabrikResult<Option<String>> {
        Ok(self.with(|i| i.tasks.get(instance_id).cloned()))
    }

    async fn contains_service_instance(&self, instance_id: &str) -> FabrikResult<bool> {
        Ok(self.with(|i| i.deployments.iter().filter(|d| d.deployment_name.ends_with(instance_id)).count() == 1))
    }

    async fn delete_bosh_task(&self, instance_id: &str) -> FabrikResult<()> {
        self.with(|i| i.tasks.remove(instance_id));
        Ok(())
    }

    async fn get_deployment_names(&self) -> FabrikResult<Vec<String>> {
        Ok(self.with(|i| i.deployments.iter().map(|d| d.deployment_name.clone()).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn save_is_idempotent_per_name() {
        let q = MemoryOperationQueue::new();
        assert!(q.save_deployment("p", "sf-0001-abc", &json!({}), &json!({})).await.expect("save"));
        assert!(!q.save_deployment("p", "sf-0001-abc", &json!({"x": 1}), &json!({})).await.expect("save"));
        assert_eq!(q.get_deployment_names().await.expect("names"), vec!["sf-0001-abc".to_string()]);
        let entry = q.get_deployment_by_name("sf-0001-abc").await.expect("get").expect("present");
        assert_eq!(entry.params, json!({}));
    }

    #[tokio::test]
    async fn instance_lookup_and_tasks() {
        let q = MemoryOperationQueue::new();
        q.save_deployment("p", "sf-0001-abc", &json!({}), &json!({})).await.expect("save");
        assert!(q.contains_service_instance("abc").await.expect("contains"));
        assert!(!q.contains_service_instance("zzz").await.expect("contains"));
        q.save_bosh_task("abc", "sf-0001-abc_12").await.expect("task");
        assert_eq!(q.get_bosh_task("abc").await.expect("get").as_deref(), Some("sf-0001-abc_12"));
        q.delete_bosh_task("abc").await.expect("del");
        q.delete_deployment_from_cache("sf-0001-abc").await.expect("del");
        assert!(q.get_bosh_task("abc").await.expect("get").is_none());
        assert!(!q.contains_deployment("sf-0001-abc").await.expect("contains"));
    }
}
