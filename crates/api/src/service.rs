//! Operation lifecycle for director-backed service instances.
//!
//! `create`/`update` go through admission and may end up queued; `last_operation`
//! follows the dispatched director task (or the queue while none exists) and runs
//! cleanup plus the finalize hook once the task is terminal.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{SecondsFormat, TimeZone, Utc};
use fabrik_core::config::DeploymentSettings;
use fabrik_core::deployment::{IndexPool, NameGrammar};
use fabrik_core::operation::{Operation, OperationParams, OperationState, OperationType};
use fabrik_core::resource::{ResourceState, BIND_GROUP, DIRECTOR_BIND_TYPE};
use fabrik_core::{FabrikError, FabrikResult};
use fabrik_ops::{retry_if, retry_with_delay, Dispatcher, DirectorTask, RetryConfig};
use fabrik_store::{NewResource, ResourceStore, ResourceUpdate};
use metrics::counter;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::collaborators::{Collaborators, FEATURE_BACKUP, FEATURE_DEPROVISION};

pub const PLATFORM_CONTEXT_PROPERTY: &str = "platform-context";

/// Input of a bind call.
#[derive(Debug, Clone, Default)]
pub struct BindRequest {
    pub binding_id: String,
    pub parameters: Value,
    pub context: Value,
}

pub struct DirectorService {
    dispatcher: Arc<Dispatcher>,
    store: Arc<ResourceStore>,
    collaborators: Collaborators,
    grammar: NameGrammar,
    pool: IndexPool,
    retry: RetryConfig,
}

fn task_timestamp(task: &DirectorTask) -> String {
    task.timestamp
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Translate a director task into the operation's state and description.
pub fn set_operation_state(op: &mut Operation, task: &DirectorTask) {
    let action = op.kind.action();
    let deployment = task.deployment.clone().or_else(|| op.deployment_name.clone()).unwrap_or_default();
    match task.state.as_str() {
        "done" => op.set_state(
            OperationState::Succeeded,
            ResourceState::Succeeded,
            format!("{} deployment {} succeeded at {}", action, deployment, task_timestamp(task)),
        ),
        "error" | "cancelled" | "timeout" => op.set_state(
            OperationState::Failed,
            ResourceState::Failed,
            format!(
                "{} deployment {} failed at {} with Error \"{}\"",
                action,
                deployment,
                task_timestamp(task),
                task.result.as_deref().unwrap_or_default()
            ),
        ),
        _ => op.set_state(OperationState::InProgress, ResourceState::InProgress, format!("{} deployment {} is still in progress", action, deployment)),
    }
    op.deployment_name = Some(deployment);
}

impl DirectorService {
    pub fn new(dispatcher: Arc<Dispatcher>, store: Arc<ResourceStore>, deployment: &DeploymentSettings, collaborators: Collaborators) -> FabrikResult<Self> {
        Ok(Self {
            dispatcher,
            store,
            collaborators,
            grammar: NameGrammar::new(&deployment.prefix, deployment.subnet.as_deref())?,
            pool: deployment.index_pool(),
            retry: RetryConfig::bounded(),
        })
    }

    /// Delay and attempt budget for property writes and credential calls.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> { &self.dispatcher }

    pub fn grammar(&self) -> &NameGrammar { &self.grammar }

    /// Live deployment names followed by queued ones, without duplicates.
    async fn known_deployment_names(&self) -> FabrikResult<Vec<String>> {
        let live = self.dispatcher.director().deployment_names().await?;
        let queued = self.dispatcher.queue().get_deployment_names().await?;
        let mut seen = BTreeSet::new();
        Ok(live.into_iter().chain(queued).filter(|n| seen.insert(n.clone())).collect())
    }

    /// Lowest free network segment index across live and queued deployments.
    pub async fn acquire_network_segment_index(&self, instance_id: &str) -> FabrikResult<u32> {
        let names = self.known_deployment_names().await?;
        if names.iter().any(|n| n.ends_with(instance_id)) {
            warn!(instance_id = %instance_id, "deployment with this instance id already exists");
            return Err(FabrikError::ServiceInstanceAlreadyExists(instance_id.to_string()));
        }
        let index = self.pool.find_free(&self.grammar, names.iter().map(String::as_str))?;
        info!(instance_id = %instance_id, index, "acquired network segment index");
        Ok(index)
    }

    pub async fn find_deployment_name(&self, instance_id: &str) -> FabrikResult<String> {
        self.known_deployment_names()
            .await?
            .into_iter()
            .find(|n| n.ends_with(instance_id))
            .ok_or_else(|| FabrikError::ServiceInstanceNotFound(instance_id.to_string()))
    }

    async fn create_or_update(&self, kind: OperationType, instance_id: &str, deployment_name: String, params: &OperationParams) -> FabrikResult<Operation> {
        let mut op = Operation::new(kind);
        op.parameters = params.parameters.clone();
        op.context = params.context.clone();
        match self.dispatcher.create_or_update(&deployment_name, instance_id, params).await {
            Ok(outcome) => {
                op.task_id = outcome.task_id;
                op.cached = outcome.cached;
            }
            Err(FabrikError::DirectorServiceUnavailable(msg)) => {
                warn!(instance_id = %instance_id, action = %kind, error = %msg, "director unavailable; operation left without a task");
            }
            Err(e) => return Err(e),
        }
        op.deployment_name = Some(deployment_name);
        counter!("lifecycle_operation_total", 1u64, "op" => kind.as_str());
        Ok(op)
    }

    pub async fn create(&self, instance_id: &str, params: &OperationParams) -> FabrikResult<Operation> {
        let index = self.acquire_network_segment_index(instance_id).await?;
        let name = self.grammar.format(index, instance_id);
        let mut params = params.clone();
        params.previous_values = None;
        self.create_or_update(OperationType::Create, instance_id, name, &params).await
    }

    pub async fn update(&self, instance_id: &str, params: &OperationParams) -> FabrikResult<Operation> {
        let name = self.find_deployment_name(instance_id).await?;
        let mut params = params.clone();
        if !matches!(params.previous_values, Some(Value::Object(_))) {
            params.previous_values = Some(Value::Object(Map::new()));
        }
        debug!(instance_id = %instance_id, parameters = %params.parameters, "update parameters");
        self.create_or_update(OperationType::Update, instance_id, name, &params).await
    }

    pub async fn delete(&self, instance_id: &str, params: &OperationParams) -> FabrikResult<Operation> {
        let name = self.find_deployment_name(instance_id).await?;
        let c = &self.collaborators;
        if let Err(e) = c.hooks.pre_instance_delete(instance_id, &params.context).await {
            warn!(instance_id = %instance_id, error = %e, "pre-delete hook failed");
        }
        if c.agent.supports(FEATURE_BACKUP) {
            if let Err(e) = c.backups.delete_restore_file(instance_id, &params.plan_id).await {
                warn!(instance_id = %instance_id, error = %e, "failed to delete restore file");
            }
        }
        if c.agent.supports(FEATURE_DEPROVISION) {
            match c.agent.deprovision(&name).await {
                Ok(()) => {}
                Err(FabrikError::FeatureNotSupported(_)) | Err(FabrikError::ServiceInstanceNotOperational(_)) => {
                    debug!(deployment = %name, "agent deprovision skipped");
                }
                Err(e) => return Err(e),
            }
        }
        let task_id = self.dispatcher.director().delete_deployment(&name).await.map_err(|e| match e {
            FabrikError::NotFound(_) => FabrikError::ServiceInstanceNotFound(instance_id.to_string()),
            other => other,
        })?;
        info!(deployment = %name, task_id = %task_id, "delete deployment scheduled");
        counter!("lifecycle_operation_total", 1u64, "op" => "delete");
        let mut op = Operation::new(OperationType::Delete);
        op.task_id = Some(task_id);
        op.context = params.context.clone();
        op.deployment_name = Some(name);
        Ok(op)
    }

    /// Current state of `op`. Terminal director tasks trigger queue cleanup and finalize.
    pub async fn last_operation(&self, instance_id: &str, op: &Operation) -> FabrikResult<Operation> {
        let mut op = op.clone();
        if op.task_id.is_none() {
            // A queued entry outranks any task mapping left by an earlier operation.
            let queued = self.dispatcher.queued_state(instance_id).await?;
            if queued.cached {
                op.cached = true;
                let desc = format!("{} deployment is still in progress", op.kind.action());
                op.set_state(OperationState::InProgress, ResourceState::Waiting, desc);
                return Ok(op);
            }
            match queued.task_id {
                Some(task_id) => op.task_id = Some(task_id),
                None => {
                    return Err(FabrikError::InternalServerError(format!("no task and no queue entry for instance {}", instance_id)));
                }
            }
        }
        let task_id = op.task_id.clone().unwrap_or_default();
        let task = self.dispatcher.director().get_task(&task_id).await.map_err(|e| match e {
            FabrikError::NotFound(_) => FabrikError::ServiceInstanceNotFound(instance_id.to_string()),
            other => other,
        })?;
        let deployment = task.deployment.clone().unwrap_or_default();
        if !deployment.ends_with(instance_id) {
            return Err(FabrikError::InternalServerError(format!("deployment '{}' must end with '{}'", deployment, instance_id)));
        }
        set_operation_state(&mut op, &task);
        if op.is_in_progress() {
            return Ok(op);
        }
        if let Err(e) = self.dispatcher.cleanup(&deployment, instance_id).await {
            warn!(deployment = %deployment, error = %e, "cleanup failed; reporting terminal state anyway");
        }
        let op = self.finalize(instance_id, op).await;
        if op.kind == OperationType::Create && op.state == Some(OperationState::Failed) {
            match self.dispatcher.director().delete_deployment(&deployment).await {
                Ok(task_id) => info!(deployment = %deployment, task_id = %task_id, "failed create; deployment deletion scheduled"),
                Err(e) => warn!(deployment = %deployment, error = %e, "failed create; could not delete deployment"),
            }
        }
        Ok(op)
    }

    /// Type-specific completion steps. A failing step marks the operation failed.
    pub async fn finalize(&self, instance_id: &str, mut op: Operation) -> Operation {
        let name = op.deployment_name.clone().unwrap_or_default();
        let succeeded = op.state == Some(OperationState::Succeeded);
        let res = match op.kind {
            OperationType::Create => self.finalize_create(instance_id, &name, &op.context, succeeded).await,
            OperationType::Update => self.collaborators.hooks.post_instance_update(instance_id, &op.context).await,
            _ => Ok(()),
        };
        if let Err(e) = res {
            warn!(deployment = %name, error = %e, "finalize failed");
            op.set_state(
                OperationState::Failed,
                ResourceState::Failed,
                format!("{} deployment '{}' not yet completely succeeded because \"{}\"", op.kind.action(), name, e.message()),
            );
        }
        op
    }

    async fn finalize_create(&self, instance_id: &str, name: &str, context: &Value, succeeded: bool) -> FabrikResult<()> {
        if succeeded {
            let value = serde_json::to_string(context).map_err(|e| FabrikError::InternalServerError(format!("encoding platform context: {}", e)))?;
            let director = self.dispatcher.director();
            retry_with_delay(&self.retry, "create_deployment_property", || director.create_deployment_property(name, PLATFORM_CONTEXT_PROPERTY, &value)).await?;
        }
        self.collaborators.hooks.post_instance_provision(instance_id, context).await?;
        if succeeded {
            self.collaborators.scheduler.schedule_auto_update(instance_id).await?;
        }
        Ok(())
    }

    /// Create credentials and record them in a bind resource.
    pub async fn bind(&self, instance_id: &str, req: &BindRequest) -> FabrikResult<Value> {
        let c = &self.collaborators;
        c.hooks.pre_bind(&req.binding_id, &req.context).await?;
        let name = self.find_deployment_name(instance_id).await?;
        let credentials = retry_with_delay(&self.retry, "create_credentials", || c.agent.create_credentials(&name, &req.binding_id, &req.parameters)).await?;
        c.hooks.post_bind(&req.binding_id, &req.context).await?;
        self.store_binding(instance_id, &req.binding_id, &name, &credentials).await?;
        info!(deployment = %name, binding_id = %req.binding_id, "binding created");
        if let Err(e) = c.scheduler.schedule_backup(instance_id).await {
            warn!(instance_id = %instance_id, error = %e, "could not schedule backup");
        }
        Ok(credentials)
    }

    async fn store_binding(&self, instance_id: &str, binding_id: &str, deployment_name: &str, credentials: &Value) -> FabrikResult<()> {
        let namespace = Some(self.store.namespaces().resolve(instance_id));
        let mut status = Map::new();
        status.insert("state".into(), json!(ResourceState::Succeeded.as_str()));
        status.insert("response".into(), json!({ "deployment_name": deployment_name, "credentials": credentials }));
        let new = NewResource {
            id: binding_id.to_string(),
            namespace: namespace.clone(),
            options: json!({ "binding_id": binding_id, "instance_id": instance_id }),
            status: Some(status.clone()),
            ..Default::default()
        };
        match self.store.create(BIND_GROUP, DIRECTOR_BIND_TYPE, new).await {
            Ok(_) => Ok(()),
            Err(FabrikError::Conflict(_)) => {
                let update = ResourceUpdate { namespace, status: Some(status), ..Default::default() };
                self.store.patch(BIND_GROUP, DIRECTOR_BIND_TYPE, binding_id, update).await.map(|_| ())
            }
            Err(e) => Err(e),
        }
    }

    /// Credentials stored for `binding_id`. `NotFound` is not retried.
    pub async fn get_credentials(&self, instance_id: &str, binding_id: &str) -> FabrikResult<Value> {
        let namespace = self.store.namespaces().resolve(instance_id);
        let resource = retry_if(&self.retry, "get_credentials", |e: &FabrikError| !e.is_not_found(), || {
            self.store.get(BIND_GROUP, DIRECTOR_BIND_TYPE, binding_id, Some(&namespace))
        })
        .await?;
        resource
            .response()
            .and_then(|r| r.get("credentials"))
            .cloned()
            .ok_or_else(|| FabrikError::NotFound(format!("credentials of binding {}", binding_id)))
    }

    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> FabrikResult<()> {
        let c = &self.collaborators;
        c.hooks.pre_unbind(binding_id).await?;
        let name = self.find_deployment_name(instance_id).await?;
        let credentials = self.get_credentials(instance_id, binding_id).await?;
        retry_with_delay(&self.retry, "delete_credentials", || c.agent.delete_credentials(&name, &credentials)).await?;
        let namespace = self.store.namespaces().resolve(instance_id);
        self.store.delete(BIND_GROUP, DIRECTOR_BIND_TYPE, binding_id, Some(&namespace)).await?;
        info!(deployment = %name, binding_id = %binding_id, "binding deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(state: &str, result: Option<&str>) -> DirectorTask {
        DirectorTask {
            id: 7,
            state: state.into(),
            description: String::new(),
            timestamp: Some(1_600_000_000),
            result: result.map(str::to_string),
            deployment: Some("service-fabrik-0001-abc".into()),
            context_id: None,
        }
    }

    #[test]
    fn done_task_succeeds() {
        let mut op = Operation::new(OperationType::Create);
        set_operation_state(&mut op, &task("done", None));
        assert_eq!(op.state, Some(OperationState::Succeeded));
        assert_eq!(op.resource_state, Some(ResourceState::Succeeded));
        assert_eq!(op.description.as_deref(), Some("Create deployment service-fabrik-0001-abc succeeded at 2020-09-13T12:26:40.000Z"));
    }

    #[test]
    fn error_states_fail_with_result() {
        for state in ["error", "cancelled", "timeout"] {
            let mut op = Operation::new(OperationType::Update);
            set_operation_state(&mut op, &task(state, Some("vm crashed")));
            assert_eq!(op.state, Some(OperationState::Failed));
            assert!(op.description.as_deref().unwrap_or_default().ends_with("with Error \"vm crashed\""));
        }
    }

    #[test]
    fn other_states_are_in_progress() {
        let mut op = Operation::new(OperationType::Delete);
        set_operation_state(&mut op, &task("processing", None));
        assert!(op.is_in_progress());
        assert_eq!(op.description.as_deref(), Some("Delete deployment service-fabrik-0001-abc is still in progress"));
    }
}
