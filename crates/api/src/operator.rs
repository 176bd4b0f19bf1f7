//! Resource-driven operator: requests recorded as `directors` resources are
//! processed by state, and in-flight operations are polled to completion.

use std::sync::Arc;
use std::time::Duration;

use fabrik_core::operation::{Operation, OperationParams, OperationState, OperationType};
use fabrik_core::resource::{Resource, ResourceState, DEPLOYMENT_GROUP, DIRECTOR_TYPE};
use fabrik_core::{FabrikError, FabrikResult};
use fabrik_store::{EventKind, ResourceStore, ResourceUpdate, WatchEvent};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::service::DirectorService;

/// States a request is picked up in.
pub const REQUEST_STATES: [ResourceState; 3] = [ResourceState::InQueue, ResourceState::Update, ResourceState::Delete];

/// States of operations awaiting completion.
pub const POLLED_STATES: [ResourceState; 2] = [ResourceState::InProgress, ResourceState::Waiting];

fn params_of(resource: &Resource) -> FabrikResult<OperationParams> {
    match resource.options() {
        None | Some(Value::Null) => Ok(OperationParams::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| FabrikError::BadRequest(format!("options of '{}' are not operation parameters: {}", resource.metadata.name, e))),
    }
}

fn last_operation_json(op: &Operation) -> Value {
    json!({ "type": op.kind, "state": op.state, "description": op.description })
}

fn failed_status(kind: Option<OperationType>, err: &FabrikError) -> Map<String, Value> {
    let state = if kind == Some(OperationType::Delete) { ResourceState::DeleteFailed } else { ResourceState::Failed };
    let mut status = Map::new();
    status.insert("state".into(), json!(state.as_str()));
    status.insert("lastOperation".into(), json!({ "type": kind, "state": OperationState::Failed, "description": err.message() }));
    status.insert("error".into(), err.to_error_json());
    status
}

async fn write_status(store: &ResourceStore, resource: &Resource, status: Map<String, Value>) -> FabrikResult<()> {
    let update = ResourceUpdate { namespace: resource.metadata.namespace.clone(), status: Some(status), ..Default::default() };
    store.update(DEPLOYMENT_GROUP, DIRECTOR_TYPE, &resource.metadata.name, update).await.map(|_| ())
}

async fn delete_resource(store: &ResourceStore, resource: &Resource) -> FabrikResult<()> {
    store.delete(DEPLOYMENT_GROUP, DIRECTOR_TYPE, &resource.metadata.name, resource.metadata.namespace.as_deref()).await
}

pub struct DeploymentOperator {
    service: Arc<DirectorService>,
    store: Arc<ResourceStore>,
}

impl DeploymentOperator {
    pub fn new(service: Arc<DirectorService>, store: Arc<ResourceStore>) -> Self { Self { service, store } }

    /// Start the operation a resource asks for and record the result in its status.
    pub async fn process_request(&self, resource: &Resource) -> FabrikResult<()> {
        let id = resource.metadata.name.as_str();
        let kind = match resource.state() {
            Some(ResourceState::InQueue) => OperationType::Create,
            Some(ResourceState::Update) => OperationType::Update,
            Some(ResourceState::Delete) => OperationType::Delete,
            other => {
                debug!(id = %id, state = ?other, "nothing to process");
                return Ok(());
            }
        };
        let res = match params_of(resource) {
            Ok(params) => match kind {
                OperationType::Create => self.service.create(id, &params).await,
                OperationType::Update => self.service.update(id, &params).await,
                _ => self.service.delete(id, &params).await,
            },
            Err(e) => Err(e),
        };
        match res {
            Ok(op) => {
                let state = if op.task_id.is_some() { ResourceState::InProgress } else { ResourceState::Waiting };
                let mut status = Map::new();
                status.insert("response".into(), serde_json::to_value(&op).map_err(|e| FabrikError::InternalServerError(e.to_string()))?);
                status.insert("state".into(), json!(state.as_str()));
                info!(id = %id, action = %kind, state = %state, "request processed");
                write_status(&self.store, resource, status).await
            }
            Err(FabrikError::ServiceInstanceNotFound(_)) if kind == OperationType::Delete => {
                info!(id = %id, "instance already gone; removing resource");
                delete_resource(&self.store, resource).await
            }
            Err(e) => {
                error!(id = %id, action = %kind, error = %e, "request failed");
                write_status(&self.store, resource, failed_status(Some(kind), &e)).await
            }
        }
    }

    /// Process every resource currently waiting in a request state.
    pub async fn process_pending(&self) -> FabrikResult<usize> {
        let pending = self.store.list_by_state(DEPLOYMENT_GROUP, DIRECTOR_TYPE, &REQUEST_STATES).await?;
        for r in &pending {
            if let Err(e) = self.process_request(r).await {
                warn!(id = %r.metadata.name, error = %e, "could not record request outcome");
            }
        }
        Ok(pending.len())
    }

    /// Watch request states and process each added or modified resource.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        let (tx, mut rx) = mpsc::channel::<WatchEvent>(64);
        let names: Vec<&str> = REQUEST_STATES.iter().map(ResourceState::as_str).collect();
        let selector = format!("{} in ({})", fabrik_core::resource::STATE_LABEL, names.join(","));
        let watch = self.store.spawn_watch(DEPLOYMENT_GROUP, DIRECTOR_TYPE, Some(selector), tx);
        tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                if ev.kind == EventKind::Deleted {
                    continue;
                }
                if let Err(e) = me.process_request(&ev.resource).await {
                    warn!(id = %ev.resource.metadata.name, error = %e, "could not record request outcome");
                }
            }
            watch.abort();
        })
    }
}

pub struct TaskStatusPoller {
    service: Arc<DirectorService>,
    store: Arc<ResourceStore>,
    interval: Duration,
}

impl TaskStatusPoller {
    pub fn new(service: Arc<DirectorService>, store: Arc<ResourceStore>, interval: Duration) -> Self { Self { service, store, interval } }

    /// Query the last operation recorded in `status.response` and write its outcome.
    pub async fn poll_once(&self, resource: &Resource) -> FabrikResult<()> {
        let id = resource.metadata.name.as_str();
        let op: Operation = resource
            .response()
            .cloned()
            .ok_or_else(|| FabrikError::InternalServerError(format!("resource '{}' has no operation response", id)))
            .and_then(|v| serde_json::from_value(v).map_err(|e| FabrikError::InternalServerError(format!("operation response of '{}': {}", id, e))))?;
        let kind = op.kind;
        let op = match self.service.last_operation(id, &op).await {
            Ok(op) => op,
            Err(FabrikError::ServiceInstanceNotFound(_)) if kind == OperationType::Delete => {
                info!(id = %id, "deployment gone; removing resource");
                return delete_resource(&self.store, resource).await;
            }
            Err(e) => {
                error!(id = %id, action = %kind, error = %e, "last operation failed");
                return write_status(&self.store, resource, failed_status(Some(kind), &e)).await;
            }
        };
        let mut status = Map::new();
        status.insert("lastOperation".into(), last_operation_json(&op));
        match op.state {
            Some(OperationState::Succeeded) if kind == OperationType::Delete => {
                info!(id = %id, "delete succeeded; removing resource");
                return delete_resource(&self.store, resource).await;
            }
            Some(OperationState::Succeeded) => {
                status.insert("state".into(), json!(ResourceState::Succeeded.as_str()));
                status.insert("appliedOptions".into(), resource.options().cloned().unwrap_or(Value::Null));
            }
            Some(OperationState::Failed) => {
                let state = if kind == OperationType::Delete { ResourceState::DeleteFailed } else { ResourceState::Failed };
                status.insert("state".into(), json!(state.as_str()));
            }
            _ => {
                let state = op.resource_state.unwrap_or(ResourceState::InProgress);
                status.insert("state".into(), json!(state.as_str()));
                status.insert("response".into(), serde_json::to_value(&op).map_err(|e| FabrikError::InternalServerError(e.to_string()))?);
            }
        }
        write_status(&self.store, resource, status).await
    }

    /// One pass over every in-flight resource.
    pub async fn poll_all(&self) -> FabrikResult<usize> {
        let in_flight = self.store.list_by_state(DEPLOYMENT_GROUP, DIRECTOR_TYPE, &POLLED_STATES).await?;
        for r in &in_flight {
            if let Err(e) = self.poll_once(r).await {
                warn!(id = %r.metadata.name, error = %e, "task status poll failed");
            }
        }
        Ok(in_flight.len())
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(me.interval);
            loop {
                tick.tick().await;
                if let Err(e) = me.poll_all().await {
                    error!(error = %e, "task status round failed");
                }
            }
        })
    }
}
