//! Fabrik Resource Store: typed CRUD, watch and state polling over a `ResourceApi`.
//!
//! Every `spec` / `status` field is encoded independently on write and decoded
//! best-effort on read (see `fabrik_core::codec`). A `state` written into `status`
//! is mirrored into the `state` label so selectors can filter on it.

#![forbid(unsafe_code)]

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use fabrik_core::codec;
use fabrik_core::config::ApiServerSettings;
use fabrik_core::resource::{last_operation_label, Resource, ResourceRegistry, ResourceState, ResourceType, STATE_LABEL};
use fabrik_core::{FabrikError, FabrikResult};
pub use fabrik_kubehub::{EventKind, ListQuery, ResourceApi};
use futures::TryStreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use memory::MemoryResourceApi;

/// Resolves the namespace a resource id lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespacePolicy {
    pub prefix: String,
    pub namespaced_separation: bool,
    pub services_namespace: Option<String>,
    pub default_namespace: String,
}

impl NamespacePolicy {
    pub fn from_settings(s: &ApiServerSettings) -> Self {
        Self {
            prefix: s.namespace_prefix.clone(),
            namespaced_separation: s.enable_namespaced_separation,
            services_namespace: s.services_namespace.clone(),
            default_namespace: s.default_namespace.clone(),
        }
    }

    /// `<prefix>-<id>` when separation is on, else the shared services namespace,
    /// else the process default.
    pub fn resolve(&self, id: &str) -> String {
        if self.namespaced_separation {
            format!("{}-{}", self.prefix, id)
        } else if let Some(ns) = &self.services_namespace {
            ns.clone()
        } else {
            self.default_namespace.clone()
        }
    }

    /// Namespace used for unscoped lists.
    pub fn shared(&self) -> String { self.services_namespace.clone().unwrap_or_else(|| self.default_namespace.clone()) }
}

/// Body of a new resource.
#[derive(Debug, Clone, Default)]
pub struct NewResource {
    pub id: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub options: Value,
    /// Defaults to `{state: in_queue}`.
    pub status: Option<Map<String, Value>>,
}

/// Partial update. Absent parts are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ResourceUpdate {
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub options: Option<Value>,
    pub status: Option<Map<String, Value>>,
}

impl ResourceUpdate {
    pub fn status(status: Map<String, Value>) -> Self { Self { status: Some(status), ..Default::default() } }

    pub fn state(state: ResourceState) -> Self {
        let mut m = Map::new();
        m.insert("state".into(), Value::String(state.as_str().to_string()));
        Self::status(m)
    }
}

/// Result of a poll: the observed state and `status.response`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub state: String,
    pub response: Option<Value>,
}

/// Arguments for the poll contracts.
#[derive(Debug, Clone)]
pub struct PollRequest {
    pub group: String,
    pub plural: String,
    pub id: String,
    pub namespace: Option<String>,
    /// Only consulted by [`ResourceStore::poll_until_state_changes`].
    pub start_state: String,
    pub started_at: Instant,
    /// Defaults to the configured operation timeout.
    pub timeout: Option<Duration>,
}

impl PollRequest {
    pub fn new(group: &str, plural: &str, id: &str, start_state: ResourceState) -> Self {
        Self {
            group: group.to_string(),
            plural: plural.to_string(),
            id: id.to_string(),
            namespace: None,
            start_state: start_state.as_str().to_string(),
            started_at: Instant::now(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self { self.timeout = Some(timeout); self }
}

/// One decoded watch event.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub resource: Resource,
}

/// Lodash-style deep merge: objects merge recursively, anything else in `overlay` replaces.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                match b.get_mut(k) {
                    Some(slot) => deep_merge(slot, v),
                    None => { b.insert(k.clone(), v.clone()); }
                }
            }
        }
        (slot, v) => *slot = v.clone(),
    }
}

pub struct ResourceStore {
    api: Arc<dyn ResourceApi>,
    registry: ResourceRegistry,
    namespaces: NamespacePolicy,
    settings: ApiServerSettings,
}

impl ResourceStore {
    pub fn new(api: Arc<dyn ResourceApi>, registry: ResourceRegistry, settings: ApiServerSettings) -> Self {
        Self { api, registry, namespaces: NamespacePolicy::from_settings(&settings), settings }
    }

    pub fn registry(&self) -> &ResourceRegistry { &self.registry }

    pub fn namespaces(&self) -> &NamespacePolicy { &self.namespaces }

    fn rt(&self, group: &str, plural: &str) -> FabrikResult<&ResourceType> { self.registry.resolve(group, plural) }

    fn ns(&self, id: &str, namespace: Option<&str>) -> String {
        namespace.map(str::to_string).unwrap_or_else(|| self.namespaces.resolve(id))
    }

    /// Create the type definition, patching it when it already exists.
    pub async fn register_type(&self, group: &str, plural: &str) -> FabrikResult<()> {
        let rt = self.rt(group, plural)?;
        let manifest = fabrik_kubehub::crd_manifest(rt)?;
        match self.api.create_type(manifest.clone()).await {
            Ok(()) => Ok(()),
            Err(FabrikError::Conflict(_)) => {
                debug!(rt = %rt, "type already registered; patching");
                self.api.patch_type(&rt.crd_name(), manifest).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get(&self, group: &str, plural: &str, id: &str, namespace: Option<&str>) -> FabrikResult<Resource> {
        let rt = self.rt(group, plural)?;
        let raw = self.api.get(rt, &self.ns(id, namespace), id).await?;
        Resource::from_raw(&raw)
    }

    /// One page; items sorted by creation time.
    pub async fn list_page(&self, group: &str, plural: &str, query: &ListQuery, all_namespaces: bool) -> FabrikResult<(Vec<Resource>, Option<String>)> {
        let rt = self.rt(group, plural)?;
        let shared = self.namespaces.shared();
        let ns = if all_namespaces { None } else { Some(shared.as_str()) };
        let raw = self.api.list(rt, ns, query).await?;
        let mut items = raw.items.iter().map(Resource::from_raw).collect::<FabrikResult<Vec<_>>>()?;
        items.sort_by_key(Resource::created_at);
        Ok((items, raw.continue_token))
    }

    pub async fn list(&self, group: &str, plural: &str, query: &ListQuery, all_namespaces: bool) -> FabrikResult<Vec<Resource>> {
        Ok(self.list_page(group, plural, query, all_namespaces).await?.0)
    }

    /// Resources in any of `states`, across namespaces, oldest first.
    pub async fn list_by_state(&self, group: &str, plural: &str, states: &[ResourceState]) -> FabrikResult<Vec<Resource>> {
        let names: Vec<&str> = states.iter().map(ResourceState::as_str).collect();
        let query = ListQuery::labels(format!("{} in ({})", STATE_LABEL, names.join(",")));
        self.list(group, plural, &query, true).await
    }

    pub async fn create(&self, group: &str, plural: &str, new: NewResource) -> FabrikResult<Resource> {
        let rt = self.rt(group, plural)?;
        let ns = self.ns(&new.id, new.namespace.as_deref());
        let status = new.status.unwrap_or_else(|| {
            let mut m = Map::new();
            m.insert("state".into(), json!(ResourceState::InQueue.as_str()));
            m
        });
        let mut labels = new.labels;
        if let Some(state) = status.get("state").and_then(Value::as_str) {
            labels.insert(STATE_LABEL.to_string(), state.to_string());
        }
        let mut spec = Map::new();
        spec.insert("options".into(), new.options);
        let body = json!({
            "apiVersion": rt.api_version(),
            "kind": rt.kind,
            "metadata": { "name": new.id, "namespace": ns, "labels": labels },
            "spec": codec::encode_spec(&spec),
            "status": codec::encode_status(&status),
        });
        let raw = self.api.create(rt, &ns, body).await?;
        info!(rt = %rt, id = %new.id, ns = %ns, "resource created");
        Resource::from_raw(&raw)
    }

    /// Merge-patch metadata, options and status. Each status field is encoded on its own.
    pub async fn update(&self, group: &str, plural: &str, id: &str, update: ResourceUpdate) -> FabrikResult<Resource> {
        let rt = self.rt(group, plural)?;
        let ns = self.ns(id, update.namespace.as_deref());
        let mut labels = update.labels;
        if let Some(state) = update.status.as_ref().and_then(|s| s.get("state")).and_then(Value::as_str) {
            labels.insert(STATE_LABEL.to_string(), state.to_string());
        }
        let mut patch = Map::new();
        let mut meta = Map::new();
        if !labels.is_empty() { meta.insert("labels".into(), json!(labels)); }
        if !update.annotations.is_empty() { meta.insert("annotations".into(), json!(update.annotations)); }
        if !meta.is_empty() { patch.insert("metadata".into(), Value::Object(meta)); }
        if let Some(options) = update.options {
            let mut spec = Map::new();
            spec.insert("options".into(), options);
            patch.insert("spec".into(), Value::Object(codec::encode_spec(&spec)));
        }
        if let Some(status) = update.status {
            patch.insert("status".into(), Value::Object(codec::encode_status(&status)));
        }
        let raw = self.api.merge_patch(rt, &ns, id, Value::Object(patch)).await?;
        debug!(rt = %rt, id = %id, "resource updated");
        Resource::from_raw(&raw)
    }

    /// Read-modify-write: `status.response` and `options` are deep-merged with the
    /// stored values before the update is written.
    pub async fn patch(&self, group: &str, plural: &str, id: &str, mut update: ResourceUpdate) -> FabrikResult<Resource> {
        let current = self.get(group, plural, id, update.namespace.as_deref()).await?;
        if let Some(status) = update.status.as_mut() {
            if let (Some(new_resp), Some(old_resp)) = (status.get("response").cloned(), current.response()) {
                let mut merged = old_resp.clone();
                deep_merge(&mut merged, &new_resp);
                status.insert("response".into(), merged);
            }
        }
        if let (Some(new_opts), Some(old_opts)) = (update.options.as_mut(), current.options()) {
            let mut merged = old_opts.clone();
            deep_merge(&mut merged, new_opts);
            *new_opts = merged;
        }
        self.update(group, plural, id, update).await
    }

    pub async fn delete(&self, group: &str, plural: &str, id: &str, namespace: Option<&str>) -> FabrikResult<()> {
        let rt = self.rt(group, plural)?;
        let ns = self.ns(id, namespace);
        self.api.delete(rt, &ns, id).await?;
        info!(rt = %rt, id = %id, ns = %ns, "resource deleted");
        Ok(())
    }

    /// Record `value` under the `last_<operation>_<plural>` label.
    pub async fn update_last_operation(&self, group: &str, plural: &str, id: &str, operation: &str, value: &str) -> FabrikResult<()> {
        let mut update = ResourceUpdate::default();
        update.labels.insert(last_operation_label(operation, plural), value.to_string());
        self.update(group, plural, id, update).await.map(|_| ())
    }

    pub async fn get_last_operation(&self, group: &str, plural: &str, id: &str, operation: &str) -> FabrikResult<Option<String>> {
        let r = self.get(group, plural, id, None).await?;
        Ok(r.label(&last_operation_label(operation, plural)).map(str::to_string))
    }

    fn deadline(&self, req: &PollRequest) -> Instant {
        req.started_at + req.timeout.unwrap_or_else(|| self.settings.operation_timeout())
    }

    fn timed_out(&self, req: &PollRequest) -> FabrikError {
        counter!("store_poll_timeout_total", 1u64);
        let elapsed = Instant::now().saturating_duration_since(req.started_at).as_secs();
        FabrikError::Timeout(format!("{} with guid {} not yet processed after {}s", req.group, req.id, elapsed))
    }

    /// Poll until `status.state` moves away from `start_state`.
    ///
    /// Fails `Timeout` once the deadline passes while still in the start state, and
    /// fails with the stored error when the new state is a failure state carrying one.
    pub async fn poll_until_state_changes(&self, req: &PollRequest) -> FabrikResult<OperationStatus> {
        let deadline = self.deadline(req);
        loop {
            tokio::time::sleep(self.settings.poll_delay()).await;
            let r = self.get(&req.group, &req.plural, &req.id, req.namespace.as_deref()).await?;
            let state = r.state_str().unwrap_or_default().to_string();
            if state == req.start_state {
                if Instant::now() > deadline {
                    return Err(self.timed_out(req));
                }
                continue;
            }
            if ResourceState::parse(&state).map(|s| s.is_failure()).unwrap_or(false) {
                if let Some(err) = r.error() {
                    return Err(FabrikError::from_error_json(err));
                }
            }
            return Ok(OperationStatus { state, response: r.response().cloned() });
        }
    }

    /// Poll until `status.state` is `succeeded` or `failed`, whatever the start state was.
    ///
    /// `failed` with a stored error fails with that error; without one it returns.
    pub async fn poll_until_terminal(&self, req: &PollRequest) -> FabrikResult<OperationStatus> {
        let deadline = self.deadline(req);
        loop {
            tokio::time::sleep(self.settings.poll_delay()).await;
            let r = self.get(&req.group, &req.plural, &req.id, req.namespace.as_deref()).await?;
            match r.state() {
                Some(ResourceState::Succeeded) => {
                    return Ok(OperationStatus { state: ResourceState::Succeeded.as_str().into(), response: r.response().cloned() });
                }
                Some(ResourceState::Failed) => {
                    if let Some(err) = r.error() {
                        return Err(FabrikError::from_error_json(err));
                    }
                    return Ok(OperationStatus { state: ResourceState::Failed.as_str().into(), response: r.response().cloned() });
                }
                _ if Instant::now() > deadline => return Err(self.timed_out(req)),
                _ => continue,
            }
        }
    }

    /// Stream decoded events into `tx` until the watch ends or fails.
    pub async fn watch(&self, group: &str, plural: &str, label_selector: Option<&str>, tx: &mpsc::Sender<WatchEvent>) -> FabrikResult<()> {
        let rt = self.rt(group, plural)?;
        let timeout = u32::try_from(self.settings.watch_timeout_secs).unwrap_or(u32::MAX);
        let stream = self.api.watch(rt, None, label_selector, timeout).await?;
        futures::pin_mut!(stream);
        while let Some(ev) = stream.try_next().await? {
            let resource = match Resource::from_raw(&ev.object) {
                Ok(r) => r,
                Err(e) => { warn!(error = %e, "skipping undecodable watch event"); continue; }
            };
            if tx.send(WatchEvent { kind: ev.kind, resource }).await.is_err() {
                debug!(rt = %rt, "watch receiver dropped");
                return Ok(());
            }
        }
        Ok(())
    }

    /// Watch forever: each termination is logged and the watch is re-registered
    /// after the configured delay. Ends when `tx` is closed or the handle is aborted.
    pub fn spawn_watch(self: &Arc<Self>, group: &str, plural: &str, label_selector: Option<String>, tx: mpsc::Sender<WatchEvent>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let (group, plural) = (group.to_string(), plural.to_string());
        tokio::spawn(async move {
            loop {
                match store.watch(&group, &plural, label_selector.as_deref(), &tx).await {
                    Ok(()) => warn!(group = %group, plural = %plural, "watch ended"),
                    Err(e) => error!(group = %group, plural = %plural, error = %e, "watch failed"),
                }
                if tx.is_closed() {
                    info!(group = %group, plural = %plural, "watch consumer gone; not resubscribing");
                    return;
                }
                tokio::time::sleep(store.settings.resubscribe_delay()).await;
                info!(group = %group, plural = %plural, "resubscribing watch");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_resolution_order() {
        let mut s = ApiServerSettings::default();
        assert_eq!(NamespacePolicy::from_settings(&s).resolve("abc"), "default");
        s.services_namespace = Some("services".into());
        assert_eq!(NamespacePolicy::from_settings(&s).resolve("abc"), "services");
        s.enable_namespaced_separation = true;
        assert_eq!(NamespacePolicy::from_settings(&s).resolve("abc"), "sf-abc");
    }

    #[test]
    fn deep_merge_keeps_untouched_keys() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        deep_merge(&mut base, &json!({"b": 2, "nested": {"y": 3}}));
        assert_eq!(base, json!({"a": 1, "b": 2, "nested": {"x": 1, "y": 3}}));
    }
}
