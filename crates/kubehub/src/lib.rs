//! Fabrik kubehub: the raw resource API seam and its kube-rs implementation.
//!
//! `ResourceApi` deals in raw JSON objects exactly as the API server stores them
//! (string-encoded `spec`/`status` fields). Decoding and namespace policy live one
//! layer up in `fabrik-store`.

#![forbid(unsafe_code)]

use std::time::Instant;

use fabrik_core::resource::ResourceType;
use fabrik_core::{FabrikError, FabrikResult};
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::histogram;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

/// Selector and paging options for `list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    pub continue_token: Option<String>,
    pub limit: Option<u32>,
}

impl ListQuery {
    pub fn labels(selector: impl Into<String>) -> Self { Self { label_selector: Some(selector.into()), ..Default::default() } }
}

#[derive(Debug, Clone, Default)]
pub struct RawList {
    pub items: Vec<Value>,
    pub continue_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Applied,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: EventKind,
    pub object: Value,
}

pub type RawEventStream = BoxStream<'static, FabrikResult<RawEvent>>;

/// Raw CRUD/watch against a namespaced resource API.
#[async_trait::async_trait]
pub trait ResourceApi: Send + Sync {
    async fn get(&self, rt: &ResourceType, namespace: &str, name: &str) -> FabrikResult<Value>;
    /// `namespace: None` lists across all namespaces.
    async fn list(&self, rt: &ResourceType, namespace: Option<&str>, query: &ListQuery) -> FabrikResult<RawList>;
    async fn create(&self, rt: &ResourceType, namespace: &str, body: Value) -> FabrikResult<Value>;
    /// JSON merge-patch (`application/merge-patch+json`).
    async fn merge_patch(&self, rt: &ResourceType, namespace: &str, name: &str, patch: Value) -> FabrikResult<Value>;
    async fn delete(&self, rt: &ResourceType, namespace: &str, name: &str) -> FabrikResult<()>;
    async fn create_type(&self, definition: Value) -> FabrikResult<()>;
    async fn patch_type(&self, name: &str, definition: Value) -> FabrikResult<()>;
    async fn watch(&self, rt: &ResourceType, namespace: Option<&str>, label_selector: Option<&str>, timeout_secs: u32) -> FabrikResult<RawEventStream>;
}

/// Translate a kube client error; API errors go through the status table.
pub fn translate_error(e: kube::Error) -> FabrikError {
    match e {
        kube::Error::Api(ae) => FabrikError::from_status(ae.code, ae.message),
        other => FabrikError::InternalServerError(other.to_string()),
    }
}

fn api_resource(rt: &ResourceType) -> ApiResource {
    ApiResource {
        group: rt.group.clone(),
        version: rt.version.clone(),
        api_version: rt.api_version(),
        kind: rt.kind.clone(),
        plural: rt.plural.clone(),
    }
}

fn to_value(obj: &DynamicObject) -> FabrikResult<Value> {
    let mut v = serde_json::to_value(obj).map_err(|e| FabrikError::InternalServerError(format!("serializing object: {}", e)))?;
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
    }
    Ok(v)
}

fn from_value(body: Value) -> FabrikResult<DynamicObject> {
    serde_json::from_value(body).map_err(|e| FabrikError::BadRequest(format!("invalid object body: {}", e)))
}

/// Build the definition registered for a type: namespaced, one served version,
/// schema open to arbitrary fields.
pub fn crd_for(rt: &ResourceType) -> apiextv1::CustomResourceDefinition {
    let schema = apiextv1::JSONSchemaProps {
        type_: Some("object".to_string()),
        x_kubernetes_preserve_unknown_fields: Some(true),
        ..Default::default()
    };
    apiextv1::CustomResourceDefinition {
        metadata: ObjectMeta { name: Some(rt.crd_name()), ..Default::default() },
        spec: apiextv1::CustomResourceDefinitionSpec {
            group: rt.group.clone(),
            names: apiextv1::CustomResourceDefinitionNames {
                kind: rt.kind.clone(),
                list_kind: Some(format!("{}List", rt.kind)),
                plural: rt.plural.clone(),
                singular: Some(rt.kind.to_lowercase()),
                ..Default::default()
            },
            scope: "Namespaced".to_string(),
            versions: vec![apiextv1::CustomResourceDefinitionVersion {
                name: rt.version.clone(),
                served: true,
                storage: true,
                schema: Some(apiextv1::CustomResourceValidation { open_api_v3_schema: Some(schema) }),
                ..Default::default()
            }],
            ..Default::default()
        },
        status: None,
    }
}

/// Definition for `rt` as raw JSON, ready for [`ResourceApi::create_type`].
pub fn crd_manifest(rt: &ResourceType) -> FabrikResult<Value> {
    serde_json::to_value(crd_for(rt)).map_err(|e| FabrikError::InternalServerError(format!("serializing definition: {}", e)))
}

/// `ResourceApi` backed by a kube-rs client.
#[derive(Clone)]
pub struct KubeResourceApi {
    client: Client,
}

impl KubeResourceApi {
    pub fn new(client: Client) -> Self { Self { client } }

    /// In-cluster config or the local kubeconfig.
    pub async fn try_default() -> anyhow::Result<Self> {
        Ok(Self { client: Client::try_default().await? })
    }

    fn namespaced(&self, rt: &ResourceType, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(rt))
    }

    fn scoped(&self, rt: &ResourceType, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => self.namespaced(rt, ns),
            None => Api::all_with(self.client.clone(), &api_resource(rt)),
        }
    }

    fn definitions(&self) -> Api<apiextv1::CustomResourceDefinition> { Api::all(self.client.clone()) }
}

fn observe(op: &'static str, started: Instant) {
    histogram!("store_request_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
}

#[async_trait::async_trait]
impl ResourceApi for KubeResourceApi {
    async fn get(&self, rt: &ResourceType, namespace: &str, name: &str) -> FabrikResult<Value> {
        let started = Instant::now();
        let obj = self.namespaced(rt, namespace).get(name).await.map_err(translate_error)?;
        observe("get", started);
        to_value(&obj)
    }

    async fn list(&self, rt: &ResourceType, namespace: Option<&str>, query: &ListQuery) -> FabrikResult<RawList> {
        let started = Instant::now();
        let mut lp = ListParams::default();
        if let Some(l) = query.label_selector.as_deref() { lp = lp.labels(l); }
        if let Some(f) = query.field_selector.as_deref() { lp = lp.fields(f); }
        if let Some(c) = query.continue_token.as_deref() { lp = lp.continue_token(c); }
        if let Some(n) = query.limit { lp = lp.limit(n); }
        let list = self.scoped(rt, namespace).list(&lp).await.map_err(translate_error)?;
        observe("list", started);
        let items = list.items.iter().map(to_value).collect::<FabrikResult<Vec<_>>>()?;
        Ok(RawList { items, continue_token: list.metadata.continue_.filter(|c| !c.is_empty()) })
    }

    async fn create(&self, rt: &ResourceType, namespace: &str, body: Value) -> FabrikResult<Value> {
        let started = Instant::now();
        let obj = from_value(body)?;
        let created = self.namespaced(rt, namespace).create(&PostParams::default(), &obj).await.map_err(translate_error)?;
        observe("create", started);
        to_value(&created)
    }

    async fn merge_patch(&self, rt: &ResourceType, namespace: &str, name: &str, patch: Value) -> FabrikResult<Value> {
        let started = Instant::now();
        let patched = self
            .namespaced(rt, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(translate_error)?;
        observe("patch", started);
        to_value(&patched)
    }

    async fn delete(&self, rt: &ResourceType, namespace: &str, name: &str) -> FabrikResult<()> {
        let started = Instant::now();
        self.namespaced(rt, namespace).delete(name, &DeleteParams::default()).await.map_err(translate_error)?;
        observe("delete", started);
        Ok(())
    }

    async fn create_type(&self, definition: Value) -> FabrikResult<()> {
        let crd: apiextv1::CustomResourceDefinition =
            serde_json::from_value(definition).map_err(|e| FabrikError::BadRequest(format!("invalid definition: {}", e)))?;
        self.definitions().create(&PostParams::default(), &crd).await.map_err(translate_error)?;
        info!(name = ?crd.metadata.name, "resource type registered");
        Ok(())
    }

    async fn patch_type(&self, name: &str, definition: Value) -> FabrikResult<()> {
        self.definitions()
            .patch(name, &PatchParams::default(), &Patch::Merge(&definition))
            .await
            .map_err(translate_error)?;
        info!(name = %name, "resource type patched");
        Ok(())
    }

    async fn watch(&self, rt: &ResourceType, namespace: Option<&str>, label_selector: Option<&str>, timeout_secs: u32) -> FabrikResult<RawEventStream> {
        let mut cfg = watcher::Config::default().timeout(timeout_secs);
        if let Some(l) = label_selector { cfg = cfg.labels(l); }
        let api = self.scoped(rt, namespace);
        info!(rt = %rt, ns = ?namespace, selector = ?label_selector, "watch opened");
        let stream = watcher::watcher(api, cfg)
            .map(|ev| match ev {
                Ok(Event::Applied(o)) => vec![to_value(&o).map(|object| RawEvent { kind: EventKind::Applied, object })],
                Ok(Event::Deleted(o)) => vec![to_value(&o).map(|object| RawEvent { kind: EventKind::Deleted, object })],
                Ok(Event::Restarted(list)) => {
                    debug!(count = list.len(), "watch restart");
                    list.iter().map(|o| to_value(o).map(|object| RawEvent { kind: EventKind::Applied, object })).collect()
                }
                Err(e) => vec![Err(FabrikError::InternalServerError(format!("watch: {}", e)))],
            })
            .flat_map(futures::stream::iter)
            .boxed();
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_shape() {
        let v = crd_manifest(&ResourceType::director()).expect("manifest");
        assert_eq!(v["metadata"]["name"], "directors.deployment.servicefabrik.io");
        assert_eq!(v["spec"]["group"], "deployment.servicefabrik.io");
        assert_eq!(v["spec"]["scope"], "Namespaced");
        assert_eq!(v["spec"]["names"]["kind"], "Director");
        assert_eq!(v["spec"]["names"]["listKind"], "DirectorList");
        assert_eq!(v["spec"]["versions"][0]["name"], "v1alpha1");
        assert_eq!(v["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["x-kubernetes-preserve-unknown-fields"], true);
    }

    #[test]
    fn api_errors_use_status_table() {
        let e = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "directors \"x\" already exists".into(),
            reason: "AlreadyExists".into(),
            code: 409,
        });
        assert!(matches!(translate_error(e), FabrikError::Conflict(m) if m.contains("already exists")));
    }
}
