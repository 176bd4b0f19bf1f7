//! Resource model: types, registry, states and the decoded resource shape.

use std::collections::BTreeMap;
use std::fmt;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec;
use crate::error::{FabrikError, FabrikResult};

pub const API_VERSION: &str = "v1alpha1";
pub const DEPLOYMENT_GROUP: &str = "deployment.servicefabrik.io";
pub const BIND_GROUP: &str = "bind.servicefabrik.io";
pub const DIRECTOR_TYPE: &str = "directors";
pub const DIRECTOR_BIND_TYPE: &str = "directorbinds";

pub const STATE_LABEL: &str = "state";

/// A served resource type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceType {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ResourceType {
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string(), plural: plural.to_string() }
    }

    /// `<plural>.<group>`, the name the type is registered under.
    pub fn crd_name(&self) -> String { format!("{}.{}", self.plural, self.group) }

    pub fn api_version(&self) -> String { format!("{}/{}", self.group, self.version) }

    pub fn director() -> Self { Self::new(DEPLOYMENT_GROUP, API_VERSION, "Director", DIRECTOR_TYPE) }

    pub fn director_bind() -> Self { Self::new(BIND_GROUP, API_VERSION, "DirectorBind", DIRECTOR_BIND_TYPE) }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.plural)
    }
}

/// Typed registry of served types keyed by `(group, plural)`.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    types: FxHashMap<(String, String), ResourceType>,
}

impl ResourceRegistry {
    pub fn new() -> Self { Self::default() }

    /// Registry holding the deployment and bind types.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register(ResourceType::director());
        r.register(ResourceType::director_bind());
        r
    }

    pub fn register(&mut self, rt: ResourceType) {
        self.types.insert((rt.group.clone(), rt.plural.clone()), rt);
    }

    pub fn resolve(&self, group: &str, plural: &str) -> FabrikResult<&ResourceType> {
        self.types
            .get(&(group.to_string(), plural.to_string()))
            .ok_or_else(|| FabrikError::BadRequest(format!("unknown resource type {}/{}", group, plural)))
    }

    pub fn types(&self) -> impl Iterator<Item = &ResourceType> { self.types.values() }
}

/// Lifecycle states stored in `status.state` and mirrored into the `state` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    InQueue,
    InProgress,
    Waiting,
    Update,
    Delete,
    Deleted,
    Succeeded,
    Failed,
    DeleteFailed,
    Abort,
    Aborting,
    Aborted,
    Locked,
    Unlocked,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InQueue => "in_queue",
            Self::InProgress => "in_progress",
            Self::Waiting => "waiting",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Deleted => "deleted",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::DeleteFailed => "delete_failed",
            Self::Abort => "abort",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "in_queue" => Self::InQueue,
            "in_progress" => Self::InProgress,
            "waiting" => Self::Waiting,
            "update" => Self::Update,
            "delete" => Self::Delete,
            "deleted" => Self::Deleted,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "delete_failed" => Self::DeleteFailed,
            "abort" => Self::Abort,
            "aborting" => Self::Aborting,
            "aborted" => Self::Aborted,
            "locked" => Self::Locked,
            "unlocked" => Self::Unlocked,
            _ => return None,
        })
    }

    /// States that carry a failure in `status.error`.
    pub fn is_failure(&self) -> bool { matches!(self, Self::Failed | Self::DeleteFailed) }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub name: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub finalizers: Vec<String>,
    pub resource_version: Option<String>,
    pub creation_timestamp: Option<String>,
}

/// A resource with `spec` and `status` fields already decoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub metadata: ResourceMeta,
    pub spec: Map<String, Value>,
    pub status: Map<String, Value>,
}

impl Resource {
    /// Decode a raw object as returned by the resource API.
    pub fn from_raw(raw: &Value) -> FabrikResult<Self> {
        let meta = raw.get("metadata").ok_or_else(|| FabrikError::InternalServerError("object missing metadata".into()))?;
        let name = meta
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| FabrikError::InternalServerError("object missing metadata.name".into()))?
            .to_string();
        let str_map = |key: &str| -> BTreeMap<String, String> {
            meta.get(key)
                .and_then(Value::as_object)
                .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                .unwrap_or_default()
        };
        let metadata = ResourceMeta {
            name,
            namespace: meta.get("namespace").and_then(Value::as_str).map(str::to_string),
            labels: str_map("labels"),
            annotations: str_map("annotations"),
            finalizers: meta
                .get("finalizers")
                .and_then(Value::as_array)
                .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default(),
            resource_version: meta.get("resourceVersion").and_then(Value::as_str).map(str::to_string),
            creation_timestamp: meta.get("creationTimestamp").and_then(Value::as_str).map(str::to_string),
        };
        let section = |key: &str| raw.get(key).and_then(Value::as_object).map(codec::decode_map).unwrap_or_default();
        Ok(Self { metadata, spec: section("spec"), status: section("status") })
    }

    pub fn state(&self) -> Option<ResourceState> {
        self.status.get("state").and_then(Value::as_str).and_then(ResourceState::parse)
    }

    pub fn state_str(&self) -> Option<&str> { self.status.get("state").and_then(Value::as_str) }

    pub fn options(&self) -> Option<&Value> { self.spec.get("options") }

    pub fn response(&self) -> Option<&Value> { self.status.get("response") }

    pub fn error(&self) -> Option<&Value> { self.status.get("error").filter(|v| !v.is_null()) }

    pub fn label(&self, key: &str) -> Option<&str> { self.metadata.labels.get(key).map(String::as_str) }

    /// Creation time as epoch seconds; unknown sorts first.
    pub fn created_at(&self) -> i64 {
        self.metadata
            .creation_timestamp
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0)
    }
}

/// Label recording the last value of an operation for a type: `last_<op>_<type>`.
pub fn last_operation_label(operation: &str, plural: &str) -> String {
    format!("last_{}_{}", operation, plural)
}
