//! In-process `ResourceApi` used by tests and dry runs.
//!
//! Supports equality and `in (...)` label selectors, JSON merge-patch, and watches
//! that receive every subsequent write of the watched type.

use std::sync::Mutex;

use fabrik_core::resource::ResourceType;
use fabrik_core::{FabrikError, FabrikResult};
use fabrik_kubehub::{EventKind, ListQuery, RawEvent, RawEventStream, RawList, ResourceApi};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use rustc_hash::FxHashMap;
use serde_json::{json, Map, Value};

/// RFC 7386 merge-patch: `null` removes, objects merge, anything else replaces.
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(p) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Some(t) = target.as_object_mut() {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        apply_merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Term {
    Eq(String, String),
    NotEq(String, String),
    In(String, Vec<String>),
    Exists(String),
}

fn split_top_level(selector: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let (mut depth, mut start) = (0usize, 0usize);
    for (i, c) in selector.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => { out.push(&selector[start..i]); start = i + 1; }
            _ => {}
        }
    }
    out.push(&selector[start..]);
    out.into_iter().map(str::trim).filter(|s| !s.is_empty()).collect()
}

fn parse_selector(selector: &str) -> Vec<Term> {
    split_top_level(selector)
        .into_iter()
        .map(|t| {
            if let Some((k, rest)) = t.split_once(" in ") {
                let values = rest.trim().trim_start_matches('(').trim_end_matches(')').split(',').map(|v| v.trim().to_string()).collect();
                Term::In(k.trim().to_string(), values)
            } else if let Some((k, v)) = t.split_once("!=") {
                Term::NotEq(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = t.split_once("==").or_else(|| t.split_once('=')) {
                Term::Eq(k.trim().to_string(), v.trim().to_string())
            } else {
                Term::Exists(t.to_string())
            }
        })
        .collect()
}

fn matches(obj: &Value, terms: &[Term]) -> bool {
    let label = |k: &str| obj.pointer("/metadata/labels").and_then(|l| l.get(k)).and_then(Value::as_str).map(str::to_string);
    terms.iter().all(|t| match t {
        Term::Eq(k, v) => label(k).as_deref() == Some(v.as_str()),
        Term::NotEq(k, v) => label(k).as_deref() != Some(v.as_str()),
        Term::In(k, vs) => label(k).map(|l| vs.contains(&l)).unwrap_or(false),
        Term::Exists(k) => label(k).is_some(),
    })
}

/// Field selectors on custom resources only support `metadata.name` and `metadata.namespace`.
fn parse_field_selector(selector: &str) -> FabrikResult<Vec<(String, String, bool)>> {
    split_top_level(selector)
        .into_iter()
        .map(|t| {
            let (field, value, equal) = match t.split_once("!=") {
                Some((f, v)) => (f, v, false),
                None => match t.split_once("==").or_else(|| t.split_once('=')) {
                    Some((f, v)) => (f, v, true),
                    None => return Err(FabrikError::BadRequest(format!("invalid field selector term '{}'", t))),
                },
            };
            let pointer = match field.trim() {
                "metadata.name" => "/metadata/name",
                "metadata.namespace" => "/metadata/namespace",
                other => return Err(FabrikError::BadRequest(format!("field label not supported: {}", other))),
            };
            Ok((pointer.to_string(), value.trim().to_string(), equal))
        })
        .collect()
}

fn matches_fields(obj: &Value, fields: &[(String, String, bool)]) -> bool {
    fields.iter().all(|(pointer, value, equal)| (obj.pointer(pointer).and_then(Value::as_str) == Some(value.as_str())) == *equal)
}

struct Watcher {
    type_name: String,
    namespace: Option<String>,
    terms: Vec<Term>,
    tx: UnboundedSender<FabrikResult<RawEvent>>,
}

#[derive(Default)]
struct Inner {
    seq: u64,
    /// (type, namespace, name) -> (insertion seq, object)
    objects: FxHashMap<(String, String, String), (u64, Value)>,
    types: FxHashMap<String, Value>,
    watchers: Vec<Watcher>,
}

impl Inner {
    fn notify(&mut self, type_name: &str, namespace: &str, kind: EventKind, obj: &Value) {
        self.watchers.retain(|w| {
            if w.type_name != type_name || w.namespace.as_deref().map(|n| n != namespace).unwrap_or(false) || !matches(obj, &w.terms) {
                return !w.tx.is_closed();
            }
            w.tx.unbounded_send(Ok(RawEvent { kind, object: obj.clone() })).is_ok()
        });
    }
}

#[derive(Default)]
pub struct MemoryResourceApi {
    inner: Mutex<Inner>,
}

impl MemoryResourceApi {
    pub fn new() -> Self { Self::default() }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Registered type definitions by name.
    pub fn type_definition(&self, name: &str) -> Option<Value> { self.with(|i| i.types.get(name).cloned()) }

    /// Raw stored object, as the API server would hold it.
    pub fn raw(&self, rt: &ResourceType, namespace: &str, name: &str) -> Option<Value> {
        self.with(|i| i.objects.get(&(rt.crd_name(), namespace.to_string(), name.to_string())).map(|(_, v)| v.clone()))
    }

    /// End every open watch stream.
    pub fn close_watches(&self) { self.with(|i| i.watchers.clear()); }

    pub fn open_watches(&self) -> usize { self.with(|i| i.watchers.iter().filter(|w| !w.tx.is_closed()).count()) }
}

fn not_found(rt: &ResourceType, name: &str) -> FabrikError {
    FabrikError::NotFound(format!("{} \"{}\" not found", rt.crd_name(), name))
}

#[async_trait::async_trait]
impl ResourceApi for MemoryResourceApi {
    async fn get(&self, rt: &ResourceType, namespace: &str, name: &str) -> FabrikResult<Value> {
        self.raw(rt, namespace, name).ok_or_else(|| not_found(rt, name))
    }

    async fn list(&self, rt: &ResourceType, namespace: Option<&str>, query: &ListQuery) -> FabrikResult<RawList> {
        let terms = query.label_selector.as_deref().map(parse_selector).unwrap_or_default();
        let fields = query.field_selector.as_deref().map(parse_field_selector).transpose()?.unwrap_or_default();
        let type_name = rt.crd_name();
        let mut hits: Vec<(u64, Value)> = self.with(|i| {
            i.objects
                .iter()
                .filter(|((t, ns, _), (_, obj))| *t == type_name && namespace.map(|n| n == ns).unwrap_or(true) && matches(obj, &terms) && matches_fields(obj, &fields))
                .map(|(_, (seq, obj))| (*seq, obj.clone()))
                .collect()
        });
        hits.sort_by_key(|(seq, _)| *seq);
        let skip: usize = query.continue_token.as_deref().and_then(|c| c.parse().ok()).unwrap_or(0);
        let limit = query.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        let total = hits.len();
        let items: Vec<Value> = hits.into_iter().skip(skip).take(limit).map(|(_, v)| v).collect();
        let next = skip + items.len();
        Ok(RawList { items, continue_token: (next < total).then(|| next.to_string()) })
    }

    async fn create(&self, rt: &ResourceType, namespace: &str, mut body: Value) -> FabrikResult<Value> {
        let name = body
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .ok_or_else(|| FabrikError::BadRequest("metadata.name is required".into()))?
            .to_string();
        self.with(|i| {
            let key = (rt.crd_name(), namespace.to_string(), name.clone());
            if i.objects.contains_key(&key) {
                return Err(FabrikError::Conflict(format!("{} \"{}\" already exists", rt.crd_name(), name)));
            }
            i.seq += 1;
            let created = chrono::DateTime::<chrono::Utc>::from_timestamp(1_600_000_000 + i.seq as i64, 0)
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
                .unwrap_or_default();
            apply_merge_patch(
                &mut body,
                &json!({ "metadata": { "namespace": namespace, "resourceVersion": i.seq.to_string(), "creationTimestamp": created } }),
            );
            i.objects.insert(key, (i.seq, body.clone()));
            i.notify(&rt.crd_name(), namespace, EventKind::Applied, &body);
            Ok(body)
        })
    }

    async fn merge_patch(&self, rt: &ResourceType, namespace: &str, name: &str, patch: Value) -> FabrikResult<Value> {
        self.with(|i| {
            let key = (rt.crd_name(), namespace.to_string(), name.to_string());
            i.seq += 1;
            let version = i.seq.to_string();
            let updated = {
                let (_, obj) = i.objects.get_mut(&key).ok_or_else(|| not_found(rt, name))?;
                apply_merge_patch(obj, &patch);
                apply_merge_patch(obj, &json!({ "metadata": { "resourceVersion": version } }));
                obj.clone()
            };
            i.notify(&rt.crd_name(), namespace, EventKind::Applied, &updated);
            Ok(updated)
        })
    }

    async fn delete(&self, rt: &ResourceType, namespace: &str, name: &str) -> FabrikResult<()> {
        self.with(|i| {
            let (_, obj) = i
                .objects
                .remove(&(rt.crd_name(), namespace.to_string(), name.to_string()))
                .ok_or_else(|| not_found(rt, name))?;
            i.notify(&rt.crd_name(), namespace, EventKind::Deleted, &obj);
            Ok(())
        })
    }

    async fn create_type(&self, definition: Value) -> FabrikResult<()> {
        let name = definition.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default().to_string();
        self.with(|i| {
            if i.types.contains_key(&name) {
                return Err(FabrikError::Conflict(format!("customresourcedefinitions \"{}\" already exists", name)));
            }
            i.types.insert(name, definition);
            Ok(())
        })
    }

    async fn patch_type(&self, name: &str, definition: Value) -> FabrikResult<()> {
        self.with(|i| {
            let slot = i.types.get_mut(name).ok_or_else(|| FabrikError::NotFound(format!("customresourcedefinitions \"{}\" not found", name)))?;
            apply_merge_patch(slot, &definition);
            Ok(())
        })
    }

    async fn watch(&self, rt: &ResourceType, namespace: Option<&str>, label_selector: Option<&str>, _timeout_secs: u32) -> FabrikResult<RawEventStream> {
        let (tx, rx) = unbounded();
        self.with(|i| {
            i.watchers.push(Watcher {
                type_name: rt.crd_name(),
                namespace: namespace.map(str::to_string),
                terms: label_selector.map(parse_selector).unwrap_or_default(),
                tx,
            })
        });
        Ok(rx.boxed())
    }
}
