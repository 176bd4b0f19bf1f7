#![forbid(unsafe_code)]

use std::sync::Arc;

use fabrik_core::config::ApiServerSettings;
use fabrik_core::resource::{ResourceRegistry, ResourceState, ResourceType, DEPLOYMENT_GROUP, DIRECTOR_TYPE};
use fabrik_core::FabrikError;
use fabrik_store::{EventKind, ListQuery, MemoryResourceApi, NewResource, ResourceApi, ResourceStore, ResourceUpdate};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

fn store() -> (Arc<MemoryResourceApi>, ResourceStore) {
    let api = Arc::new(MemoryResourceApi::new());
    let store = ResourceStore::new(api.clone(), ResourceRegistry::with_defaults(), ApiServerSettings::default());
    (api, store)
}

fn new_director(id: &str, options: Value) -> NewResource {
    NewResource { id: id.to_string(), options, ..Default::default() }
}

#[tokio::test]
async fn create_encodes_fields_and_mirrors_state() {
    let (api, store) = store();
    let created = store
        .create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new_director("guid-1", json!({"plan_id": "p1", "context": {"org": "o"}})))
        .await
        .expect("create");
    assert_eq!(created.state(), Some(ResourceState::InQueue));
    assert_eq!(created.label("state"), Some("in_queue"));
    assert_eq!(created.options(), Some(&json!({"plan_id": "p1", "context": {"org": "o"}})));

    let raw = api.raw(&ResourceType::director(), "default", "guid-1").expect("stored");
    assert_eq!(raw["spec"]["options"], json!("{\"context\":{\"org\":\"o\"},\"plan_id\":\"p1\"}"));
    assert_eq!(raw["status"]["state"], json!("in_queue"));
}

#[tokio::test]
async fn update_writes_fields_independently() {
    let (api, store) = store();
    store.create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new_director("guid-1", json!({}))).await.expect("create");
    let mut status = Map::new();
    status.insert("state".into(), json!("in_progress"));
    status.insert("response".into(), json!({"task_id": "sf-0001-guid-1_12"}));
    let r = store.update(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "guid-1", ResourceUpdate::status(status)).await.expect("update");
    assert_eq!(r.state(), Some(ResourceState::InProgress));
    assert_eq!(r.label("state"), Some("in_progress"));
    assert_eq!(r.response(), Some(&json!({"task_id": "sf-0001-guid-1_12"})));

    // a legacy plain-string field stays readable
    api.merge_patch(&ResourceType::director(), "default", "guid-1", json!({"status": {"description": "not json at all"}}))
        .await
        .expect("raw patch");
    let r = store.get(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "guid-1", None).await.expect("get");
    assert_eq!(r.status["description"], json!("not json at all"));
}

#[tokio::test]
async fn patch_deep_merges_response_and_options() {
    let (_, store) = store();
    let mut status = Map::new();
    status.insert("state".into(), json!("in_queue"));
    status.insert("response".into(), json!({"task_id": "t1", "meta": {"a": 1}}));
    store
        .create(
            DEPLOYMENT_GROUP,
            DIRECTOR_TYPE,
            NewResource { id: "guid-1".into(), options: json!({"plan_id": "p", "parameters": {"x": 1}}), status: Some(status), ..Default::default() },
        )
        .await
        .expect("create");

    let mut status = Map::new();
    status.insert("response".into(), json!({"meta": {"b": 2}}));
    let update = ResourceUpdate { options: Some(json!({"parameters": {"y": 2}})), status: Some(status), ..Default::default() };
    let r = store.patch(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "guid-1", update).await.expect("patch");
    assert_eq!(r.response(), Some(&json!({"task_id": "t1", "meta": {"a": 1, "b": 2}})));
    assert_eq!(r.options(), Some(&json!({"plan_id": "p", "parameters": {"x": 1, "y": 2}})));
}

#[tokio::test]
async fn list_by_state_filters_on_label_oldest_first() {
    let (_, store) = store();
    for (id, state) in [("a", ResourceState::InQueue), ("b", ResourceState::Succeeded), ("c", ResourceState::Update), ("d", ResourceState::Delete)] {
        let mut status = Map::new();
        status.insert("state".into(), json!(state.as_str()));
        store
            .create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, NewResource { id: id.into(), options: json!({}), status: Some(status), ..Default::default() })
            .await
            .expect("create");
    }
    let hits = store
        .list_by_state(DEPLOYMENT_GROUP, DIRECTOR_TYPE, &[ResourceState::InQueue, ResourceState::Update, ResourceState::Delete])
        .await
        .expect("list");
    let names: Vec<&str> = hits.iter().map(|r| r.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c", "d"]);
}

#[tokio::test]
async fn list_applies_field_selectors() {
    let (_, store) = store();
    for id in ["a", "b"] {
        store.create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new_director(id, json!({}))).await.expect("create");
    }
    let query = ListQuery { field_selector: Some("metadata.name=b".into()), ..Default::default() };
    let hits = store.list(DEPLOYMENT_GROUP, DIRECTOR_TYPE, &query, true).await.expect("list");
    let names: Vec<&str> = hits.iter().map(|r| r.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["b"]);

    let query = ListQuery { field_selector: Some("status.state=failed".into()), ..Default::default() };
    let err = store.list(DEPLOYMENT_GROUP, DIRECTOR_TYPE, &query, true).await.expect_err("unsupported field");
    assert!(matches!(err, FabrikError::BadRequest(_)));
}

#[tokio::test]
async fn last_operation_labels() {
    let (_, store) = store();
    store.create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new_director("guid-1", json!({}))).await.expect("create");
    assert_eq!(store.get_last_operation(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "guid-1", "backup").await.expect("get"), None);
    store.update_last_operation(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "guid-1", "backup", "b-42").await.expect("set");
    assert_eq!(
        store.get_last_operation(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "guid-1", "backup").await.expect("get").as_deref(),
        Some("b-42")
    );
}

#[tokio::test]
async fn missing_and_unknown() {
    let (_, store) = store();
    let err = store.get(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "nope", None).await.expect_err("missing");
    assert!(err.is_not_found());
    let err = store.get("other.io", "things", "x", None).await.expect_err("unknown type");
    assert!(matches!(err, FabrikError::BadRequest(_)));
    store.create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new_director("dup", json!({}))).await.expect("create");
    let err = store.create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new_director("dup", json!({}))).await.expect_err("dup");
    assert!(matches!(err, FabrikError::Conflict(_)));
    store.delete(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "dup", None).await.expect("delete");
    assert!(store.delete(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "dup", None).await.expect_err("gone").is_not_found());
}

#[tokio::test]
async fn register_type_patches_on_conflict() {
    let (api, store) = store();
    store.register_type(DEPLOYMENT_GROUP, DIRECTOR_TYPE).await.expect("first");
    store.register_type(DEPLOYMENT_GROUP, DIRECTOR_TYPE).await.expect("second patches");
    let def = api.type_definition("directors.deployment.servicefabrik.io").expect("registered");
    assert_eq!(def["spec"]["group"], json!(DEPLOYMENT_GROUP));
}

#[tokio::test]
async fn namespaced_separation_places_resources_per_instance() {
    let api = Arc::new(MemoryResourceApi::new());
    let settings = ApiServerSettings { enable_namespaced_separation: true, ..Default::default() };
    let store = ResourceStore::new(api.clone(), ResourceRegistry::with_defaults(), settings);
    store.create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new_director("guid-9", json!({}))).await.expect("create");
    assert!(api.raw(&ResourceType::director(), "sf-guid-9", "guid-9").is_some());
    let r = store.get(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "guid-9", None).await.expect("get");
    assert_eq!(r.metadata.namespace.as_deref(), Some("sf-guid-9"));
}

#[tokio::test]
async fn spawned_watch_resubscribes_after_stream_ends() {
    let (api, store) = store();
    let store = Arc::new(store);
    let (tx, mut rx) = mpsc::channel(16);
    let handle = store.spawn_watch(DEPLOYMENT_GROUP, DIRECTOR_TYPE, None, tx);

    wait_for_watch(&api).await;
    store.create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new_director("w1", json!({}))).await.expect("create");
    let ev = rx.recv().await.expect("first event");
    assert_eq!(ev.kind, EventKind::Applied);
    assert_eq!(ev.resource.metadata.name, "w1");

    api.close_watches();
    wait_for_watch(&api).await;
    store.delete(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "w1", None).await.expect("delete");
    let ev = rx.recv().await.expect("event after resubscribe");
    assert_eq!(ev.kind, EventKind::Deleted);

    drop(rx);
    handle.abort();
}

async fn wait_for_watch(api: &MemoryResourceApi) {
    for _ in 0..200 {
        if api.open_watches() > 0 {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    panic!("watch never registered");
}
