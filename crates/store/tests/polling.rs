#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use fabrik_core::config::ApiServerSettings;
use fabrik_core::resource::{ResourceRegistry, ResourceState, DEPLOYMENT_GROUP, DIRECTOR_TYPE};
use fabrik_core::FabrikError;
use fabrik_store::{MemoryResourceApi, NewResource, PollRequest, ResourceStore, ResourceUpdate};
use serde_json::{json, Map, Value};

async fn seeded(id: &str) -> Arc<ResourceStore> {
    let api = Arc::new(MemoryResourceApi::new());
    let store = Arc::new(ResourceStore::new(api, ResourceRegistry::with_defaults(), ApiServerSettings::default()));
    store
        .create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, NewResource { id: id.into(), options: json!({}), ..Default::default() })
        .await
        .expect("create");
    store
}

fn status(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn later(store: &Arc<ResourceStore>, after: Duration, id: &'static str, s: Map<String, Value>) {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        store.update(DEPLOYMENT_GROUP, DIRECTOR_TYPE, id, ResourceUpdate::status(s)).await.expect("update");
    });
}

#[tokio::test(start_paused = true)]
async fn state_change_times_out_while_unchanged() {
    let store = seeded("g1").await;
    let req = PollRequest::new(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "g1", ResourceState::InQueue).with_timeout(Duration::from_secs(2));
    let err = store.poll_until_state_changes(&req).await.expect_err("timeout");
    match err {
        FabrikError::Timeout(msg) => assert!(msg.starts_with("deployment.servicefabrik.io with guid g1 not yet processed after"), "{}", msg),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn state_change_returns_new_state_and_response() {
    let store = seeded("g2").await;
    later(&store, Duration::from_millis(900), "g2", status(&[("state", json!("in_progress")), ("response", json!({"task_id": "t-1"}))]));
    let req = PollRequest::new(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "g2", ResourceState::InQueue).with_timeout(Duration::from_secs(5));
    let out = store.poll_until_state_changes(&req).await.expect("changed");
    assert_eq!(out.state, "in_progress");
    assert_eq!(out.response, Some(json!({"task_id": "t-1"})));
}

#[tokio::test(start_paused = true)]
async fn state_change_to_failure_raises_stored_error() {
    let store = seeded("g3").await;
    let error = FabrikError::ServiceInstanceNotOperational("g3".into()).to_error_json();
    later(&store, Duration::from_millis(300), "g3", status(&[("state", json!("failed")), ("error", error)]));
    let req = PollRequest::new(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "g3", ResourceState::InQueue);
    let err = store.poll_until_state_changes(&req).await.expect_err("failed");
    assert_eq!(err, FabrikError::ServiceInstanceNotOperational("g3".into()));
}

#[tokio::test(start_paused = true)]
async fn terminal_poll_ignores_intermediate_states() {
    let store = seeded("g4").await;
    later(&store, Duration::from_millis(300), "g4", status(&[("state", json!("in_progress"))]));
    later(&store, Duration::from_millis(1500), "g4", status(&[("state", json!("succeeded")), ("response", json!({"ok": true}))]));
    let req = PollRequest::new(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "g4", ResourceState::InQueue).with_timeout(Duration::from_secs(10));
    let out = store.poll_until_terminal(&req).await.expect("terminal");
    assert_eq!(out.state, "succeeded");
    assert_eq!(out.response, Some(json!({"ok": true})));
}

#[tokio::test(start_paused = true)]
async fn terminal_poll_failed_without_error_returns() {
    let store = seeded("g5").await;
    later(&store, Duration::from_millis(300), "g5", status(&[("state", json!("failed"))]));
    let req = PollRequest::new(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "g5", ResourceState::InQueue);
    let out = store.poll_until_terminal(&req).await.expect("returns");
    assert_eq!(out.state, "failed");
}

#[tokio::test(start_paused = true)]
async fn terminal_poll_times_out() {
    let store = seeded("g6").await;
    later(&store, Duration::from_millis(100), "g6", status(&[("state", json!("in_progress"))]));
    let req = PollRequest::new(DEPLOYMENT_GROUP, DIRECTOR_TYPE, "g6", ResourceState::InQueue).with_timeout(Duration::from_secs(1));
    assert!(matches!(store.poll_until_terminal(&req).await, Err(FabrikError::Timeout(_))));
}
