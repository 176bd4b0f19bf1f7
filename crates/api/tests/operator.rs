#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use fabrik_api::{Collaborators, DeploymentOperator, DirectorService, TaskStatusPoller};
use fabrik_core::config::{ApiServerSettings, DeploymentSettings, DirectorConfig};
use fabrik_core::queue::MemoryOperationQueue;
use fabrik_core::resource::{Resource, ResourceRegistry, ResourceState, DEPLOYMENT_GROUP, DIRECTOR_TYPE};
use fabrik_core::FabrikError;
use fabrik_ops::{Dispatcher, FakeDirector, TaskCounts, YamlManifest};
use fabrik_store::{MemoryResourceApi, NewResource, ResourceStore};
use serde_json::{json, Map, Value};

const GUID: &str = "b4719e7c-e8d3-4f7f-c515-769ad1c3ebfa";

struct Harness {
    director: Arc<FakeDirector>,
    store: Arc<ResourceStore>,
    service: Arc<DirectorService>,
    operator: DeploymentOperator,
    poller: TaskStatusPoller,
}

fn harness() -> Harness {
    let director = Arc::new(FakeDirector::new(DirectorConfig::new("bosh", "https://director")));
    let dispatcher = Arc::new(Dispatcher::new(director.clone(), Arc::new(MemoryOperationQueue::new()), Arc::new(YamlManifest), true));
    let store = Arc::new(ResourceStore::new(Arc::new(MemoryResourceApi::new()), ResourceRegistry::with_defaults(), ApiServerSettings::default()));
    let service = Arc::new(DirectorService::new(dispatcher, store.clone(), &DeploymentSettings::default(), Collaborators::default()).expect("service"));
    let operator = DeploymentOperator::new(service.clone(), store.clone());
    let poller = TaskStatusPoller::new(service.clone(), store.clone(), Duration::from_secs(10));
    Harness { director, store, service, operator, poller }
}

fn options() -> Value { json!({"plan_id": "plan-1", "parameters": {"size": "small"}, "context": {"platform": "cloudfoundry"}}) }

async fn request(h: &Harness, state: ResourceState) -> Resource {
    let mut status = Map::new();
    status.insert("state".into(), json!(state.as_str()));
    let new = NewResource { id: GUID.into(), options: options(), status: Some(status), ..Default::default() };
    h.store.create(DEPLOYMENT_GROUP, DIRECTOR_TYPE, new).await.expect("create request")
}

async fn reload(h: &Harness) -> Resource { h.store.get(DEPLOYMENT_GROUP, DIRECTOR_TYPE, GUID, None).await.expect("get") }

fn task_id(r: &Resource) -> String { r.response().and_then(|v| v["task_id"].as_str()).expect("task id").to_string() }

#[tokio::test]
async fn create_request_runs_to_success() {
    let h = harness();
    let r = request(&h, ResourceState::InQueue).await;
    h.operator.process_request(&r).await.expect("process");

    let r = reload(&h).await;
    assert_eq!(r.state(), Some(ResourceState::InProgress));
    assert_eq!(r.label("state"), Some("in_progress"));
    assert_eq!(r.response().expect("response")["type"], json!("create"));

    h.poller.poll_once(&r).await.expect("poll");
    let r = reload(&h).await;
    assert_eq!(r.state(), Some(ResourceState::InProgress));
    assert_eq!(r.status["lastOperation"]["state"], json!("in progress"));

    h.director.finish_task(&task_id(&r), "done", None).expect("finish");
    h.poller.poll_once(&r).await.expect("poll");
    let r = reload(&h).await;
    assert_eq!(r.state(), Some(ResourceState::Succeeded));
    assert_eq!(r.status["lastOperation"]["state"], json!("succeeded"));
    assert_eq!(r.status["appliedOptions"], options());
}

#[tokio::test]
async fn deferred_create_waits() {
    let h = harness();
    h.director.set_counts(TaskCounts { total: 6, ..Default::default() });
    let r = request(&h, ResourceState::InQueue).await;
    h.operator.process_request(&r).await.expect("process");
    let r = reload(&h).await;
    assert_eq!(r.state(), Some(ResourceState::Waiting));
    assert_eq!(r.response().expect("response")["cached"], json!(true));

    h.poller.poll_once(&r).await.expect("poll");
    let r = reload(&h).await;
    assert_eq!(r.state(), Some(ResourceState::Waiting));
    assert_eq!(r.status["lastOperation"]["description"], json!("Create deployment is still in progress"));
    assert_eq!(h.poller.poll_all().await.expect("round"), 1);
}

#[tokio::test]
async fn successful_delete_removes_the_resource() {
    let h = harness();
    h.director.add_deployment(&h.service.grammar().format(0, GUID));
    let r = request(&h, ResourceState::Delete).await;
    h.operator.process_request(&r).await.expect("process");
    let r = reload(&h).await;
    assert_eq!(r.state(), Some(ResourceState::InProgress));

    h.director.finish_task(&task_id(&r), "done", None).expect("finish");
    h.poller.poll_once(&r).await.expect("poll");
    let err = h.store.get(DEPLOYMENT_GROUP, DIRECTOR_TYPE, GUID, None).await.expect_err("deleted");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn delete_of_missing_instance_removes_the_resource() {
    let h = harness();
    let r = request(&h, ResourceState::Delete).await;
    h.operator.process_request(&r).await.expect("process");
    assert!(h.store.get(DEPLOYMENT_GROUP, DIRECTOR_TYPE, GUID, None).await.is_err());
}

#[tokio::test]
async fn failed_update_records_the_error() {
    let h = harness();
    let r = request(&h, ResourceState::Update).await;
    h.operator.process_request(&r).await.expect("process");
    let r = reload(&h).await;
    assert_eq!(r.state(), Some(ResourceState::Failed));
    assert_eq!(r.status["lastOperation"]["state"], json!("failed"));
    let stored = FabrikError::from_error_json(r.error().expect("error"));
    assert_eq!(stored, FabrikError::ServiceInstanceNotFound(GUID.to_string()));
}

#[tokio::test]
async fn failed_delete_task_is_delete_failed() {
    let h = harness();
    h.director.add_deployment(&h.service.grammar().format(0, GUID));
    let r = request(&h, ResourceState::Delete).await;
    h.operator.process_request(&r).await.expect("process");
    let r = reload(&h).await;
    h.director.finish_task(&task_id(&r), "error", Some("disk detach failed")).expect("finish");
    h.poller.poll_once(&r).await.expect("poll");
    let r = reload(&h).await;
    assert_eq!(r.state(), Some(ResourceState::DeleteFailed));
}

#[tokio::test]
async fn pending_requests_are_processed_in_one_pass() {
    let h = harness();
    request(&h, ResourceState::InQueue).await;
    assert_eq!(h.operator.process_pending().await.expect("pass"), 1);
    assert_eq!(reload(&h).await.state(), Some(ResourceState::InProgress));
    assert_eq!(h.operator.process_pending().await.expect("pass"), 0);
}
