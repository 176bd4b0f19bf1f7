#![forbid(unsafe_code)]

use fabrik_core::config::DirectorConfig;
use fabrik_core::FabrikError;
use fabrik_ops::{BoshDirectorClient, Director, TaskCounts};
use httpmock::Method::{DELETE, GET, POST};
use httpmock::MockServer;
use serde_json::json;

const NAME: &str = "service-fabrik-0021-b4719e7c";

fn client(server: &MockServer) -> BoshDirectorClient {
    let mut cfg = DirectorConfig::new("bosh", &server.base_url());
    cfg.username = "admin".into();
    cfg.password = "secret".into();
    BoshDirectorClient::new(cfg).expect("client")
}

#[tokio::test]
async fn deploy_returns_prefixed_task_id_from_redirect() {
    let server = MockServer::start_async().await;
    let deploy = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/deployments")
                .header("content-type", "text/yaml")
                .header("X-Bosh-Context-Id", "Fabrik::Operation::create");
            then.status(302).header("Location", "/tasks/4711");
        })
        .await;
    let task_id = client(&server).create_or_update_deployment(NAME, "name: x\n", "Fabrik::Operation::create").await.expect("deploy");
    deploy.assert_async().await;
    assert_eq!(task_id, format!("{}_4711", NAME));
}

#[tokio::test]
async fn delete_and_task_lookup() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(DELETE).path(format!("/deployments/{}", NAME));
            then.status(302).header("Location", "https://director/tasks/12");
        })
        .await;
    let task = server
        .mock_async(|when, then| {
            when.method(GET).path("/tasks/12");
            then.status(200).json_body(json!({
                "id": 12, "state": "done", "description": "delete deployment", "timestamp": 1600000000,
                "result": "/deployments/x", "user": "admin", "deployment": NAME
            }));
        })
        .await;
    let c = client(&server);
    let task_id = c.delete_deployment(NAME).await.expect("delete");
    let t = c.get_task(&task_id).await.expect("task");
    task.assert_async().await;
    assert_eq!(t.state, "done");
    assert!(t.is_done());
    assert_eq!(t.deployment.as_deref(), Some(NAME));
}

#[tokio::test]
async fn current_tasks_are_categorized() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/tasks").query_param("state", "processing,cancelling");
            then.status(200).json_body(json!([
                {"id": 1, "state": "processing", "context_id": "Fabrik::Operation::Auto"},
                {"id": 2, "state": "processing", "context_id": "Fabrik::Operation::update"},
                {"id": 3, "state": "cancelling", "context_id": ""}
            ]));
        })
        .await;
    let counts = client(&server).current_tasks().await.expect("tasks");
    assert_eq!(counts, TaskCounts { total: 3, scheduled: 1, update: 1, uncategorized: 1, ..Default::default() });
}

#[tokio::test]
async fn properties_and_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path(format!("/deployments/{}/properties", NAME)).json_body(json!({"name": "platform-context", "value": "{}"}));
            then.status(204);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/deployments/{}/properties/platform-context", NAME));
            then.status(200).json_body(json!({"value": "{\"platform\":\"cloudfoundry\"}"}));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/deployments/{}/properties/missing", NAME));
            then.status(404).body("property not found");
        })
        .await;
    let c = client(&server);
    c.create_deployment_property(NAME, "platform-context", "{}").await.expect("create");
    assert_eq!(c.get_deployment_property(NAME, "platform-context").await.expect("get"), "{\"platform\":\"cloudfoundry\"}");
    let err = c.get_deployment_property(NAME, "missing").await.expect_err("missing");
    assert_eq!(err, FabrikError::NotFound("property not found".into()));
}

#[tokio::test]
async fn cloud_config_round_trip() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/configs").query_param("type", "cloud").query_param("name", "bosh").query_param("latest", "true");
            then.status(200).json_body(json!([{"id": "7", "type": "cloud", "name": "bosh", "content": "networks: []\n"}]));
        })
        .await;
    let post = server
        .mock_async(|when, then| {
            when.method(POST).path("/configs").json_body(json!({"type": "cloud", "name": "bosh", "content": "networks: [a]\n"}));
            then.status(201).json_body(json!({"id": "8"}));
        })
        .await;
    let c = client(&server);
    assert_eq!(c.get_config("cloud", "bosh").await.expect("get").as_deref(), Some("networks: []\n"));
    c.update_config("cloud", "bosh", "networks: [a]\n").await.expect("update");
    post.assert_async().await;
}

#[tokio::test]
async fn unreachable_director_is_unavailable() {
    let c = BoshDirectorClient::new(DirectorConfig::new("bosh", "http://127.0.0.1:1")).expect("client");
    assert!(matches!(c.current_tasks().await, Err(FabrikError::DirectorServiceUnavailable(_))));
}
