//! Director contract and its HTTP client.
//!
//! Mutating calls answer `302` with a `Location: /tasks/<id>` header; the client
//! hands task ids back as `<deployment>_<id>` and accepts either form in `get_task`.

use std::time::Instant;

use fabrik_core::config::DirectorConfig;
use fabrik_core::deployment::{parse_task_id, prefix_task_id};
use fabrik_core::operation::OperationType;
use fabrik_core::{FabrikError, FabrikResult};
use metrics::histogram;
use reqwest::{header, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

pub const CONTEXT_ID_HEADER: &str = "X-Bosh-Context-Id";
const CONTEXT_PREFIX: &str = "Fabrik::Operation::";

/// Context id stamped on a dispatched task so in-flight tasks can be categorized.
pub fn context_id(scheduled: bool, action: OperationType) -> String {
    if scheduled {
        format!("{}Auto", CONTEXT_PREFIX)
    } else {
        format!("{}{}", CONTEXT_PREFIX, action.as_str())
    }
}

/// A director task as returned by `GET /tasks/<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorTask {
    #[serde(default)]
    pub id: u64,
    pub state: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub deployment: Option<String>,
    #[serde(default)]
    pub context_id: Option<String>,
}

impl DirectorTask {
    /// Terminal task states.
    pub fn is_done(&self) -> bool { matches!(self.state.as_str(), "done" | "error" | "cancelled" | "timeout") }
}

/// In-flight task counts split by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: u32,
    pub scheduled: u32,
    pub create: u32,
    pub update: u32,
    pub delete: u32,
    pub uncategorized: u32,
}

impl TaskCounts {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a DirectorTask>) -> Self {
        let mut c = Self::default();
        for t in tasks {
            c.total += 1;
            match t.context_id.as_deref().and_then(|id| id.strip_prefix(CONTEXT_PREFIX)) {
                Some("Auto") => c.scheduled += 1,
                Some("create") => c.create += 1,
                Some("update") => c.update += 1,
                Some("delete") => c.delete += 1,
                _ => c.uncategorized += 1,
            }
        }
        c
    }

    pub fn for_action(&self, action: OperationType) -> u32 {
        match action {
            OperationType::Create => self.create,
            OperationType::Update => self.update,
            OperationType::Delete => self.delete,
            OperationType::Bind | OperationType::Unbind => 0,
        }
    }
}

#[async_trait::async_trait]
pub trait Director: Send + Sync {
    fn config(&self) -> &DirectorConfig;

    /// Tasks in `processing` or `cancelling`, categorized by context id.
    async fn current_tasks(&self) -> FabrikResult<TaskCounts>;

    /// Upload `manifest`; returns the prefixed task id.
    async fn create_or_update_deployment(&self, deployment_name: &str, manifest: &str, context_id: &str) -> FabrikResult<String>;

    async fn delete_deployment(&self, deployment_name: &str) -> FabrikResult<String>;

    async fn get_task(&self, task_id: &str) -> FabrikResult<DirectorTask>;

    /// Names of the deployments the director currently knows.
    async fn deployment_names(&self) -> FabrikResult<Vec<String>>;

    async fn create_deployment_property(&self, deployment_name: &str, name: &str, value: &str) -> FabrikResult<()>;

    async fn get_deployment_property(&self, deployment_name: &str, name: &str) -> FabrikResult<String>;

    /// Latest content of a named config document, if any.
    async fn get_config(&self, config_type: &str, name: &str) -> FabrikResult<Option<String>>;

    async fn update_config(&self, config_type: &str, name: &str, content: &str) -> FabrikResult<()>;
}

/// HTTP director client.
#[derive(Clone)]
pub struct BoshDirectorClient {
    config: DirectorConfig,
    base: String,
    http: reqwest::Client,
}

fn unavailable(e: reqwest::Error) -> FabrikError {
    FabrikError::DirectorServiceUnavailable(e.to_string())
}

async fn fail(res: reqwest::Response) -> FabrikError {
    let status = res.status().as_u16();
    let body = res.text().await.unwrap_or_default();
    FabrikError::from_status(status, body)
}

impl BoshDirectorClient {
    pub fn new(config: DirectorConfig) -> FabrikResult<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| FabrikError::InternalServerError(format!("building director client: {}", e)))?;
        let base = config.url.trim_end_matches('/').to_string();
        Ok(Self { config, base, http })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut rb = self.http.request(method, format!("{}{}", self.base, path));
        if !self.config.username.is_empty() {
            rb = rb.basic_auth(&self.config.username, Some(&self.config.password));
        }
        rb
    }

    async fn send(&self, op: &'static str, rb: reqwest::RequestBuilder) -> FabrikResult<reqwest::Response> {
        let started = Instant::now();
        let res = rb.send().await.map_err(unavailable);
        histogram!("director_request_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        res
    }

    /// Expect a `302` and turn its `Location` into a prefixed task id.
    async fn task_redirect(&self, deployment_name: &str, res: reqwest::Response) -> FabrikResult<String> {
        if res.status() != StatusCode::FOUND {
            return Err(fail(res).await);
        }
        let location = res
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| FabrikError::InternalServerError("director redirect without Location".into()))?;
        let id: u64 = location
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| FabrikError::InternalServerError(format!("unexpected task location '{}'", location)))?;
        Ok(prefix_task_id(deployment_name, id))
    }

    async fn json<T: serde::de::DeserializeOwned>(res: reqwest::Response) -> FabrikResult<T> {
        if !res.status().is_success() {
            return Err(fail(res).await);
        }
        res.json::<T>().await.map_err(|e| FabrikError::InternalServerError(format!("decoding director response: {}", e)))
    }
}

#[derive(Deserialize)]
struct NamedDeployment {
    name: String,
}

#[derive(Deserialize)]
struct ConfigEntry {
    content: String,
}

#[async_trait::async_trait]
impl Director for BoshDirectorClient {
    fn config(&self) -> &DirectorConfig { &self.config }

    async fn current_tasks(&self) -> FabrikResult<TaskCounts> {
        let rb = self.request(reqwest::Method::GET, "/tasks").query(&[("state", "processing,cancelling"), ("verbose", "2")]);
        let tasks: Vec<DirectorTask> = Self::json(self.send("current_tasks", rb).await?).await?;
        let counts = TaskCounts::from_tasks(&tasks);
        debug!(director = %self.config.name, total = counts.total, scheduled = counts.scheduled, "current tasks");
        Ok(counts)
    }

    async fn create_or_update_deployment(&self, deployment_name: &str, manifest: &str, context_id: &str) -> FabrikResult<String> {
        let rb = self
            .request(reqwest::Method::POST, "/deployments")
            .header(header::CONTENT_TYPE, "text/yaml")
            .header(CONTEXT_ID_HEADER, context_id)
            .body(manifest.to_string());
        let res = self.send("deploy", rb).await?;
        let task_id = self.task_redirect(deployment_name, res).await?;
        info!(deployment = %deployment_name, task_id = %task_id, context_id = %context_id, "deployment task started");
        Ok(task_id)
    }

    async fn delete_deployment(&self, deployment_name: &str) -> FabrikResult<String> {
        let rb = self.request(reqwest::Method::DELETE, &format!("/deployments/{}", deployment_name));
        let res = self.send("delete_deployment", rb).await?;
        let task_id = self.task_redirect(deployment_name, res).await?;
        info!(deployment = %deployment_name, task_id = %task_id, "delete task started");
        Ok(task_id)
    }

    async fn get_task(&self, task_id: &str) -> FabrikResult<DirectorTask> {
        let (_, id) = parse_task_id(task_id)?;
        let rb = self.request(reqwest::Method::GET, &format!("/tasks/{}", id));
        Self::json(self.send("get_task", rb).await?).await
    }

    async fn deployment_names(&self) -> FabrikResult<Vec<String>> {
        let rb = self.request(reqwest::Method::GET, "/deployments").query(&[("exclude_configs", "true"), ("exclude_releases", "true"), ("exclude_stemcells", "true")]);
        let list: Vec<NamedDeployment> = Self::json(self.send("deployments", rb).await?).await?;
        Ok(list.into_iter().map(|d| d.name).collect())
    }

    async fn create_deployment_property(&self, deployment_name: &str, name: &str, value: &str) -> FabrikResult<()> {
        let rb = self
            .request(reqwest::Method::POST, &format!("/deployments/{}/properties", deployment_name))
            .json(&json!({ "name": name, "value": value }));
        let res = self.send("create_property", rb).await?;
        if res.status() != StatusCode::NO_CONTENT {
            return Err(fail(res).await);
        }
        Ok(())
    }

    async fn get_deployment_property(&self, deployment_name: &str, name: &str) -> FabrikResult<String> {
        let rb = self.request(reqwest::Method::GET, &format!("/deployments/{}/properties/{}", deployment_name, name));
        let body: Value = Self::json(self.send("get_property", rb).await?).await?;
        body.get("value")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| FabrikError::NotFound(format!("property '{}' of deployment '{}'", name, deployment_name)))
    }

    async fn get_config(&self, config_type: &str, name: &str) -> FabrikResult<Option<String>> {
        let rb = self.request(reqwest::Method::GET, "/configs").query(&[("type", config_type), ("name", name), ("latest", "true")]);
        let list: Vec<ConfigEntry> = Self::json(self.send("get_config", rb).await?).await?;
        Ok(list.into_iter().next().map(|c| c.content))
    }

    async fn update_config(&self, config_type: &str, name: &str, content: &str) -> FabrikResult<()> {
        let rb = self.request(reqwest::Method::POST, "/configs").json(&json!({ "type": config_type, "name": name, "content": content }));
        let res = self.send("update_config", rb).await?;
        if res.status() != StatusCode::CREATED {
            return Err(fail(res).await);
        }
        info!(director = %self.config.name, config_type = %config_type, name = %name, "config updated");
        Ok(())
    }
}
