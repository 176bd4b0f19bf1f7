//! Scriptable in-process `Director` for tests and dry runs.

use std::sync::Mutex;

use fabrik_core::config::DirectorConfig;
use fabrik_core::deployment::{parse_task_id, prefix_task_id};
use fabrik_core::{FabrikError, FabrikResult};
use rustc_hash::FxHashMap;

use crate::director::{Director, DirectorTask, TaskCounts};

/// One recorded create/update call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub deployment_name: String,
    pub context_id: String,
    pub manifest: String,
}

#[derive(Default)]
struct State {
    counts: TaskCounts,
    fail_counts: bool,
    fail_dispatch: Option<FabrikError>,
    next_task: u64,
    tasks: FxHashMap<u64, DirectorTask>,
    deployments: Vec<String>,
    dispatched: Vec<DispatchRecord>,
    properties: FxHashMap<(String, String), String>,
    configs: FxHashMap<(String, String), String>,
}

pub struct FakeDirector {
    config: DirectorConfig,
    state: Mutex<State>,
}

impl FakeDirector {
    pub fn new(config: DirectorConfig) -> Self { Self { config, state: Mutex::new(State { next_task: 100, ..Default::default() }) } }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn set_counts(&self, counts: TaskCounts) { self.with(|s| s.counts = counts); }

    /// Make `current_tasks` fail until reset.
    pub fn fail_task_counts(&self, fail: bool) { self.with(|s| s.fail_counts = fail); }

    /// Make the next create/update fail with `err`.
    pub fn fail_next_dispatch(&self, err: FabrikError) { self.with(|s| s.fail_dispatch = Some(err)); }

    pub fn add_deployment(&self, name: &str) { self.with(|s| s.deployments.push(name.to_string())); }

    pub fn dispatched(&self) -> Vec<DispatchRecord> { self.with(|s| s.dispatched.clone()) }

    /// Move a task to `state`, with an optional result text.
    pub fn finish_task(&self, task_id: &str, state: &str, result: Option<&str>) -> FabrikResult<()> {
        let (_, id) = parse_task_id(task_id)?;
        self.with(|s| {
            let t = s.tasks.get_mut(&id).ok_or_else(|| FabrikError::NotFound(format!("task {}", id)))?;
            t.state = state.to_string();
            t.result = result.map(str::to_string);
            Ok(())
        })
    }

    fn start_task(s: &mut State, deployment_name: &str, context_id: Option<&str>) -> String {
        s.next_task += 1;
        let id = s.next_task;
        s.tasks.insert(
            id,
            DirectorTask {
                id,
                state: "processing".into(),
                description: String::new(),
                timestamp: Some(1_600_000_000 + id as i64),
                result: None,
                deployment: Some(deployment_name.to_string()),
                context_id: context_id.map(str::to_string),
            },
        );
        prefix_task_id(deployment_name, id)
    }
}

#[async_trait::async_trait]
impl Director for FakeDirector {
    fn config(&self) -> &DirectorConfig { &self.config }

    async fn current_tasks(&self) -> FabrikResult<TaskCounts> {
        self.with(|s| {
            if s.fail_counts {
                return Err(FabrikError::DirectorServiceUnavailable("director unreachable".into()));
            }
            Ok(s.counts)
        })
    }

    async fn create_or_update_deployment(&self, deployment_name: &str, manifest: &str, context_id: &str) -> FabrikResult<String> {
        self.with(|s| {
            if let Some(err) = s.fail_dispatch.take() {
                return Err(err);
            }
            s.dispatched.push(DispatchRecord { deployment_name: deployment_name.to_string(), context_id: context_id.to_string(), manifest: manifest.to_string() });
            if !s.deployments.iter().any(|d| d == deployment_name) {
                s.deployments.push(deployment_name.to_string());
            }
            Ok(Self::start_task(s, deployment_name, Some(context_id)))
        })
    }

    async fn delete_deployment(&self, deployment_name: &str) -> FabrikResult<String> {
        self.with(|s| {
            let before = s.deployments.len();
            s.deployments.retain(|d| d != deployment_name);
            if s.deployments.len() == before {
                return Err(FabrikError::NotFound(format!("deployment '{}' doesn't exist", deployment_name)));
            }
            Ok(Self::start_task(s, deployment_name, None))
        })
    }

    async fn get_task(&self, task_id: &str) -> FabrikResult<DirectorTask> {
        let (_, id) = parse_task_id(task_id)?;
        self.with(|s| s.tasks.get(&id).cloned().ok_or_else(|| FabrikError::NotFound(format!("task {} not found", id))))
    }

    async fn deployment_names(&self) -> FabrikResult<Vec<String>> { Ok(self.with(|s| s.deployments.clone())) }

    async fn create_deployment_property(&self, deployment_name: &str, name: &str, value: &str) -> FabrikResult<()> {
        self.with(|s| s.properties.insert((deployment_name.to_string(), name.to_string()), value.to_string()));
        Ok(())
    }

    async fn get_deployment_property(&self, deployment_name: &str, name: &str) -> FabrikResult<String> {
        self.with(|s| s.properties.get(&(deployment_name.to_string(), name.to_string())).cloned())
            .ok_or_else(|| FabrikError::NotFound(format!("property '{}' of deployment '{}'", name, deployment_name)))
    }

    async fn get_config(&self, config_type: &str, name: &str) -> FabrikResult<Option<String>> {
        Ok(self.with(|s| s.configs.get(&(config_type.to_string(), name.to_string())).cloned()))
    }

    async fn update_config(&self, config_type: &str, name: &str, content: &str) -> FabrikResult<()> {
        self.with(|s| s.configs.insert((config_type.to_string(), name.to_string()), content.to_string()));
        Ok(())
    }
}
