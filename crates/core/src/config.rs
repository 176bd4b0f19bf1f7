//! Process configuration: YAML file plus `FABRIK_*` environment overrides.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::deployment::{IndexPool, DEFAULT_PREFIX};
use crate::operation::OperationType;

fn default_true() -> bool { true }
fn default_ns_prefix() -> String { "sf".to_string() }
fn default_namespace() -> String { "default".to_string() }
fn default_poll_delay_ms() -> u64 { 200 }
fn default_operation_timeout_secs() -> u64 { 175 }
fn default_watch_timeout_secs() -> u64 { 600 }
fn default_resubscribe_delay_ms() -> u64 { 1000 }
fn default_max_workers() -> u32 { 6 }
fn default_policy_workers() -> u32 { 3 }
fn default_prefix() -> String { DEFAULT_PREFIX.to_string() }
fn default_capacity() -> u32 { 1235 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Route create/update through admission control.
    #[serde(default = "default_true")]
    pub enable_rate_limit: bool,
    #[serde(default)]
    pub apiserver: ApiServerSettings,
    #[serde(default)]
    pub directors: Vec<DirectorConfig>,
    #[serde(default)]
    pub deployment: DeploymentSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self { enable_rate_limit: true, apiserver: ApiServerSettings::default(), directors: Vec::new(), deployment: DeploymentSettings::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiServerSettings {
    #[serde(default = "default_ns_prefix")]
    pub namespace_prefix: String,
    #[serde(default)]
    pub enable_namespaced_separation: bool,
    #[serde(default)]
    pub services_namespace: Option<String>,
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_watch_timeout_secs")]
    pub watch_timeout_secs: u64,
    #[serde(default = "default_resubscribe_delay_ms")]
    pub watch_resubscribe_delay_ms: u64,
}

impl Default for ApiServerSettings {
    fn default() -> Self {
        Self {
            namespace_prefix: default_ns_prefix(),
            enable_namespaced_separation: false,
            services_namespace: None,
            default_namespace: default_namespace(),
            poll_delay_ms: default_poll_delay_ms(),
            operation_timeout_secs: default_operation_timeout_secs(),
            watch_timeout_secs: default_watch_timeout_secs(),
            watch_resubscribe_delay_ms: default_resubscribe_delay_ms(),
        }
    }
}

impl ApiServerSettings {
    pub fn poll_delay(&self) -> Duration { Duration::from_millis(self.poll_delay_ms) }
    pub fn operation_timeout(&self) -> Duration { Duration::from_secs(self.operation_timeout_secs) }
    pub fn resubscribe_delay(&self) -> Duration { Duration::from_millis(self.watch_resubscribe_delay_ms) }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPolicy {
    #[serde(default = "default_policy_workers")]
    pub max_workers: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPolicies {
    #[serde(default)]
    pub create: Option<WorkerPolicy>,
    #[serde(default)]
    pub update: Option<WorkerPolicy>,
    #[serde(default)]
    pub delete: Option<WorkerPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Policies {
    #[serde(default)]
    pub scheduled: Option<WorkerPolicy>,
    #[serde(default)]
    pub user: UserPolicies,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorConfig {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default = "default_true")]
    pub support_create: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: u32,
    #[serde(default)]
    pub policies: Policies,
}

impl DirectorConfig {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            username: String::new(),
            password: String::new(),
            primary: true,
            support_create: true,
            max_workers: default_max_workers(),
            policies: Policies::default(),
        }
    }

    /// Sub-budget for scheduled operations (default 3).
    pub fn scheduled_budget(&self) -> u32 {
        self.policies.scheduled.as_ref().map(|p| p.max_workers).unwrap_or_else(default_policy_workers)
    }

    /// Sub-budget for user-triggered operations of `action` (default 3).
    pub fn user_budget(&self, action: OperationType) -> u32 {
        let p = &self.policies.user;
        let slot = match action {
            OperationType::Create => p.create.as_ref(),
            OperationType::Update => p.update.as_ref(),
            OperationType::Delete => p.delete.as_ref(),
            OperationType::Bind | OperationType::Unbind => None,
        };
        slot.map(|w| w.max_workers).unwrap_or_else(default_policy_workers)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSettings {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default = "default_capacity")]
    pub network_index_capacity: u32,
    #[serde(default)]
    pub network_index_offset: u32,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self { prefix: default_prefix(), subnet: None, network_index_capacity: default_capacity(), network_index_offset: 0 }
    }
}

impl DeploymentSettings {
    pub fn index_pool(&self) -> IndexPool { IndexPool::new(self.network_index_offset, self.network_index_capacity) }
}

impl Settings {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing settings yaml")
    }

    pub fn from_path(path: &str) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading settings from {}", path))?;
        Self::from_yaml(&text)
    }

    /// Load from `FABRIK_CONFIG` (defaults when unset) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut s = match std::env::var("FABRIK_CONFIG") {
            Ok(path) => Self::from_path(&path)?,
            Err(_) => Self::default(),
        };
        s.apply_env(|k| std::env::var(k).ok());
        Ok(s)
    }

    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("FABRIK_RATE_LIMIT").and_then(|s| s.parse().ok()) { self.enable_rate_limit = v; }
        if let Some(v) = get("FABRIK_NAMESPACED").and_then(|s| s.parse().ok()) { self.apiserver.enable_namespaced_separation = v; }
        if let Some(v) = get("FABRIK_SERVICES_NAMESPACE") { self.apiserver.services_namespace = Some(v); }
        if let Some(v) = get("FABRIK_OPERATION_TIMEOUT_SECS").and_then(|s| s.parse().ok()) { self.apiserver.operation_timeout_secs = v; }
    }

    pub fn director(&self, name: &str) -> Option<&DirectorConfig> { self.directors.iter().find(|d| d.name == name) }
}
