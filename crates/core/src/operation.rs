//! Operation records passed through the lifecycle chain.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resource::ResourceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Bind,
    Unbind,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
        }
    }

    /// Capitalized form used in operation descriptions.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Update => "Update",
            Self::Delete => "Delete",
            Self::Bind => "Bind",
            Self::Unbind => "Unbind",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Caller-visible state of a last-operation query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationState {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "failed")]
    Failed,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool { !matches!(self, Self::InProgress) }
}

/// Request parameters for create/update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationParams {
    pub plan_id: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub context: Value,
    /// Present (as an object) for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_values: Option<Value>,
}

impl OperationParams {
    pub fn new(plan_id: &str) -> Self {
        Self { plan_id: plan_id.to_string(), parameters: Value::Object(Default::default()), context: Value::Object(Default::default()), previous_values: None }
    }

    /// Update when `previous_values` is an object, else create.
    pub fn action(&self) -> OperationType {
        match &self.previous_values {
            Some(Value::Object(_)) => OperationType::Update,
            _ => OperationType::Create,
        }
    }

    pub fn scheduled(&self) -> bool { self.flag("scheduled") }

    /// Reserved for the control plane's own deployment.
    pub fn run_immediately(&self) -> bool { self.flag("_runImmediately") }

    fn flag(&self, key: &str) -> bool {
        self.parameters.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// Parameters with the control flags removed.
    pub fn without_flags(&self) -> Self {
        let mut out = self.clone();
        if let Some(obj) = out.parameters.as_object_mut() {
            obj.remove("scheduled");
            obj.remove("_runImmediately");
        }
        out
    }
}

/// The in-memory operation record. Owned by the call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OperationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "resourceState", skip_serializing_if = "Option::is_none")]
    pub resource_state: Option<ResourceState>,
}

impl Operation {
    pub fn new(kind: OperationType) -> Self {
        Self {
            kind,
            task_id: None,
            cached: false,
            parameters: Value::Null,
            context: Value::Null,
            deployment_name: None,
            state: None,
            description: None,
            resource_state: None,
        }
    }

    pub fn set_state(&mut self, state: OperationState, resource_state: ResourceState, description: String) {
        self.state = Some(state);
        self.resource_state = Some(resource_state);
        self.description = Some(description);
    }

    pub fn is_in_progress(&self) -> bool { matches!(self.state, None | Some(OperationState::InProgress)) }
}

/// Outcome of the dispatch decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOutcome {
    pub task_id: Option<String>,
    pub cached: bool,
}
