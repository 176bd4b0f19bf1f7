//! Fabrik API: the operation lifecycle of director-backed service instances and
//! the operator that drives it from stored resources.

#![forbid(unsafe_code)]

pub mod collaborators;
pub mod operator;
pub mod service;

pub use collaborators::{BackupStore, Collaborators, Noop, PlatformHooks, Scheduler, ServiceAgent};
pub use operator::{DeploymentOperator, TaskStatusPoller};
pub use service::{set_operation_state, BindRequest, DirectorService, PLATFORM_CONTEXT_PROPERTY};
