//! Fabrik core types: errors, resource model and codec, operation records,
//! deployment naming, configuration and the Operation Queue contract.

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod deployment;
pub mod error;
pub mod operation;
pub mod queue;
pub mod resource;

pub use error::{FabrikError, FabrikResult};

pub mod prelude {
    pub use super::config::{DirectorConfig, Settings};
    pub use super::deployment::{DeploymentName, IndexPool, NameGrammar};
    pub use super::error::{FabrikError, FabrikResult};
    pub use super::operation::{DispatchOutcome, Operation, OperationParams, OperationState, OperationType};
    pub use super::queue::{MemoryOperationQueue, OperationQueue, QueuedDeployment};
    pub use super::resource::{Resource, ResourceMeta, ResourceRegistry, ResourceState, ResourceType};
}
