//! Fabrik Ops: the director contract and HTTP client, admission control,
//! dispatch and cleanup, staggered re-dispatch and the config lock.

#![forbid(unsafe_code)]

pub mod admission;
pub mod config_lock;
pub mod director;
pub mod dispatch;
pub mod fake;
pub mod manifest;
pub mod poller;
pub mod retry;

pub use admission::{decide, evaluate, AdmissionDecision};
pub use config_lock::{ConfigDocumentStore, ConfigLockManager, DirectorCloudConfig, LockHolder};
pub use director::{context_id, BoshDirectorClient, Director, DirectorTask, TaskCounts};
pub use dispatch::{Dispatcher, Trigger};
pub use fake::FakeDirector;
pub use manifest::{ManifestGenerator, YamlManifest};
pub use poller::{PollRound, StaggeredDeploymentPoller};
pub use retry::{retry_if, retry_with_delay, RetryConfig};
