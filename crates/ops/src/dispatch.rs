//! Dispatch decision, director dispatch and queue cleanup.

use std::sync::Arc;
use std::time::Instant;

use fabrik_core::operation::{DispatchOutcome, OperationParams};
use fabrik_core::queue::OperationQueue;
use fabrik_core::{FabrikError, FabrikResult};
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{error, info, warn};

use crate::admission;
use crate::director::{context_id, Director};
use crate::manifest::ManifestGenerator;
use crate::retry::{retry_with_delay, RetryConfig};

/// What to do with one create/update after admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub run_now: bool,
    /// A queue entry exists (or is about to be written) for the deployment.
    pub cached: bool,
    pub enqueue: bool,
}

pub struct Dispatcher {
    director: Arc<dyn Director>,
    queue: Arc<dyn OperationQueue>,
    manifests: Arc<dyn ManifestGenerator>,
    enable_rate_limit: bool,
    cleanup_retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(director: Arc<dyn Director>, queue: Arc<dyn OperationQueue>, manifests: Arc<dyn ManifestGenerator>, enable_rate_limit: bool) -> Self {
        Self { director, queue, manifests, enable_rate_limit, cleanup_retry: RetryConfig::cleanup() }
    }

    pub fn with_cleanup_retry(mut self, retry: RetryConfig) -> Self {
        self.cleanup_retry = retry;
        self
    }

    pub fn director(&self) -> &Arc<dyn Director> { &self.director }

    pub fn queue(&self) -> &Arc<dyn OperationQueue> { &self.queue }

    /// Send the create/update to the director. Failures propagate unchanged.
    pub async fn dispatch(&self, deployment_name: &str, params: &OperationParams, scheduled: bool) -> FabrikResult<String> {
        let started = Instant::now();
        let action = params.action();
        let manifest = self.manifests.generate(deployment_name, params)?;
        let task_id = self
            .director
            .create_or_update_deployment(deployment_name, &manifest, &context_id(scheduled, action))
            .await?;
        counter!("dispatch_total", 1u64);
        histogram!("dispatch_ms", started.elapsed().as_secs_f64() * 1000.0, "action" => action.as_str());
        info!(deployment = %deployment_name, task_id = %task_id, action = %action, scheduled, "dispatched");
        Ok(task_id)
    }

    /// Combine the admission result with queue state.
    ///
    /// Scheduled calls without capacity are rejected; user calls without capacity
    /// are marked for the queue.
    pub async fn enqueue_or_trigger(&self, should_run_now: bool, scheduled: bool, deployment_name: &str) -> FabrikResult<Trigger> {
        if scheduled {
            if should_run_now {
                return Ok(Trigger { run_now: true, cached: false, enqueue: false });
            }
            counter!("dispatch_rejected_total", 1u64);
            return Err(FabrikError::DeploymentAttemptRejected(deployment_name.to_string()));
        }
        if should_run_now {
            let cached = self.queue.contains_deployment(deployment_name).await?;
            return Ok(Trigger { run_now: true, cached, enqueue: false });
        }
        Ok(Trigger { run_now: false, cached: true, enqueue: true })
    }

    /// Admission-controlled create/update.
    ///
    /// Fails `DeploymentDelayed` once the request has been written to the queue.
    pub async fn admit_and_dispatch(&self, deployment_name: &str, instance_id: &str, params: &OperationParams) -> FabrikResult<DispatchOutcome> {
        let scheduled = params.scheduled();
        let clean = params.without_flags();
        if !self.enable_rate_limit || params.run_immediately() {
            let task_id = self.dispatch(deployment_name, &clean, scheduled).await?;
            return Ok(DispatchOutcome { task_id: Some(task_id), cached: false });
        }
        let decision = admission::evaluate(self.director.as_ref(), scheduled, params.action()).await;
        let trigger = self.enqueue_or_trigger(decision.should_run_now, scheduled, deployment_name).await?;
        if trigger.enqueue {
            let stored = serde_json::to_value(&clean).map_err(|e| FabrikError::InternalServerError(format!("encoding queued params: {}", e)))?;
            if self.queue.save_deployment(&params.plan_id, deployment_name, &stored, &json!({ "instance_id": instance_id })).await? {
                counter!("queue_saved_total", 1u64);
            }
            return Err(FabrikError::DeploymentDelayed(deployment_name.to_string()));
        }
        if trigger.cached {
            self.queue.delete_deployment_from_cache(deployment_name).await?;
        }
        let task_id = self.dispatch(deployment_name, &clean, scheduled).await?;
        if trigger.cached {
            self.queue.save_bosh_task(instance_id, &task_id).await?;
        }
        Ok(DispatchOutcome { task_id: Some(task_id), cached: trigger.cached })
    }

    /// [`Dispatcher::admit_and_dispatch`] with a deferral turned into `{cached: true}`.
    pub async fn create_or_update(&self, deployment_name: &str, instance_id: &str, params: &OperationParams) -> FabrikResult<DispatchOutcome> {
        match self.admit_and_dispatch(deployment_name, instance_id, params).await {
            Err(FabrikError::DeploymentDelayed(_)) => {
                info!(deployment = %deployment_name, "deployment delayed; will be picked up later");
                Ok(DispatchOutcome { task_id: None, cached: true })
            }
            Err(e) => {
                error!(deployment = %deployment_name, error = %e, "deployment dispatch failed");
                Err(e)
            }
            ok => ok,
        }
    }

    /// Queue view of an instance: whether it is queued and its dispatched task, if any.
    pub async fn queued_state(&self, instance_id: &str) -> FabrikResult<DispatchOutcome> {
        let cached = self.queue.contains_service_instance(instance_id).await?;
        let task_id = self.queue.get_bosh_task(instance_id).await?;
        Ok(DispatchOutcome { task_id, cached })
    }

    /// Remove the queue entry and the task mapping of a finished operation.
    /// Each deletion is retried on its own; the first error is returned.
    pub async fn cleanup(&self, deployment_name: &str, instance_id: &str) -> FabrikResult<()> {
        let (entry, task) = tokio::join!(
            retry_with_delay(&self.cleanup_retry, "delete_deployment_from_cache", || self.queue.delete_deployment_from_cache(deployment_name)),
            retry_with_delay(&self.cleanup_retry, "delete_bosh_task", || self.queue.delete_bosh_task(instance_id)),
        );
        let res = entry.and(task);
        match &res {
            Ok(()) => info!(deployment = %deployment_name, instance_id = %instance_id, "queue entries cleaned up"),
            Err(e) => {
                counter!("cleanup_failed_total", 1u64);
                warn!(deployment = %deployment_name, instance_id = %instance_id, error = %e, "queue cleanup failed");
            }
        }
        res
    }
}
