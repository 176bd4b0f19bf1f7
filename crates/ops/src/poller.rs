//! Staggered re-dispatch of queued deployments.

use std::sync::Arc;
use std::time::Duration;

use fabrik_core::operation::OperationParams;
use fabrik_core::FabrikResult;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;

/// Outcome of one pass over the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollRound {
    /// `(deployment, task id)` for every entry dispatched this round.
    pub dispatched: Vec<(String, String)>,
    /// Entries left in the queue.
    pub remaining: usize,
}

pub struct StaggeredDeploymentPoller {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
}

impl StaggeredDeploymentPoller {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self { Self { dispatcher, interval } }

    /// Walk the queue oldest first, re-running admission for each entry as a user
    /// operation. The round stops at the first entry that is still deferred.
    pub async fn poll_once(&self) -> FabrikResult<PollRound> {
        let queue = self.dispatcher.queue();
        let names = queue.get_deployment_names().await?;
        let mut round = PollRound::default();
        for name in &names {
            let Some(entry) = queue.get_deployment_by_name(name).await? else { continue };
            let params: OperationParams = match serde_json::from_value(entry.params.clone()) {
                Ok(p) => p,
                Err(e) => {
                    warn!(deployment = %name, error = %e, "dropping undecodable queue entry");
                    queue.delete_deployment_from_cache(name).await?;
                    continue;
                }
            };
            let Some(instance_id) = entry.args.get("instance_id").and_then(Value::as_str) else {
                warn!(deployment = %name, "queue entry without instance id");
                continue;
            };
            match self.dispatcher.create_or_update(name, instance_id, &params).await {
                Ok(out) => match out.task_id {
                    Some(task_id) => round.dispatched.push((name.clone(), task_id)),
                    None => {
                        debug!(deployment = %name, "still no capacity; ending round");
                        break;
                    }
                },
                Err(e) => error!(deployment = %name, error = %e, "re-dispatch failed"),
            }
        }
        round.remaining = queue.get_deployment_names().await?.len();
        if !round.dispatched.is_empty() {
            info!(dispatched = round.dispatched.len(), remaining = round.remaining, "staggered round finished");
        }
        Ok(round)
    }

    /// Run `poll_once` every interval until the handle is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(me.interval);
            loop {
                tick.tick().await;
                if let Err(e) = me.poll_once().await {
                    error!(error = %e, "staggered poll failed");
                }
            }
        })
    }
}
