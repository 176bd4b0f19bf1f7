//! Admission control against the director's concurrency budget.

use fabrik_core::config::DirectorConfig;
use fabrik_core::operation::OperationType;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error};

use crate::director::{Director, TaskCounts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub should_run_now: bool,
    /// Set when the task counts could not be fetched.
    pub fail_safe: bool,
}

/// Pure policy: the hard ceiling first, then the scheduled or per-action sub-budget.
pub fn decide(config: &DirectorConfig, counts: &TaskCounts, scheduled: bool, action: OperationType) -> bool {
    if counts.total >= config.max_workers {
        return false;
    }
    let (current, budget) = if scheduled {
        (counts.scheduled, config.scheduled_budget())
    } else {
        (counts.for_action(action), config.user_budget(action))
    };
    current < budget
}

/// Fetch counts from `director` and decide. A failed fetch yields "no capacity".
pub async fn evaluate(director: &dyn Director, scheduled: bool, action: OperationType) -> AdmissionDecision {
    let config = director.config();
    match director.current_tasks().await {
        Ok(counts) => {
            let should_run_now = decide(config, &counts, scheduled, action);
            if should_run_now {
                counter!("admission_run_now_total", 1u64);
            } else {
                counter!("admission_deferred_total", 1u64);
            }
            debug!(director = %config.name, scheduled, action = %action, total = counts.total, should_run_now, "admission evaluated");
            AdmissionDecision { should_run_now, fail_safe: false }
        }
        Err(e) => {
            counter!("admission_fail_safe_total", 1u64);
            error!(director = %config.name, error = %e, "could not fetch current tasks; treating as no capacity");
            AdmissionDecision { should_run_now: false, fail_safe: true }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(total: u32, scheduled: u32, update: u32) -> TaskCounts {
        TaskCounts { total, scheduled, update, ..Default::default() }
    }

    #[test]
    fn ceiling_always_wins() {
        let cfg = DirectorConfig::new("d", "http://d");
        for sched in [true, false] {
            assert!(!decide(&cfg, &counts(6, 0, 0), sched, OperationType::Update));
            assert!(!decide(&cfg, &counts(9, 0, 0), sched, OperationType::Create));
        }
    }

    #[test]
    fn sub_budgets() {
        let cfg = DirectorConfig::new("d", "http://d");
        assert!(decide(&cfg, &counts(5, 0, 2), false, OperationType::Update));
        assert!(!decide(&cfg, &counts(5, 0, 3), false, OperationType::Update));
        assert!(decide(&cfg, &counts(5, 0, 3), false, OperationType::Create));
        assert!(decide(&cfg, &counts(4, 2, 0), true, OperationType::Update));
        assert!(!decide(&cfg, &counts(4, 3, 0), true, OperationType::Update));
    }

    #[test]
    fn below_every_budget_runs_now() {
        let cfg = DirectorConfig::new("d", "http://d");
        for total in 0..cfg.max_workers {
            for current in 0..3 {
                let c = TaskCounts { total, create: current, update: current, delete: current, ..Default::default() };
                for action in [OperationType::Create, OperationType::Update, OperationType::Delete] {
                    assert!(decide(&cfg, &c, false, action));
                }
            }
        }
    }
}
