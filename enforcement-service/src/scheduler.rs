//! Periodic triggering of the enforcement passes.
//!
//! Each operation runs at most once at a time: an in-process slot guards
//! against overlapping triggers in this instance and a persisted lease
//! guards against other instances. Overlapping triggers are coalesced.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::models::{BatchSummary, Operation};
use crate::services::metrics::record_coalesced_trigger;
use service_core::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { summary: BatchSummary },
    /// Another run of the same operation was in flight.
    Coalesced,
    /// Nothing to do yet (quota reset already ran this month).
    NotDue,
}

/// Releases the in-process slot when dropped.
struct SlotGuard {
    slot: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// Runs operations under the single-run guard.
pub struct JobRunner {
    engine: Engine,
    holder: String,
    lease_ttl: Duration,
    slots: HashMap<Operation, Arc<AtomicBool>>,
    shutdown: CancellationToken,
}

impl JobRunner {
    pub fn new(engine: Engine, lease_ttl: Duration, shutdown: CancellationToken) -> Self {
        let slots = Operation::ALL
            .into_iter()
            .map(|op| (op, Arc::new(AtomicBool::new(false))))
            .collect();
        Self {
            engine,
            holder: format!("enforcement-{}", Uuid::new_v4()),
            lease_ttl,
            slots,
            shutdown,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn claim_slot(&self, operation: Operation) -> Option<SlotGuard> {
        let slot = self.slots.get(&operation)?.clone();
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard { slot })
    }

    /// Run `operation` unless a run is already in flight.
    pub async fn trigger(
        &self,
        operation: Operation,
        trigger: Trigger,
    ) -> Result<JobOutcome, AppError> {
        let Some(_slot) = self.claim_slot(operation) else {
            return Ok(self.coalesced(operation, trigger, "in-process run in flight"));
        };

        let leased = self
            .engine
            .store()
            .try_acquire_lease(operation.as_str(), &self.holder, self.lease_ttl)
            .await?;
        if !leased {
            return Ok(self.coalesced(operation, trigger, "lease held elsewhere"));
        }

        let as_of = Utc::now().date_naive();
        let result = match (operation, trigger) {
            (Operation::ResetQuotas, Trigger::Scheduled) => self
                .engine
                .reset_quotas_if_due(as_of, &self.shutdown)
                .await
                .map(|summary| match summary {
                    Some(summary) => JobOutcome::Completed { summary },
                    None => JobOutcome::NotDue,
                }),
            _ => self
                .engine
                .run(operation, as_of, &self.shutdown)
                .await
                .map(|summary| JobOutcome::Completed { summary }),
        };

        if let Err(e) = self
            .engine
            .store()
            .release_lease(operation.as_str(), &self.holder)
            .await
        {
            tracing::warn!(operation = %operation, error = %e, "Failed to release job lease");
        }
        result
    }

    fn coalesced(&self, operation: Operation, trigger: Trigger, why: &str) -> JobOutcome {
        tracing::info!(
            operation = %operation,
            trigger = ?trigger,
            reason = why,
            "Trigger coalesced with running job"
        );
        record_coalesced_trigger(operation.as_str());
        JobOutcome::Coalesced
    }
}

/// Per-operation interval loops.
pub struct Scheduler {
    runner: Arc<JobRunner>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(runner: Arc<JobRunner>, config: SchedulerConfig, shutdown: CancellationToken) -> Self {
        Self {
            runner,
            config,
            shutdown,
        }
    }

    fn period(&self, operation: Operation) -> Duration {
        match operation {
            Operation::Aggregate => self.config.aggregate_interval,
            Operation::EvaluateQuotas => self.config.quota_interval,
            Operation::GenerateInvoices => self.config.billing_interval,
            Operation::SendReminders => self.config.reminder_interval,
            Operation::ProcessOverdue => self.config.overdue_interval,
            Operation::ResetQuotas => self.config.reset_check_interval,
        }
    }

    /// Spawn one loop per operation. The handle completes after shutdown
    /// once running passes reached a checkpoint.
    pub fn start(self) -> JoinHandle<()> {
        let tracker = TaskTracker::new();

        for operation in Operation::ALL {
            let period = self.period(operation);
            let runner = self.runner.clone();
            let shutdown = self.shutdown.clone();
            tracing::info!(operation = %operation, period_secs = period.as_secs(), "Scheduling job");

            tracker.spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }
                    match runner.trigger(operation, Trigger::Scheduled).await {
                        Ok(JobOutcome::Completed { summary }) => tracing::debug!(
                            operation = %operation,
                            status = summary.status(),
                            "Scheduled run finished"
                        ),
                        Ok(_) => {}
                        Err(e) => tracing::error!(
                            operation = %operation,
                            error = %e,
                            "Scheduled run failed"
                        ),
                    }
                }
                tracing::debug!(operation = %operation, "Job loop stopped");
            });
        }
        tracker.close();

        tokio::spawn(async move {
            tracker.wait().await;
            tracing::info!("Scheduler stopped");
        })
    }
}
