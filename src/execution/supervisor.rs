//! Timeout & Retry Supervisor
//!
//! Periodic scanner that enforces deadlines and the retry budget. Each
//! cycle runs, in order:
//!
//! 1. **Timeout scan**: WAITING_APPROVAL past `timeoutAt` fails with
//!    "approval timeout" (optional steps are skipped) and is never retried;
//!    RUNNING past `timeoutAt` is treated as stuck and fails retryably.
//! 2. **Retry scan**: retryable FAILED executions under their bound go back
//!    to PENDING with `retryCount` incremented.
//! 3. **Instance timeout scan**: live instances past their own `timeoutAt`
//!    move to TIMEOUT and their unfinished executions are skipped.
//!
//! Touched instances are then re-driven through the engine on spawned
//! tasks, so a slow or hung step never holds up the next cycle. Every
//! decision re-reads the row under compare-and-swap, so running a cycle
//! twice never double-fails or double-retries.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::engine::Engine;
use super::state::{ExecutionStatus, InstanceStatus};
use crate::error::Result;
use crate::monitoring::{EventType, INSTANCE_SUBJECT};

/// Error message recorded on approvals nobody decided in time.
pub const APPROVAL_TIMEOUT: &str = "approval timeout";

/// What one supervisor cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub approval_timeouts: usize,
    pub stuck_steps: usize,
    pub retries: usize,
    pub instance_timeouts: usize,
}

impl CycleReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Drives timeout and retry policy for an [`Engine`].
pub struct Supervisor {
    engine: Engine,
    interval: Duration,
    redrives: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(engine: Engine) -> Self {
        let interval = engine.config().supervisor_interval();
        Self {
            engine,
            interval,
            redrives: Mutex::new(Vec::new()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs cycles on the configured interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!("Supervisor started (interval {:?})", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) if !report.is_empty() => info!("Supervisor cycle: {:?}", report),
                        Ok(_) => debug!("Supervisor cycle: nothing to do"),
                        Err(e) => error!("Supervisor cycle failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Supervisor shutting down");
                        break;
                    }
                }
            }
        }

        if tokio::time::timeout(self.interval, self.settle()).await.is_err() {
            warn!("Supervisor stopped with re-drives still running");
        }
    }

    /// Runs one full cycle.
    ///
    /// Returns once the scans are done; the re-drives of touched instances
    /// keep running in the background. Use [`Supervisor::settle`] to wait
    /// for them.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let mut touched = BTreeSet::new();

        self.scan_timeouts(&mut report, &mut touched)?;
        self.scan_retries(&mut report, &mut touched)?;
        self.scan_instance_timeouts(&mut report)?;

        for id in touched {
            self.spawn_redrive(id);
        }

        Ok(report)
    }

    /// Waits for the re-drives spawned by earlier cycles.
    pub async fn settle(&self) {
        let pending = std::mem::take(&mut *self.lock_redrives());
        for handle in pending {
            if let Err(e) = handle.await {
                error!("Re-drive task failed: {}", e);
            }
        }
    }

    fn spawn_redrive(&self, id: Uuid) {
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = engine.resume(id).await {
                warn!("Failed to resume instance {}: {}", id, e);
            }
        });

        let mut redrives = self.lock_redrives();
        redrives.retain(|h| !h.is_finished());
        redrives.push(handle);
    }

    fn lock_redrives(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.redrives.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scan_timeouts(&self, report: &mut CycleReport, touched: &mut BTreeSet<Uuid>) -> Result<()> {
        let store = self.engine.store();
        let now = self.engine.clock().now();

        for candidate in store.executions_by_status(ExecutionStatus::WaitingApproval) {
            if !candidate.timeout_at.map_or(false, |at| at <= now) {
                continue;
            }
            let timed_out = self.engine.retry_on_conflict(|| {
                let mut execution = store.get_execution(candidate.id)?;
                if execution.status != ExecutionStatus::WaitingApproval {
                    return Ok(None);
                }
                if execution.is_required {
                    execution.fail(APPROVAL_TIMEOUT, false, now)?;
                } else {
                    execution.transition(ExecutionStatus::Skipped, now)?;
                    execution.error_message = Some(APPROVAL_TIMEOUT.to_string());
                }
                store.update_execution(execution).map(Some)
            })?;

            if let Some(execution) = timed_out {
                warn!(
                    "Approval '{}' of instance {} timed out -> {}",
                    execution.step_name, execution.instance_id, execution.status
                );
                let event = if execution.status == ExecutionStatus::Failed {
                    EventType::Failed
                } else {
                    EventType::Skipped
                };
                self.engine.record(
                    execution.instance_id,
                    &execution.step_name,
                    event,
                    Some(APPROVAL_TIMEOUT.to_string()),
                );
                report.approval_timeouts += 1;
                touched.insert(execution.instance_id);
            }
        }

        for candidate in store.executions_by_status(ExecutionStatus::Running) {
            if !candidate.timeout_at.map_or(false, |at| at <= now) {
                continue;
            }
            let stuck = self.engine.retry_on_conflict(|| {
                let mut execution = store.get_execution(candidate.id)?;
                if execution.status != ExecutionStatus::Running {
                    return Ok(None);
                }
                execution.fail("step timed out while running", true, now)?;
                store.update_execution(execution).map(Some)
            })?;

            if let Some(execution) = stuck {
                warn!(
                    "Step '{}' of instance {} stuck in RUNNING, marked failed",
                    execution.step_name, execution.instance_id
                );
                self.engine.abandon_dispatch(execution.id);
                self.engine.record(
                    execution.instance_id,
                    &execution.step_name,
                    EventType::TimedOut,
                    execution.error_message.clone(),
                );
                report.stuck_steps += 1;
                touched.insert(execution.instance_id);
            }
        }

        Ok(())
    }

    fn scan_retries(&self, report: &mut CycleReport, touched: &mut BTreeSet<Uuid>) -> Result<()> {
        let store = self.engine.store();
        let now = self.engine.clock().now();

        for candidate in store.executions_by_status(ExecutionStatus::Failed) {
            if !candidate.retryable {
                continue;
            }
            let instance = store.get_instance(candidate.instance_id)?;
            if instance.is_terminal() {
                continue;
            }
            let definition = self.engine.load_definition(&instance)?;
            let Some(step) = definition.step(&candidate.step_name) else {
                continue;
            };
            let bound = step.effective_retry_bound(&definition);

            let retried = self.engine.retry_on_conflict(|| {
                let mut execution = store.get_execution(candidate.id)?;
                if execution.status != ExecutionStatus::Failed || execution.retries_exhausted(bound) {
                    return Ok(None);
                }
                execution.transition(ExecutionStatus::Pending, now)?;
                execution.retry_count += 1;
                execution.error_message = None;
                execution.retryable = false;
                store.update_execution(execution).map(Some)
            })?;

            let Some(execution) = retried else {
                continue;
            };
            self.engine.retry_on_conflict(|| {
                let mut instance = store.get_instance(execution.instance_id)?;
                instance.retry_count += 1;
                instance.updated_at = now;
                store.update_instance(instance).map(|_| ())
            })?;

            info!(
                "Retrying step '{}' of instance {} ({}/{})",
                execution.step_name, execution.instance_id, execution.retry_count, bound
            );
            self.engine.record(
                execution.instance_id,
                &execution.step_name,
                EventType::Retried,
                Some(format!("retry {}/{}", execution.retry_count, bound)),
            );
            report.retries += 1;
            touched.insert(execution.instance_id);
        }

        Ok(())
    }

    fn scan_instance_timeouts(&self, report: &mut CycleReport) -> Result<()> {
        let store = self.engine.store();
        let now = self.engine.clock().now();

        for candidate in store.list_instances(None) {
            if candidate.is_terminal() || !candidate.timeout_at.map_or(false, |at| at <= now) {
                continue;
            }
            let timed_out = self.engine.retry_on_conflict(|| {
                let mut instance = store.get_instance(candidate.id)?;
                if instance.is_terminal() {
                    return Ok(None);
                }
                instance.transition(InstanceStatus::Timeout, now)?;
                instance.error_message = Some("instance timed out".to_string());
                store.update_instance(instance).map(Some)
            })?;

            if let Some(instance) = timed_out {
                warn!("Instance {} timed out", instance.id);
                self.engine
                    .record(instance.id, INSTANCE_SUBJECT, EventType::TimedOut, None);
                self.engine
                    .skip_active_executions(instance.id, "instance timed out")?;
                report.instance_timeouts += 1;
            }
        }

        Ok(())
    }
}
