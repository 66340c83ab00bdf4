//! Periodic drain trigger.
//!
//! The scheduler owns no loop; this is one possible caller of its drain step.
//! It runs on its own thread, calls `Scheduler::process` with a fixed budget,
//! and sleeps for `interval` whenever a call found nothing to do.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::scheduler::Scheduler;
use super::types::DrainBudget;

/// Sleep granularity for shutdown responsiveness.
const SLEEP_GRANULARITY: Duration = Duration::from_millis(100);

/// Handle for the trigger thread.
///
/// Supports graceful shutdown via `shutdown()` or automatic cleanup on `Drop`.
pub struct DrainTriggerHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<Scheduler>>,
}

impl DrainTriggerHandle {
    /// Request shutdown. The drain call in progress (if any) completes first.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stop the thread and get the scheduler back.
    pub fn join(mut self) -> Option<Scheduler> {
        self.shutdown();
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl Drop for DrainTriggerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Start calling `scheduler.process(budget)` on a separate thread.
pub fn start_drain_trigger(
    scheduler: Scheduler,
    interval: Duration,
    budget: DrainBudget,
) -> DrainTriggerHandle {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    let handle = std::thread::spawn(move || {
        tracing::info!(
            worker = %scheduler.worker_id(),
            interval_ms = interval.as_millis() as u64,
            "Drain trigger started"
        );
        trigger_loop(&scheduler, interval, budget, &flag);
        tracing::info!(worker = %scheduler.worker_id(), "Drain trigger shutting down");
        scheduler
    });

    DrainTriggerHandle {
        shutdown,
        handle: Some(handle),
    }
}

fn trigger_loop(scheduler: &Scheduler, interval: Duration, budget: DrainBudget, shutdown: &AtomicBool) {
    while !shutdown.load(Ordering::Relaxed) {
        let idle = match scheduler.process(budget) {
            Ok(report) => report.is_idle(),
            Err(e) => {
                // Queue items stay in place; the next round retries them.
                tracing::warn!(error = %e, "Drain step failed");
                true
            }
        };

        if idle {
            sleep_unless_shutdown(interval, shutdown);
        }
    }
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let step = SLEEP_GRANULARITY.min(total - slept);
        std::thread::sleep(step);
        slept += step;
    }
}
