//! Watchdog flagging pool workers that stay busy for too long.
//!
//! Native image calls cannot be cancelled, so a wedged decoder or stage keeps
//! its worker forever. The watchdog cannot reclaim the thread; it reports
//! stalled workers in logs, metrics, and the health endpoint so the process
//! can be restarted from outside once every worker is stuck.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::{error, info};

use crate::telemetry;

/// Sleep interval between watchdog checks.
pub(crate) const WATCHDOG_POLL_INTERVAL_MS: u64 = 250;

/// Busy timestamps of every worker (`0` means idle).
#[derive(Debug)]
pub struct WorkerHealth {
    busy_since: Vec<AtomicU64>,
    alive: AtomicUsize,
    stalled: AtomicUsize,
}

impl WorkerHealth {
    pub fn new(workers: usize) -> Self {
        Self {
            busy_since: (0..workers).map(|_| AtomicU64::new(0)).collect(),
            alive: AtomicUsize::new(0),
            stalled: AtomicUsize::new(0),
        }
    }

    pub fn workers(&self) -> usize {
        self.busy_since.len()
    }

    pub(crate) fn begin(&self, worker: usize) {
        if let Some(slot) = self.busy_since.get(worker) {
            slot.store(current_millis().max(1), Ordering::Relaxed);
        }
    }

    pub(crate) fn end(&self, worker: usize) {
        if let Some(slot) = self.busy_since.get(worker) {
            slot.store(0, Ordering::Relaxed);
        }
    }

    pub(crate) fn worker_started(&self) {
        self.alive.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn worker_exited(&self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn alive(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn busy(&self) -> usize {
        self.busy_since
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != 0)
            .count()
    }

    /// Workers whose current job started more than `threshold_ms` before `now`.
    pub fn stalled_workers(&self, now: u64, threshold_ms: u64) -> Vec<usize> {
        self.busy_since
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let since = slot.load(Ordering::Relaxed);
                (since != 0 && now.saturating_sub(since) > threshold_ms).then_some(index)
            })
            .collect()
    }

    /// Stalled count as of the last watchdog pass.
    pub fn stalled(&self) -> usize {
        self.stalled.load(Ordering::Relaxed)
    }
}

/// Spawn the watchdog thread; it exits once `running` turns false.
pub(crate) fn spawn_watchdog(
    health: Arc<WorkerHealth>,
    running: Arc<AtomicBool>,
    threshold: Duration,
) -> io::Result<thread::JoinHandle<()>> {
    let threshold_ms = threshold.as_millis() as u64;
    telemetry::spawn_thread("vision-pool-watchdog", move || {
        let mut previously_stalled: Vec<usize> = Vec::new();
        while running.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS));
            let stalled = health.stalled_workers(current_millis(), threshold_ms);

            for worker in stalled.iter().filter(|w| !previously_stalled.contains(w)) {
                error!(
                    worker,
                    threshold_ms,
                    "pool worker exceeded the stall threshold; its job cannot be cancelled"
                );
            }
            for worker in previously_stalled.iter().filter(|w| !stalled.contains(w)) {
                info!(worker, "pool worker recovered from stall");
            }

            health.stalled.store(stalled.len(), Ordering::Relaxed);
            metrics::gauge!("vision_api_stalled_workers").set(stalled.len() as f64);
            previously_stalled = stalled;
        }
    })
}

pub(crate) fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_workers_are_never_stalled() {
        let health = WorkerHealth::new(3);
        assert!(health.stalled_workers(current_millis() + 1_000_000, 10).is_empty());
        assert_eq!(health.busy(), 0);
    }

    #[test]
    fn long_running_worker_is_reported() {
        let health = WorkerHealth::new(2);
        health.begin(1);
        let now = current_millis();
        assert!(health.stalled_workers(now, 60_000).is_empty());
        assert_eq!(health.stalled_workers(now + 61_000, 60_000), vec![1]);
        health.end(1);
        assert!(health.stalled_workers(now + 61_000, 60_000).is_empty());
    }

    #[test]
    fn watchdog_publishes_stalled_count() {
        let health = Arc::new(WorkerHealth::new(1));
        let running = Arc::new(AtomicBool::new(true));
        health.begin(0);
        let handle = spawn_watchdog(health.clone(), running.clone(), Duration::from_millis(1))
            .unwrap();
        thread::sleep(Duration::from_millis(WATCHDOG_POLL_INTERVAL_MS * 3));
        assert_eq!(health.stalled(), 1);
        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();
    }
}
