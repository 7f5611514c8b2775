//! Bounded worker pool for blocking image work.
//!
//! Decoding, pipeline stages, and encoding call into the native image library
//! and can hold a core for a long time. They run on dedicated OS threads so
//! the HTTP event loop keeps accepting connections and answering health checks.
//!
//! Contract:
//! - `submit` admits a job only while fewer than `workers + queue_capacity`
//!   jobs are admitted; otherwise it fails with [`PoolError::Overloaded`]
//!   immediately.
//! - [`JobHandle::wait`] awaits the job's result.
//! - Dropping a `JobHandle` cancels the job if it is still queued. A job that
//!   already started runs to completion and its result is discarded.
//! - A job that no worker picked up within the queue timeout is answered with
//!   [`PoolError::QueueTimeout`] as soon as the timeout elapses, and never
//!   runs.
//! - A panicking job is reported as [`PoolError::Panicked`]; the worker keeps
//!   serving.

use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    config::PoolConfig,
    telemetry,
    watchdog::{WorkerHealth, spawn_watchdog},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is at capacity")]
    Overloaded,
    #[error("job waited {waited_ms} ms in the queue, longer than the queue timeout")]
    QueueTimeout { waited_ms: u64 },
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("worker pool is shut down")]
    Closed,
}

/// Result of a finished job along with how long it queued.
#[derive(Debug)]
pub struct JobOutput<T> {
    pub value: T,
    pub queue_wait: Duration,
}

/// Point-in-time view of pool occupancy.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub workers: usize,
    pub alive_workers: usize,
    pub busy: usize,
    pub queued: usize,
    pub capacity: usize,
    pub stalled: usize,
    pub accepting: bool,
}

type Delivery = Box<dyn FnOnce() + Send>;

trait QueuedTask: Send {
    fn is_abandoned(&self) -> bool;
    /// Run the job and return the step that hands its result to the waiter.
    fn execute(self: Box<Self>, queue_wait: Duration) -> Delivery;
    fn reject(self: Box<Self>, err: PoolError);
}

struct Task<F, T> {
    job: F,
    started: oneshot::Sender<()>,
    reply: oneshot::Sender<Result<JobOutput<T>, PoolError>>,
    span: tracing::Span,
}

impl<F, T> QueuedTask for Task<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    fn execute(self: Box<Self>, queue_wait: Duration) -> Delivery {
        let Task {
            job,
            started,
            reply,
            span,
        } = *self;
        let _ = started.send(());
        let outcome = span.in_scope(|| panic::catch_unwind(AssertUnwindSafe(job)));
        let result = match outcome {
            Ok(value) => Ok(JobOutput { value, queue_wait }),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                span.in_scope(|| warn!(%message, "pool job panicked"));
                Err(PoolError::Panicked(message))
            }
        };
        Box::new(move || {
            // The waiter may have timed out; the result is discarded then.
            let _ = reply.send(result);
        })
    }

    fn reject(self: Box<Self>, err: PoolError) {
        let _ = self.reply.send(Err(err));
    }
}

/// Releases one admission slot when dropped.
struct Admission {
    shared: Arc<PoolShared>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        let remaining = self.shared.admitted.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("vision_api_pool_in_flight").set(remaining as f64);
    }
}

struct QueuedJob {
    task: Box<dyn QueuedTask>,
    enqueued_at: Instant,
    admission: Admission,
}

struct PoolShared {
    admitted: AtomicUsize,
    capacity: usize,
    running: Arc<AtomicBool>,
    health: Arc<WorkerHealth>,
}

impl PoolShared {
    fn try_admit(self: &Arc<Self>) -> Option<Admission> {
        let mut current = self.admitted.load(Ordering::SeqCst);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.admitted.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    metrics::gauge!("vision_api_pool_in_flight").set((current + 1) as f64);
                    return Some(Admission {
                        shared: self.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// Fixed set of worker threads fed by a bounded queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Sender<QueuedJob>,
    queue: Receiver<QueuedJob>,
    config: PoolConfig,
}

impl WorkerPool {
    /// Start `config.workers` threads and the stall watchdog.
    pub fn new(config: PoolConfig) -> io::Result<Self> {
        let workers = config.workers.max(1);
        let capacity = config.capacity().max(workers);
        let (sender, receiver) = crossbeam_channel::bounded::<QueuedJob>(capacity);
        let running = Arc::new(AtomicBool::new(true));
        let health = Arc::new(WorkerHealth::new(workers));
        let shared = Arc::new(PoolShared {
            admitted: AtomicUsize::new(0),
            capacity,
            running: running.clone(),
            health: health.clone(),
        });

        for index in 0..workers {
            spawn_worker(
                index,
                receiver.clone(),
                health.clone(),
                running.clone(),
                config.queue_timeout,
            )?;
        }
        spawn_watchdog(health, running, config.stall_threshold)?;

        debug!(
            workers,
            queue_capacity = config.queue_capacity,
            "worker pool started"
        );

        Ok(Self {
            shared,
            sender,
            queue: receiver,
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Queue `job` for execution on a worker thread.
    pub fn submit<F, T>(&self, job: F) -> Result<JobHandle<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        let admission = self.shared.try_admit().ok_or_else(|| {
            metrics::counter!("vision_api_pool_rejections_total", "reason" => "capacity")
                .increment(1);
            PoolError::Overloaded
        })?;

        let (reply, receiver) = oneshot::channel();
        let (started_tx, started) = oneshot::channel();
        let enqueued_at = Instant::now();
        let queued = QueuedJob {
            task: Box::new(Task {
                job,
                started: started_tx,
                reply,
                span: tracing::Span::current(),
            }),
            enqueued_at,
            admission,
        };
        match self.sender.try_send(queued) {
            Ok(()) => {
                metrics::gauge!("vision_api_pool_queued").set(self.queue.len() as f64);
                Ok(JobHandle {
                    receiver,
                    started,
                    enqueued_at,
                    queue_timeout: self.config.queue_timeout,
                })
            }
            Err(TrySendError::Full(_)) => Err(PoolError::Overloaded),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Closed),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let health = &self.shared.health;
        let admitted = self.shared.admitted.load(Ordering::SeqCst);
        let busy = health.busy();
        let alive = health.alive();
        let stalled = health.stalled();
        let accepting = self.shared.running.load(Ordering::SeqCst)
            && alive > 0
            && stalled < health.workers()
            && admitted < self.shared.capacity;
        PoolStatus {
            workers: health.workers(),
            alive_workers: alive,
            busy,
            queued: admitted.saturating_sub(busy),
            capacity: self.shared.capacity,
            stalled,
            accepting,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers drain once every sender is gone; the watchdog exits on the flag.
        self.shared.running.store(false, Ordering::SeqCst);
    }
}

/// Awaitable result of a submitted job. Dropping it cancels queued work.
#[derive(Debug)]
pub struct JobHandle<T> {
    receiver: oneshot::Receiver<Result<JobOutput<T>, PoolError>>,
    started: oneshot::Receiver<()>,
    enqueued_at: Instant,
    queue_timeout: Duration,
}

impl<T> JobHandle<T> {
    /// Await the result. Gives up with [`PoolError::QueueTimeout`] once the
    /// job has sat in the queue for the queue timeout; the worker then skips
    /// it.
    pub async fn wait(self) -> Result<JobOutput<T>, PoolError> {
        let JobHandle {
            receiver,
            started,
            enqueued_at,
            queue_timeout,
        } = self;
        let pickup_deadline = tokio::time::Instant::from_std(enqueued_at + queue_timeout);
        // A closed start channel means the worker rejected the job; the
        // reply carries the reason.
        if tokio::time::timeout_at(pickup_deadline, started).await.is_err() {
            metrics::counter!("vision_api_pool_rejections_total", "reason" => "queue_timeout")
                .increment(1);
            return Err(PoolError::QueueTimeout {
                waited_ms: enqueued_at.elapsed().as_millis() as u64,
            });
        }
        receiver.await.map_err(|_| PoolError::Closed)?
    }
}

fn spawn_worker(
    index: usize,
    queue: Receiver<QueuedJob>,
    health: Arc<WorkerHealth>,
    running: Arc<AtomicBool>,
    queue_timeout: Duration,
) -> io::Result<thread::JoinHandle<()>> {
    telemetry::spawn_thread(format!("vision-worker-{index}"), move || {
        struct Alive(Arc<WorkerHealth>);
        impl Drop for Alive {
            fn drop(&mut self) {
                self.0.worker_exited();
            }
        }
        health.worker_started();
        let _alive = Alive(health.clone());

        for job in queue.iter() {
            let QueuedJob {
                task,
                enqueued_at,
                admission,
            } = job;

            if task.is_abandoned() {
                metrics::counter!("vision_api_pool_rejections_total", "reason" => "abandoned")
                    .increment(1);
                debug!(worker = index, "skipping job whose caller went away");
                continue;
            }

            let queue_wait = enqueued_at.elapsed();
            if queue_wait > queue_timeout || !running.load(Ordering::Relaxed) {
                metrics::counter!("vision_api_pool_rejections_total", "reason" => "queue_timeout")
                    .increment(1);
                drop(admission);
                task.reject(PoolError::QueueTimeout {
                    waited_ms: queue_wait.as_millis() as u64,
                });
                continue;
            }

            health.begin(index);
            let deliver = task.execute(queue_wait);
            health.end(index);
            // Free the slot before the waiter wakes so it can resubmit at once.
            drop(admission);
            deliver();
        }
        debug!(worker = index, "worker exiting");
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".into()
    }
}
