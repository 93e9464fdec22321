//! Worker pool for queued dispatch
//!
//! Runs `worker_count` step loops over the shared [`WorkQueue`] plus one
//! [`DuePoller`], with graceful shutdown.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{DuePoller, PollerConfig};
use super::queue::WorkQueue;
use crate::engine::{Scheduler, StepOutcome};
use crate::error::EngineError;
use crate::reliability::duration_millis;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Concurrent step loops
    pub worker_count: usize,

    /// Due-instance poller configuration
    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            worker_count: 4,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `CLINICFLOW_WORKER_COUNT` and `CLINICFLOW_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let worker_count = std::env::var("CLINICFLOW_WORKER_COUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.worker_count);
        let shutdown_timeout = std::env::var("CLINICFLOW_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout);

        defaults
            .with_worker_count(worker_count)
            .with_shutdown_timeout(shutdown_timeout)
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is starting up
    Starting,
    /// Worker is running and stepping instances
    Running,
    /// Finishing in-flight steps, taking no new work
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Pool of step loops draining the scheduler's work queue
///
/// # Example
///
/// ```ignore
/// let engine = WorkflowEngine::new(store, executors, EngineConfig::from_env());
/// let pool = WorkerPool::new(engine.scheduler().clone(), WorkerPoolConfig::from_env());
///
/// pool.start()?;
/// // ...
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_steps: Arc<AtomicUsize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(scheduler: Arc<Scheduler>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            scheduler,
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active_steps: Arc::new(AtomicUsize::new(0)),
            handles: Mutex::new(vec![]),
        }
    }

    /// Start the step loops and the due poller
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if matches!(*status, WorkerPoolStatus::Running | WorkerPoolStatus::Starting) {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Starting;
        }

        info!(
            worker_id = %self.config.worker_id,
            worker_count = self.config.worker_count,
            "Starting worker pool"
        );

        self.shutdown_tx.send_replace(false);
        let mut handles = self.handles.lock();
        for index in 0..self.config.worker_count {
            handles.push(self.spawn_step_loop(index));
        }
        handles.push(self.spawn_due_poller());

        *self.status.write() = WorkerPoolStatus::Running;
        Ok(())
    }

    /// Stop taking work and wait for in-flight steps
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if self.status() == WorkerPoolStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        *self.status.write() = WorkerPoolStatus::Draining;
        self.shutdown_tx.send_replace(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let active = self.active_steps.load(Ordering::SeqCst);
            if active == 0 {
                debug!("All steps completed");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_steps = active, "Shutdown timeout reached");
                return Err(WorkerPoolError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "Worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Steps currently executing
    pub fn active_steps(&self) -> usize {
        self.active_steps.load(Ordering::SeqCst)
    }

    fn spawn_step_loop(&self, index: usize) -> JoinHandle<()> {
        let scheduler = Arc::clone(&self.scheduler);
        let queue: Arc<WorkQueue> = Arc::clone(scheduler.queue());
        let active = Arc::clone(&self.active_steps);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                let instance_id = tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    next = queue.pop() => match next {
                        Some(id) => id,
                        None => break,
                    },
                };

                active.fetch_add(1, Ordering::SeqCst);
                let result = AssertUnwindSafe(scheduler.run_step(instance_id))
                    .catch_unwind()
                    .await;
                active.fetch_sub(1, Ordering::SeqCst);

                match result {
                    Ok(Ok(report)) if report.outcome == StepOutcome::Yielded => {
                        queue.push(instance_id, report.priority);
                    }
                    Ok(Ok(report)) => {
                        debug!(worker = index, instance_id = %instance_id, outcome = ?report.outcome, "step done");
                    }
                    Ok(Err(e)) if e.is_transient() => {
                        warn!(instance_id = %instance_id, "Step failed, left for the due poller: {}", e);
                    }
                    Ok(Err(e)) => {
                        error!(instance_id = %instance_id, "Step failed: {}", e);
                    }
                    Err(_) => {
                        error!(instance_id = %instance_id, "Step panicked");
                    }
                }
            }
            debug!(worker = index, "Step loop exited");
        })
    }

    fn spawn_due_poller(&self) -> JoinHandle<()> {
        let poller = DuePoller::new(
            Arc::clone(&self.scheduler),
            self.config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );
        tokio::spawn(poller.run())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
