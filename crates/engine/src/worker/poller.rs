//! Due-instance polling with exponential backoff
//!
//! Wakes instances whose retry delay, timer or scheduled start has passed,
//! and picks up running instances left behind by an interrupted step.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::engine::Scheduler;
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Interval right after due work was found
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Ceiling while idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when nothing was due
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }
}

/// Polls the store for due instances and dispatches them
pub struct DuePoller {
    scheduler: Arc<Scheduler>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl DuePoller {
    pub fn new(
        scheduler: Arc<Scheduler>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            scheduler,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Dispatch everything due now, returning how many instances were due
    pub async fn poll(&mut self) -> usize {
        if self.is_shutdown() {
            return 0;
        }

        match self.scheduler.process_due().await {
            Ok(0) => {
                self.increase_backoff();
                trace!(
                    interval_ms = self.current_interval.as_millis() as u64,
                    "nothing due, backing off"
                );
                0
            }
            Ok(count) => {
                self.reset_backoff();
                debug!(count, "dispatched due instances");
                count
            }
            Err(e) => {
                error!("Due poll failed: {}", e);
                self.increase_backoff();
                0
            }
        }
    }

    /// Sleep for the current interval; returns true if shutdown was signaled
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Poll until shutdown
    pub async fn run(mut self) {
        loop {
            if self.is_shutdown() {
                break;
            }
            self.poll().await;
            if self.wait().await {
                break;
            }
        }
        debug!("Due poller exited");
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ExecutorRegistry;
    use crate::config::EngineConfig;
    use crate::definition::DefinitionRegistry;
    use crate::persistence::{InMemoryInstanceStore, InstanceStore};
    use crate::worker::WorkQueue;

    fn poller(config: PollerConfig) -> (DuePoller, watch::Sender<bool>) {
        let store: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::new());
        let scheduler = Arc::new(Scheduler::new(
            store,
            Arc::new(DefinitionRegistry::new(ExecutorRegistry::new())),
            EngineConfig::default(),
            Arc::new(WorkQueue::new()),
        ));
        let (tx, rx) = watch::channel(false);
        (DuePoller::new(scheduler, config, rx), tx)
    }

    #[tokio::test]
    async fn test_idle_poll_backs_off_to_ceiling() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(200))
            .with_backoff_multiplier(2.0);
        let (mut poller, _tx) = poller(config);

        assert_eq!(poller.poll().await, 0);
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        poller.poll().await;
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_wait_returns_on_shutdown() {
        let config = PollerConfig::new().with_min_interval(Duration::from_secs(30));
        let (mut poller, tx) = poller(config);

        tx.send(true).unwrap();
        let stopped = tokio::time::timeout(Duration::from_secs(1), poller.wait())
            .await
            .unwrap();
        assert!(stopped);
        assert!(poller.is_shutdown());
    }

    #[test]
    fn test_backoff_multiplier_floor() {
        let config = PollerConfig::new().with_backoff_multiplier(0.5);
        assert_eq!(config.backoff_multiplier, 1.0);
    }
}
