//! Background keep-alive for remote resources.
//!
//! Each tracked resource gets its own tokio task that calls
//! [`ControlPlane::heartbeat`] once per period. Delivery is best effort: a
//! failed tick is logged and the next tick is the retry. Timers are plain
//! tokio tasks, so they never keep the process alive on their own.

use crate::api::ControlPlane;
use crate::config::DEFAULT_HEARTBEAT_INTERVAL;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A running keep-alive timer.
struct HeartbeatEntry {
    period: Duration,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatEntry {
    fn shutdown(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Periodic keep-alive sender, one timer per resource id.
pub struct HeartbeatScheduler {
    api: Arc<dyn ControlPlane>,
    period: Duration,
    entries: Mutex<HashMap<String, HeartbeatEntry>>,
}

impl HeartbeatScheduler {
    /// Create a scheduler with the default 30 second period.
    pub fn new(api: Arc<dyn ControlPlane>) -> Self {
        Self::with_period(api, DEFAULT_HEARTBEAT_INTERVAL)
    }

    /// Create a scheduler with a custom period.
    pub fn with_period(api: Arc<dyn ControlPlane>, period: Duration) -> Self {
        Self {
            api,
            period,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Period between ticks.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start sending heartbeats for `resource_id`.
    ///
    /// Restarting an already tracked resource cancels the previous timer
    /// first, so there is never more than one timer per id. The first
    /// heartbeat is sent one period after this call.
    pub async fn start(&self, resource_id: &str) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::tick_loop(
            Arc::clone(&self.api),
            resource_id.to_string(),
            self.period,
            cancel.clone(),
        ));
        let entry = HeartbeatEntry {
            period: self.period,
            cancel,
            task,
        };

        let previous = self.entries.lock().await.insert(resource_id.to_string(), entry);
        if let Some(previous) = previous {
            tracing::debug!(resource_id = %resource_id, "Replacing existing heartbeat");
            previous.shutdown();
        }
        tracing::info!(
            resource_id = %resource_id,
            period_secs = self.period.as_secs_f64(),
            "Heartbeat started"
        );
    }

    /// Stop the heartbeat for `resource_id`. Returns false if none was running.
    pub async fn stop(&self, resource_id: &str) -> bool {
        let entry = self.entries.lock().await.remove(resource_id);
        match entry {
            Some(entry) => {
                entry.shutdown();
                tracing::info!(resource_id = %resource_id, "Heartbeat stopped");
                true
            }
            None => {
                tracing::trace!(resource_id = %resource_id, "No heartbeat to stop");
                false
            }
        }
    }

    /// Stop every heartbeat.
    pub async fn stop_all(&self) {
        let entries: Vec<(String, HeartbeatEntry)> = self.entries.lock().await.drain().collect();
        let count = entries.len();
        for (_, entry) in entries {
            entry.shutdown();
        }
        tracing::info!(count, "All heartbeats stopped");
    }

    /// Whether a heartbeat is running for `resource_id`.
    pub async fn is_active(&self, resource_id: &str) -> bool {
        self.entries.lock().await.contains_key(resource_id)
    }

    /// Number of running heartbeats.
    pub async fn active_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Period the timer for `resource_id` was started with.
    pub async fn period_of(&self, resource_id: &str) -> Option<Duration> {
        self.entries.lock().await.get(resource_id).map(|e| e.period)
    }

    async fn tick_loop(
        api: Arc<dyn ControlPlane>,
        resource_id: String,
        period: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::trace!(resource_id = %resource_id, "Heartbeat loop cancelled");
                    break;
                }

                _ = ticker.tick() => {
                    match api.heartbeat(&resource_id).await {
                        Ok(()) => tracing::trace!(resource_id = %resource_id, "Heartbeat sent"),
                        Err(e) => tracing::warn!(resource_id = %resource_id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        for (_, entry) in self.entries.get_mut().drain() {
            entry.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AcceptedOperation;
    use crate::config::SandboxConfig;
    use crate::error::{CoreError, OperationError, Result};
    use crate::events::EventStream;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingApi {
        beats: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ControlPlane for CountingApi {
        async fn create_sandbox(&self, _config: &SandboxConfig) -> Result<AcceptedOperation> {
            unimplemented!()
        }
        async fn create_snapshot(&self, _id: &str, _name: &str) -> Result<AcceptedOperation> {
            unimplemented!()
        }
        async fn delete_sandbox(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn heartbeat(&self, _id: &str) -> Result<()> {
            self.beats.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CoreError::Transport("connection refused".into()));
            }
            Ok(())
        }
        async fn subscribe(&self, _id: &str) -> std::result::Result<EventStream, OperationError> {
            unimplemented!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_once_per_period() {
        let api = Arc::new(CountingApi::default());
        let scheduler = HeartbeatScheduler::with_period(api.clone(), Duration::from_secs(30));

        scheduler.start("sb-1").await;
        tokio::time::sleep(Duration::from_secs(95)).await;

        assert_eq!(api.beats.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_single_timer() {
        let api = Arc::new(CountingApi::default());
        let scheduler = HeartbeatScheduler::with_period(api.clone(), Duration::from_secs(30));

        scheduler.start("sb-1").await;
        scheduler.start("sb-1").await;
        assert_eq!(scheduler.active_count().await, 1);

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(api.beats.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_keeps_timer_running() {
        let api = Arc::new(CountingApi {
            fail: true,
            ..Default::default()
        });
        let scheduler = HeartbeatScheduler::with_period(api.clone(), Duration::from_secs(10));

        scheduler.start("sb-1").await;
        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(api.beats.load(Ordering::SeqCst), 3);
        assert!(scheduler.is_active("sb-1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_ticks() {
        let api = Arc::new(CountingApi::default());
        let scheduler = HeartbeatScheduler::with_period(api.clone(), Duration::from_secs(10));

        scheduler.start("sb-1").await;
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(scheduler.stop("sb-1").await);
        assert!(!scheduler.stop("sb-1").await);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.beats.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_resources_and_stop_all() {
        let api = Arc::new(CountingApi::default());
        let scheduler = HeartbeatScheduler::with_period(api.clone(), Duration::from_secs(10));

        scheduler.start("sb-1").await;
        scheduler.start("sb-2").await;
        assert_eq!(scheduler.period_of("sb-2").await, Some(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(api.beats.load(Ordering::SeqCst), 4);

        scheduler.stop_all().await;
        assert_eq!(scheduler.active_count().await, 0);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.beats.load(Ordering::SeqCst), 4);
    }
}
