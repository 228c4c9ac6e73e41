//! Periodic circuit health sweep
//!
//! Walks every circuit the manager knows, reaps the failed and expired
//! ones, and asks the pool to rebuild toward its minimum. Runs
//! independently of the heartbeat loop so a wedged heartbeat cannot
//! stop reaping.

use crate::circuit::CircuitState;
use crate::manager::{destroy_reason, CircuitManager};
use crate::pool::CircuitPool;
use crate::settings::TunnelSettings;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Sweep outcome counters
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepReport {
    pub inspected: usize,
    pub reaped: usize,
}

/// Reaps dead circuits and keeps the pool topped up
pub struct HealthMonitor {
    manager: Arc<CircuitManager>,
    pool: Arc<CircuitPool>,
    settings: TunnelSettings,
}

impl HealthMonitor {
    pub fn new(
        manager: Arc<CircuitManager>,
        pool: Arc<CircuitPool>,
        settings: TunnelSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            pool,
            settings,
        })
    }

    /// One sweep: destroy failed and expired circuits, then replenish.
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for stats in self.manager.list_circuits() {
            report.inspected += 1;
            let dead = match stats.state {
                CircuitState::Failed | CircuitState::Closed => true,
                CircuitState::Established => !self.manager.is_healthy(stats.id),
                // Builds in flight are the manager's problem until they
                // resolve
                CircuitState::Creating => false,
            };
            if dead {
                info!(circuit = stats.id, state = ?stats.state, "reaping circuit");
                self.manager
                    .destroy_circuit(stats.id, destroy_reason::EXPIRED)
                    .await;
                report.reaped += 1;
            }
        }

        self.pool.maintain().await;
        debug!(
            inspected = report.inspected,
            reaped = report.reaped,
            "health sweep done"
        );
        report
    }

    /// Background sweep loop; stops on shutdown.
    pub fn spawn(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.settings.monitor_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{manager_harness, register_relay, spawn_test_relay};
    use std::time::Duration;

    fn monitor_settings() -> TunnelSettings {
        TunnelSettings {
            default_hops: 1,
            min_circuits: 1,
            max_circuits: 2,
            response_timeout: Duration::from_millis(300),
            send_retry_limit: 1,
            send_retry_base: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_reaps_expired_circuits() {
        let relay = spawn_test_relay().await;
        let settings = TunnelSettings {
            circuit_lifetime: Duration::from_millis(50),
            ..monitor_settings()
        };
        let h = manager_harness(settings.clone()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), settings.clone());
        let monitor = HealthMonitor::new(Arc::clone(&h.manager), pool, settings);

        let id = h.manager.create_circuit(1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        let report = monitor.sweep_once().await;
        assert_eq!(report.reaped, 1);
        assert!(h.manager.circuit_stats(id).is_none());
    }

    #[tokio::test]
    async fn test_sweep_keeps_healthy_circuits() {
        let relay = spawn_test_relay().await;
        let settings = monitor_settings();
        let h = manager_harness(settings.clone()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), settings.clone());
        let monitor = HealthMonitor::new(Arc::clone(&h.manager), pool, settings);

        let id = h.manager.create_circuit(1).await.unwrap();
        let report = monitor.sweep_once().await;
        assert_eq!(report.reaped, 0);
        assert!(h.manager.is_healthy(id));
    }

    #[tokio::test]
    async fn test_sweep_replenishes_pool() {
        let relay = spawn_test_relay().await;
        let settings = monitor_settings();
        let h = manager_harness(settings.clone()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), settings.clone());
        let monitor =
            HealthMonitor::new(Arc::clone(&h.manager), Arc::clone(&pool), settings);

        // Empty pool; the sweep's maintenance pass builds the minimum
        monitor.sweep_once().await;
        let (available, total) = pool.size();
        assert_eq!(available, 1);
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_shutdown() {
        let relay = spawn_test_relay().await;
        let settings = TunnelSettings {
            monitor_interval: Duration::from_millis(20),
            ..monitor_settings()
        };
        let h = manager_harness(settings.clone()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), settings.clone());
        let monitor =
            HealthMonitor::new(Arc::clone(&h.manager), Arc::clone(&pool), settings);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = monitor.spawn(shutdown_rx);

        // A few ticks pass; the pool gets topped up in the background
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(pool.size().1 >= 1);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor task must exit on shutdown")
            .unwrap();
    }
}
