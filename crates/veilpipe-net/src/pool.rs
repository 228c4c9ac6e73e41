//! Bounded circuit pool
//!
//! Keeps between `min_circuits` and `max_circuits` established circuits
//! warm. Borrowers take a semaphore permit, so at most `max_circuits`
//! circuits are ever checked out; an exhausted pool makes callers wait
//! up to the acquire timeout instead of building past the cap.

use crate::circuit::CircuitError;
use crate::manager::{destroy_reason, CircuitManager};
use crate::settings::TunnelSettings;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("timed out waiting for a circuit")]
    Timeout,
    #[error("pool closed")]
    Closed,
    #[error("circuit error: {0}")]
    Circuit(#[from] CircuitError),
}

/// Circuits not currently checked out, plus the live total
struct PoolState {
    available: VecDeque<u32>,
    total: usize,
}

/// Pool of pre-built circuits fronting the manager
pub struct CircuitPool {
    manager: Arc<CircuitManager>,
    settings: TunnelSettings,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl CircuitPool {
    pub fn new(manager: Arc<CircuitManager>, settings: TunnelSettings) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(settings.max_circuits));
        Arc::new(Self {
            manager,
            settings,
            semaphore,
            state: Mutex::new(PoolState {
                available: VecDeque::new(),
                total: 0,
            }),
        })
    }

    /// Build circuits until the pool holds `min_circuits`. Build
    /// failures stop the round; the next maintenance pass retries.
    pub async fn warm_up(self: &Arc<Self>) {
        loop {
            {
                let state = self.state.lock();
                if state.total >= self.settings.min_circuits {
                    return;
                }
            }
            if !self.build_one().await {
                return;
            }
        }
    }

    /// Borrow an established circuit, building one if the pool is
    /// under its cap. Waits up to the acquire timeout when every
    /// circuit is checked out.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledCircuit, PoolError> {
        let permit = match tokio::time::timeout(
            self.settings.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Timeout),
        };

        enum Next {
            Reuse(u32),
            Build,
            Wait,
        }

        loop {
            // Prefer a warm circuit; discard any that went bad on the
            // shelf.
            let next = {
                let mut state = self.state.lock();
                match state.available.pop_front() {
                    Some(id) => Next::Reuse(id),
                    None if state.total < self.settings.max_circuits => {
                        state.total += 1; // reserve a build slot
                        Next::Build
                    }
                    // With a permit held this is transient: another
                    // borrower is between release and re-shelving.
                    None => Next::Wait,
                }
            };

            match next {
                Next::Reuse(id) if self.manager.is_healthy(id) => {
                    return Ok(PooledCircuit {
                        id,
                        pool: Arc::clone(self),
                        permit: Some(permit),
                        returned: false,
                    });
                }
                Next::Reuse(id) => {
                    debug!(circuit = id, "discarding unhealthy pooled circuit");
                    self.state.lock().total -= 1;
                    self.manager.destroy_circuit(id, destroy_reason::EXPIRED).await;
                }
                Next::Build => {
                    match self
                        .manager
                        .create_circuit(self.settings.default_hops)
                        .await
                    {
                        Ok(id) => {
                            return Ok(PooledCircuit {
                                id,
                                pool: Arc::clone(self),
                                permit: Some(permit),
                                returned: false,
                            });
                        }
                        Err(e) => {
                            self.state.lock().total -= 1;
                            return Err(e.into());
                        }
                    }
                }
                Next::Wait => {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
            }
        }
    }

    /// Drop shelved circuits the manager no longer vouches for, then
    /// rebuild toward the minimum. Driven by the health monitor.
    pub async fn maintain(self: &Arc<Self>) {
        let stale: Vec<u32> = {
            let mut state = self.state.lock();
            let (healthy, stale): (VecDeque<u32>, VecDeque<u32>) = state
                .available
                .drain(..)
                .partition(|id| self.manager.is_healthy(*id));
            state.available = healthy;
            state.total -= stale.len();
            stale.into_iter().collect()
        };
        for id in stale {
            info!(circuit = id, "reaping unhealthy pooled circuit");
            self.manager.destroy_circuit(id, destroy_reason::EXPIRED).await;
        }

        while self.state.lock().total < self.settings.min_circuits {
            if !self.build_one().await {
                break;
            }
        }
    }

    /// Snapshot: (available, total)
    pub fn size(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.available.len(), state.total)
    }

    async fn build_one(self: &Arc<Self>) -> bool {
        self.state.lock().total += 1;
        match self
            .manager
            .create_circuit(self.settings.default_hops)
            .await
        {
            Ok(id) => {
                self.state.lock().available.push_back(id);
                true
            }
            Err(e) => {
                self.state.lock().total -= 1;
                warn!("pool build failed: {e}");
                false
            }
        }
    }

    fn shelve(&self, id: u32) {
        self.state.lock().available.push_back(id);
    }

    fn retire(&self, id: u32) {
        self.state.lock().total -= 1;
        debug!(circuit = id, "retiring circuit from pool");
    }
}

/// A borrowed circuit. Returned to the pool on drop; use `release` to
/// report it unusable so the pool destroys it instead.
pub struct PooledCircuit {
    id: u32,
    pool: Arc<CircuitPool>,
    permit: Option<OwnedSemaphorePermit>,
    returned: bool,
}

impl PooledCircuit {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Send application bytes down this circuit
    pub async fn send(&self, payload: &[u8]) -> Result<(), CircuitError> {
        self.pool.manager.send_data(self.id, payload).await
    }

    /// Return the circuit, declaring whether it is still usable
    pub async fn release(mut self, healthy: bool) {
        self.returned = true;
        let id = self.id;
        if healthy && self.pool.manager.is_healthy(id) {
            self.pool.shelve(id);
        } else {
            self.pool.retire(id);
            self.pool
                .manager
                .destroy_circuit(id, destroy_reason::EXPIRED)
                .await;
        }
        drop(self.permit.take());
    }
}

impl std::fmt::Debug for PooledCircuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledCircuit")
            .field("id", &self.id)
            .field("returned", &self.returned)
            .finish()
    }
}

impl Drop for PooledCircuit {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if self.pool.manager.is_healthy(self.id) {
            self.pool.shelve(self.id);
        } else {
            self.pool.retire(self.id);
            let manager = Arc::clone(&self.pool.manager);
            let id = self.id;
            tokio::spawn(async move {
                manager.destroy_circuit(id, destroy_reason::EXPIRED).await;
            });
        }
        drop(self.permit.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{manager_harness, register_relay, spawn_test_relay};
    use std::time::Duration;

    fn pool_settings() -> TunnelSettings {
        TunnelSettings {
            default_hops: 1,
            min_circuits: 2,
            max_circuits: 3,
            acquire_timeout: Duration::from_millis(200),
            response_timeout: Duration::from_millis(300),
            send_retry_limit: 1,
            send_retry_base: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_warm_up_reaches_minimum() {
        let relay = spawn_test_relay().await;
        let h = manager_harness(pool_settings()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), pool_settings());
        pool.warm_up().await;

        assert_eq!(pool.size(), (2, 2));
        assert_eq!(h.manager.circuit_count(), 2);
    }

    #[tokio::test]
    async fn test_acquire_reuses_released_circuit() {
        let relay = spawn_test_relay().await;
        let h = manager_harness(pool_settings()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), pool_settings());
        pool.warm_up().await;

        let borrowed = pool.acquire().await.unwrap();
        let id = borrowed.id();
        borrowed.release(true).await;

        // Other warm circuit is ahead in the queue; drain to reach it
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert!(first.id() == id || second.id() == id);
    }

    #[tokio::test]
    async fn test_acquire_builds_on_demand() {
        let relay = spawn_test_relay().await;
        let h = manager_harness(pool_settings()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), pool_settings());
        // No warm-up; first acquire must build
        let borrowed = pool.acquire().await.unwrap();
        assert!(h.manager.is_healthy(borrowed.id()));
        assert_eq!(pool.size(), (0, 1));
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let relay = spawn_test_relay().await;
        let h = manager_harness(pool_settings()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let settings = TunnelSettings {
            max_circuits: 1,
            min_circuits: 1,
            ..pool_settings()
        };
        let pool = CircuitPool::new(Arc::clone(&h.manager), settings);

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Timeout));
        drop(held);

        // Once returned, acquisition succeeds again
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_release_destroys() {
        let relay = spawn_test_relay().await;
        let h = manager_harness(pool_settings()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), pool_settings());
        let borrowed = pool.acquire().await.unwrap();
        let id = borrowed.id();
        borrowed.release(false).await;

        assert_eq!(pool.size(), (0, 0));
        assert!(!h.manager.is_healthy(id));
    }

    #[tokio::test]
    async fn test_maintain_reaps_and_replenishes() {
        let relay = spawn_test_relay().await;
        let settings = TunnelSettings {
            circuit_lifetime: Duration::from_millis(80),
            ..pool_settings()
        };
        let h = manager_harness(settings.clone()).await;
        register_relay(&h.directory, 1, relay.addr, 10);

        let pool = CircuitPool::new(Arc::clone(&h.manager), settings);
        pool.warm_up().await;
        let (_, total_before) = pool.size();
        assert_eq!(total_before, 2);

        // Let the shelved circuits expire, then maintain
        tokio::time::sleep(Duration::from_millis(120)).await;
        pool.maintain().await;

        let (available, total) = pool.size();
        assert_eq!(total, 2, "pool rebuilt to its minimum");
        assert_eq!(available, 2);
    }

    #[tokio::test]
    async fn test_build_failure_surfaces() {
        let h = manager_harness(pool_settings()).await;
        // No relays registered at all
        let pool = CircuitPool::new(Arc::clone(&h.manager), pool_settings());
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Circuit(_)));
        assert_eq!(pool.size(), (0, 0));
    }
}
