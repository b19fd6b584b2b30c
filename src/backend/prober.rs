//! Periodic backend health prober.
//!
//! One prober runs per load balancer instance, sweeping every backend on
//! every port mapping's destination port, for the lifetime of the instance.

use crate::backend::BackendPool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

/// Probes all backends of a pool on a fixed interval.
pub struct HealthProber {
    pool: Arc<BackendPool>,
    /// Destination ports of the owning instance's mappings.
    ports: Vec<u16>,
}

impl HealthProber {
    /// Create a prober for the given pool and destination ports.
    pub fn new(pool: Arc<BackendPool>, ports: Vec<u16>) -> Self {
        Self { pool, ports }
    }

    /// Run probe sweeps until the shutdown signal fires.
    ///
    /// The sweep period is the smallest poll interval across backends; the
    /// first sweep runs immediately.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(ports = ?self.ports, "health prober starting");

        let mut sweep = interval(self.pool.min_poll_interval());
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sweep.tick() => {
                    for port in &self.ports {
                        for backend in self.pool.backends() {
                            let healthy = backend.probe(*port).await;
                            debug!(backend = %backend.name(), port = port, healthy = healthy, "probed");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("health prober shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_pool() -> Arc<BackendPool> {
        Arc::new(BackendPool::new(&[BackendConfig {
            name: "b".to_string(),
            host: "127.0.0.1".parse().unwrap(),
            poll_interval: Duration::from_millis(20),
            poll_timeout: Duration::from_millis(200),
        }]))
    }

    #[tokio::test]
    async fn test_prober_marks_live_backend_healthy() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let pool = fast_pool();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let prober = HealthProber::new(Arc::clone(&pool), vec![port]);
        let handle = tokio::spawn(prober.run(shutdown_rx));

        // First sweep runs immediately; give it a moment
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pool.backends()[0].is_healthy());

        let _ = shutdown_tx.send(());
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("prober should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_prober_marks_dead_backend_unhealthy() {
        // Bind then drop to get a port that refuses connections
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = fast_pool();
        pool.backends()[0].set_healthy(true);

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let prober = HealthProber::new(Arc::clone(&pool), vec![port]);
        let handle = tokio::spawn(prober.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pool.backends()[0].is_healthy());

        let _ = shutdown_tx.send(());
        let _ = timeout(Duration::from_secs(1), handle).await;
    }
}
