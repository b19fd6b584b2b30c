//! Backend pool with per-backend health state and connection accounting.

use crate::config::BackendConfig;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Backend selection error.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no backends available")]
    NoBackendsAvailable,
}

/// A single backend server.
///
/// Health and the active-connection count are the only mutable state; the
/// health flag is written by probes and the dial-failure path, the counter
/// by the proxy. Probes are serialized per backend so a scheduled sweep and
/// an out-of-band probe cannot race on the flag.
#[derive(Debug)]
pub struct Backend {
    name: String,
    host: IpAddr,
    poll_interval: Duration,
    poll_timeout: Duration,
    /// Starts false; the first successful probe marks the backend healthy.
    healthy: AtomicBool,
    active_connections: AtomicU32,
    probe_lock: Mutex<()>,
}

impl Backend {
    /// Create a backend from its configuration.
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            name: config.name.clone(),
            host: config.host,
            poll_interval: config.poll_interval,
            poll_timeout: config.poll_timeout,
            healthy: AtomicBool::new(false),
            active_connections: AtomicU32::new(0),
            probe_lock: Mutex::new(()),
        }
    }

    /// Backend name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of this backend for the given destination port.
    pub fn target(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.host, port)
    }

    /// How often this backend wants to be probed.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Bound on probes and dials against this backend.
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    /// Whether this backend is eligible for new connections.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Overwrite the health flag, e.g. when a dial fails.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Release);
    }

    /// Number of connections currently proxied to this backend.
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Count a proxied connection.
    pub fn add_connection(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Uncount a proxied connection.
    pub fn remove_connection(&self) {
        // Prevent underflow
        let current = self.active_connections.load(Ordering::Relaxed);
        if current > 0 {
            self.active_connections.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Probe this backend with a timed connect to the given port and update
    /// the health flag.
    pub async fn probe(&self, port: u16) -> bool {
        let _guard = self.probe_lock.lock().await;

        let target = self.target(port);
        let healthy = match timeout(self.poll_timeout, TcpStream::connect(target)).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                debug!(backend = %self.name, target = %target, error = %e, "probe failed");
                false
            }
            Err(_) => {
                debug!(backend = %self.name, target = %target, "probe timed out");
                false
            }
        };

        let was_healthy = self.healthy.swap(healthy, Ordering::AcqRel);
        if was_healthy != healthy {
            if healthy {
                debug!(backend = %self.name, "backend marked healthy");
            } else {
                warn!(backend = %self.name, "backend marked unhealthy");
            }
        }

        healthy
    }
}

/// The set of backends shared by one instance's port mappings.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
}

impl BackendPool {
    /// Create a pool from backend configurations, preserving order.
    pub fn new(configs: &[BackendConfig]) -> Self {
        Self {
            backends: configs.iter().map(|c| Arc::new(Backend::new(c))).collect(),
        }
    }

    /// All backends in first-seen order.
    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Select the healthy backend with the fewest active connections.
    ///
    /// Ties go to the earlier backend. Fails when no backend is healthy.
    pub fn select(&self) -> Result<Arc<Backend>, BackendError> {
        let mut selected: Option<&Arc<Backend>> = None;

        for backend in &self.backends {
            if !backend.is_healthy() {
                continue;
            }

            match selected {
                Some(s) if backend.active_connections() >= s.active_connections() => {}
                _ => selected = Some(backend),
            }
        }

        selected.cloned().ok_or(BackendError::NoBackendsAvailable)
    }

    /// Select a backend, running one probe pass over all backends first if
    /// none is currently healthy.
    ///
    /// The extra pass recovers from the gap between scheduled sweeps, e.g.
    /// right after startup or after every backend was marked down at once.
    pub async fn select_or_probe(&self, port: u16) -> Result<Arc<Backend>, BackendError> {
        if let Ok(backend) = self.select() {
            return Ok(backend);
        }

        debug!("no healthy backends, probing all before giving up");
        for backend in &self.backends {
            backend.probe(port).await;
        }

        self.select()
    }

    /// The smallest poll interval across backends, used as the sweep period.
    pub fn min_poll_interval(&self) -> Duration {
        self.backends
            .iter()
            .map(|b| b.poll_interval())
            .min()
            .unwrap_or(Duration::from_secs(10))
    }
}
