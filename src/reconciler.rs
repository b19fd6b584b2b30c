//! Reconciliation of configured services against running instances.
//!
//! The reconciler periodically reloads configuration and launches an
//! instance for every service it has not seen before. Running instances are
//! never reconfigured in place; a terminated instance is retired, not
//! relaunched. All launched instances are tracked in an explicit registry
//! owned here, nothing is process-global.

use crate::addressing::AddressPool;
use crate::config::{ConfigError, ConfigStorage};
use crate::instance::{Instance, InstanceEvent, InstanceHandle};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

enum RegistryEntry {
    Running(InstanceHandle),
    /// Terminated, by stop or by error. Kept so later passes do not
    /// relaunch the service.
    Retired,
}

/// Services the reconciler has launched, by name.
#[derive(Default)]
struct Registry {
    entries: HashMap<String, RegistryEntry>,
}

impl Registry {
    fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn insert_running(&mut self, handle: InstanceHandle) {
        self.entries
            .insert(handle.name().to_string(), RegistryEntry::Running(handle));
    }

    fn retire(&mut self, name: &str) {
        if let Some(entry) = self.entries.get_mut(name) {
            *entry = RegistryEntry::Retired;
        }
    }

    fn running_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| matches!(e, RegistryEntry::Running(_)))
            .count()
    }

    /// Retire every running entry and hand back the handles.
    fn take_running(&mut self) -> Vec<InstanceHandle> {
        let mut handles = Vec::new();
        for entry in self.entries.values_mut() {
            if matches!(entry, RegistryEntry::Running(_)) {
                if let RegistryEntry::Running(handle) =
                    std::mem::replace(entry, RegistryEntry::Retired)
                {
                    handles.push(handle);
                }
            }
        }
        handles
    }
}

/// Periodically reconciles config storage against running instances.
pub struct Reconciler {
    storage: Arc<dyn ConfigStorage>,
    pool: AddressPool,
    interval: Duration,
    registry: Registry,
}

impl Reconciler {
    /// Build a reconciler, reading the initial configuration to set up the
    /// address pool.
    pub fn new(storage: Arc<dyn ConfigStorage>, interval: Duration) -> Result<Self, ConfigError> {
        let config = storage.get_config()?;
        let pool = AddressPool::new(&config.ip_pool);

        Ok(Self {
            storage,
            pool,
            interval,
            registry: Registry::default(),
        })
    }

    /// Run reconcile passes until shutdown, then stop every instance.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?self.interval, "reconciler starting");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    // Steady-state config errors are logged, never fatal
                    if let Err(e) = self.reconcile_pass(&events_tx) {
                        error!(error = %e, "reconcile pass failed");
                    }
                }

                Some(event) = events_rx.recv() => {
                    self.handle_event(event);
                }

                _ = shutdown.recv() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }

        self.stop_all().await;

        // Log terminal outcomes that raced with shutdown
        while let Ok(event) = events_rx.try_recv() {
            self.handle_event(event);
        }
    }

    /// Launch an instance for every configured service not yet in the
    /// registry, assigning and persisting addresses where missing.
    fn reconcile_pass(
        &mut self,
        events_tx: &mpsc::UnboundedSender<InstanceEvent>,
    ) -> Result<(), ConfigError> {
        let mut config = self.storage.get_config()?;
        let mut assigned = false;

        for service in &mut config.services {
            if self.registry.contains(&service.name) {
                continue;
            }

            let address = match service.address {
                Some(addr) => {
                    self.pool.claim(addr.addr());
                    addr
                }
                None => {
                    let addr = match self.pool.allocate() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!(service = %service.name, error = %e, "cannot assign address");
                            continue;
                        }
                    };
                    info!(service = %service.name, address = %addr, "assigned address from pool");
                    service.address = Some(addr);
                    assigned = true;
                    addr
                }
            };

            let instance = Instance::from_service(service, address, self.pool.device());
            let handle = instance.spawn(events_tx.clone());
            info!(service = %handle.name(), address = %handle.address(), "launched instance");
            self.registry.insert_running(handle);
        }

        // Make auto-assigned addresses durable across restarts
        if assigned {
            self.storage.save_config(&config)?;
        }

        Ok(())
    }

    /// Record an instance's terminal outcome. The address goes back to the
    /// pool; the service is not relaunched.
    fn handle_event(&mut self, event: InstanceEvent) {
        match &event.outcome {
            Ok(()) => info!(instance = %event.name, "instance stopped"),
            Err(e) => error!(instance = %event.name, error = %e, "instance terminated"),
        }

        self.pool.release(event.address.addr());
        self.registry.retire(&event.name);
    }

    /// Stop every running instance, waiting for each to drain.
    async fn stop_all(&mut self) {
        let handles = self.registry.take_running();
        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), "stopping all instances");
        futures::future::join_all(handles.iter().map(|h| h.stop())).await;
        info!("all instances stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackendConfig, Config, IpPoolConfig, MemoryStorage, PortMap, Protocol, ServiceConfig,
    };
    use tokio::time::timeout;

    fn test_config(src: u16, dst: u16) -> Config {
        Config {
            ip_pool: IpPoolConfig {
                device: "lo".to_string(),
                // First host of this pool is 127.0.0.1, so instances bind
                // loopback and tests need no privileges
                network: "127.0.0.0/8".parse().unwrap(),
                range_start: None,
                range_end: None,
            },
            services: vec![ServiceConfig {
                name: "svc".to_string(),
                address: None,
                ports: vec![PortMap {
                    name: "main".to_string(),
                    protocol: Protocol::Tcp,
                    src,
                    dst,
                }],
                backends: vec![BackendConfig {
                    name: "b-1".to_string(),
                    host: "127.0.0.1".parse().unwrap(),
                    poll_interval: Duration::from_millis(50),
                    poll_timeout: Duration::from_millis(200),
                }],
            }],
        }
    }

    #[tokio::test]
    async fn test_pass_launches_instance_and_persists_address() {
        let storage = Arc::new(MemoryStorage::new(Some(test_config(32160, 32161))));
        let mut reconciler =
            Reconciler::new(storage.clone(), Duration::from_secs(60)).unwrap();

        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        reconciler.reconcile_pass(&events_tx).unwrap();

        // Auto-assignment is durable
        let saved = storage.get_config().unwrap();
        let addr = saved.services[0].address.expect("address assigned");
        assert_eq!(addr.addr().to_string(), "127.0.0.1");

        // Instance is serving its source port
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tokio::net::TcpStream::connect("127.0.0.1:32160").await.is_ok());

        // A second pass leaves the running instance alone
        reconciler.reconcile_pass(&events_tx).unwrap();
        assert_eq!(reconciler.registry.running_count(), 1);

        timeout(Duration::from_secs(2), reconciler.stop_all())
            .await
            .expect("stop_all should complete");
        assert!(tokio::net::TcpStream::connect("127.0.0.1:32160").await.is_err());
    }

    #[tokio::test]
    async fn test_terminated_instance_is_not_relaunched() {
        // Occupy the service port so the instance fails at bind
        let _blocker = tokio::net::TcpListener::bind("127.0.0.1:32162").await.unwrap();

        let storage = Arc::new(MemoryStorage::new(Some(test_config(32162, 32163))));
        let mut reconciler =
            Reconciler::new(storage, Duration::from_secs(60)).unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        reconciler.reconcile_pass(&events_tx).unwrap();

        let event = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("terminal event")
            .unwrap();
        assert!(event.outcome.is_err());
        reconciler.handle_event(event);
        assert_eq!(reconciler.registry.running_count(), 0);

        // The retired service is skipped on later passes
        reconciler.reconcile_pass(&events_tx).unwrap();
        assert_eq!(reconciler.registry.running_count(), 0);
    }

    #[tokio::test]
    async fn test_released_address_is_reusable() {
        let _blocker = tokio::net::TcpListener::bind("127.0.0.1:32164").await.unwrap();

        let storage = Arc::new(MemoryStorage::new(Some(test_config(32164, 32165))));
        let mut reconciler =
            Reconciler::new(storage, Duration::from_secs(60)).unwrap();

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        reconciler.reconcile_pass(&events_tx).unwrap();
        assert!(reconciler.pool.is_allocated("127.0.0.1".parse().unwrap()));

        let event = events_rx.recv().await.unwrap();
        reconciler.handle_event(event);
        assert!(!reconciler.pool.is_allocated("127.0.0.1".parse().unwrap()));
    }
}
