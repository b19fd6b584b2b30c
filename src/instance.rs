//! Load balancer instance lifecycle.
//!
//! One instance owns one virtual address and a listener per port mapping.
//! Its life runs Created -> Registering -> Listening -> Stopping -> Stopped:
//! the address is registered before anything listens, and unregistered
//! (best-effort) after every listener has closed. A stop request is answered
//! only once that teardown is complete.

use crate::addressing::{self, AddressError};
use crate::backend::{BackendPool, HealthProber};
use crate::config::{PortMap, Protocol, ServiceConfig};
use crate::proxy;
use ipnet::IpNet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Errors that terminate an instance.
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("failed to register address {addr}: {source}")]
    Register {
        addr: IpNet,
        #[source]
        source: AddressError,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("accept failed on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no handler for protocol {0}")]
    UnsupportedProtocol(Protocol),
}

/// Terminal report an instance sends to its supervisor.
#[derive(Debug)]
pub struct InstanceEvent {
    pub name: String,
    pub address: IpNet,
    pub outcome: Result<(), InstanceError>,
}

/// Handle to a running instance.
pub struct InstanceHandle {
    name: String,
    address: IpNet,
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl InstanceHandle {
    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address the instance is bound to.
    pub fn address(&self) -> IpNet {
        self.address
    }

    /// Stop the instance and wait for it to drain.
    ///
    /// Returns once the listeners are closed and the address is
    /// unregistered. Returns immediately if the instance already
    /// terminated.
    pub async fn stop(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.stop_tx.send(reply_tx).await.is_ok() {
            let _ = reply_rx.await;
        }
    }
}

/// One load balancer: an address, its port mappings, and a backend pool.
pub struct Instance {
    name: String,
    address: IpNet,
    device: String,
    ports: Vec<PortMap>,
    pool: Arc<BackendPool>,
}

impl Instance {
    /// Build an instance for a service with its resolved address.
    pub fn from_service(service: &ServiceConfig, address: IpNet, device: &str) -> Self {
        Self {
            name: service.name.clone(),
            address,
            device: device.to_string(),
            ports: service.ports.clone(),
            pool: Arc::new(BackendPool::new(&service.backends)),
        }
    }

    /// Launch the instance and return a handle to stop it.
    ///
    /// The terminal outcome, whether a clean stop or a fatal error, is
    /// delivered on `events`.
    pub fn spawn(self, events: mpsc::UnboundedSender<InstanceEvent>) -> InstanceHandle {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = InstanceHandle {
            name: self.name.clone(),
            address: self.address,
            stop_tx,
        };

        tokio::spawn(self.run(stop_rx, events));
        handle
    }

    async fn run(
        self,
        mut stop_rx: mpsc::Receiver<oneshot::Sender<()>>,
        events: mpsc::UnboundedSender<InstanceEvent>,
    ) {
        info!(instance = %self.name, address = %self.address, "registering address");

        match addressing::register_address(self.address, &self.device).await {
            Ok(()) => {}
            // The address may legitimately be left over from a previous run
            Err(AddressError::AlreadyBound(_)) => {
                info!(instance = %self.name, address = %self.address, "address already bound, continuing");
            }
            Err(e) => {
                error!(instance = %self.name, address = %self.address, error = %e, "address registration failed");
                let _ = events.send(InstanceEvent {
                    name: self.name.clone(),
                    address: self.address,
                    outcome: Err(InstanceError::Register {
                        addr: self.address,
                        source: e,
                    }),
                });
                return;
            }
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        // Accept loops report fatal errors here; sized for one per listener
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<InstanceError>(self.ports.len().max(1));
        let mut tasks = Vec::new();

        let prober = HealthProber::new(
            Arc::clone(&self.pool),
            self.ports.iter().map(|p| p.dst).collect(),
        );
        tasks.push(tokio::spawn(prober.run(shutdown_tx.subscribe())));

        // Bind every listener before serving any of them
        let mut bound = Vec::new();
        let mut bind_error = None;
        for mapping in &self.ports {
            match self.bind_mapping(mapping).await {
                Ok(listener) => bound.push((listener, mapping.clone())),
                Err(e) => {
                    error!(instance = %self.name, mapping = %mapping.name, error = %e, "failed to start listener");
                    bind_error = Some(e);
                    break;
                }
            }
        }

        let mut stop_reply: Option<oneshot::Sender<()>> = None;
        let outcome = match bind_error {
            Some(e) => {
                // Close any listeners that did bind; none of them served
                drop(bound);
                Err(e)
            }
            None => {
                for (listener, mapping) in bound {
                    let addr = SocketAddr::new(self.address.addr(), mapping.src);
                    tasks.push(tokio::spawn(accept_loop(
                        listener,
                        addr,
                        mapping,
                        Arc::clone(&self.pool),
                        shutdown_tx.subscribe(),
                        fatal_tx.clone(),
                        self.name.clone(),
                    )));
                }

                info!(
                    instance = %self.name,
                    address = %self.address,
                    mappings = self.ports.len(),
                    "listening"
                );

                tokio::select! {
                    reply = stop_rx.recv() => {
                        info!(instance = %self.name, "stop requested");
                        stop_reply = reply;
                        Ok(())
                    }
                    fatal = fatal_rx.recv() => {
                        // The instance keeps a sender, so recv cannot yield
                        // None before a real error arrives
                        match fatal {
                            Some(e) => {
                                error!(instance = %self.name, error = %e, "listener failed, stopping instance");
                                Err(e)
                            }
                            None => Ok(()),
                        }
                    }
                }
            }
        };

        debug!(instance = %self.name, "draining");
        let _ = shutdown_tx.send(());
        for task in tasks {
            let _ = task.await;
        }

        // Best-effort: an unbind failure must never block shutdown
        if let Err(e) = addressing::unregister_address(self.address, &self.device).await {
            warn!(instance = %self.name, address = %self.address, error = %e, "failed to unregister address");
        }

        info!(instance = %self.name, "stopped");

        let _ = events.send(InstanceEvent {
            name: self.name,
            address: self.address,
            outcome,
        });

        if let Some(reply) = stop_reply {
            let _ = reply.send(());
        }
    }

    async fn bind_mapping(&self, mapping: &PortMap) -> Result<TcpListener, InstanceError> {
        if !mapping.protocol.has_handler() {
            return Err(InstanceError::UnsupportedProtocol(mapping.protocol));
        }

        let addr = SocketAddr::new(self.address.addr(), mapping.src);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| InstanceError::Bind { addr, source: e })?;

        info!(
            instance = %self.name,
            mapping = %mapping.name,
            listen = %addr,
            dst = mapping.dst,
            "listener bound"
        );

        Ok(listener)
    }
}

/// Accept connections for one port mapping until shutdown or a fatal error.
///
/// Each accepted connection is proxied in its own task; in-flight
/// connections are not interrupted when the loop exits.
async fn accept_loop(
    listener: TcpListener,
    addr: SocketAddr,
    mapping: PortMap,
    pool: Arc<BackendPool>,
    mut shutdown: broadcast::Receiver<()>,
    fatal: mpsc::Sender<InstanceError>,
    instance: String,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(instance = %instance, mapping = %mapping.name, client = %peer, "accepted connection");
                        tokio::spawn(proxy::handle_connection(
                            stream,
                            peer,
                            Arc::clone(&pool),
                            mapping.dst,
                        ));
                    }
                    Err(e) => {
                        error!(instance = %instance, listen = %addr, error = %e, "accept failed");
                        let _ = fatal.try_send(InstanceError::Accept { addr, source: e });
                        break;
                    }
                }
            }

            _ = shutdown.recv() => {
                info!(instance = %instance, mapping = %mapping.name, "listener shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Protocol};
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_service(src: u16, dst: u16, protocol: Protocol) -> ServiceConfig {
        ServiceConfig {
            name: "test".to_string(),
            address: None,
            ports: vec![PortMap {
                name: "main".to_string(),
                protocol,
                src,
                dst,
            }],
            backends: vec![BackendConfig {
                name: "b-1".to_string(),
                host: "127.0.0.1".parse().unwrap(),
                poll_interval: Duration::from_millis(50),
                poll_timeout: Duration::from_millis(200),
            }],
        }
    }

    fn loopback() -> IpNet {
        "127.0.0.1/8".parse().unwrap()
    }

    #[tokio::test]
    async fn test_stop_closes_listener() {
        let service = test_service(32150, 32151, Protocol::Tcp);
        let instance = Instance::from_service(&service, loopback(), "lo");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let handle = instance.spawn(events_tx);

        // Wait until the listener accepts connections
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(tokio::net::TcpStream::connect("127.0.0.1:32150").await.is_ok());

        timeout(Duration::from_secs(2), handle.stop())
            .await
            .expect("stop should complete");

        // Listener must be closed once stop has returned
        assert!(tokio::net::TcpStream::connect("127.0.0.1:32150").await.is_err());

        let event = events_rx.recv().await.expect("terminal event");
        assert_eq!(event.name, "test");
        assert!(event.outcome.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        // Occupy the port first
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:32152").await.unwrap();

        let service = test_service(32152, 32153, Protocol::Tcp);
        let instance = Instance::from_service(&service, loopback(), "lo");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _handle = instance.spawn(events_tx);

        let event = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("event should arrive")
            .unwrap();
        assert!(matches!(
            event.outcome.unwrap_err(),
            InstanceError::Bind { .. }
        ));

        drop(blocker);
    }

    #[tokio::test]
    async fn test_unhandled_protocol_is_fatal() {
        let service = test_service(32154, 32155, Protocol::Udp);
        let instance = Instance::from_service(&service, loopback(), "lo");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _handle = instance.spawn(events_tx);

        let event = timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("event should arrive")
            .unwrap();
        assert!(matches!(
            event.outcome.unwrap_err(),
            InstanceError::UnsupportedProtocol(Protocol::Udp)
        ));
    }

    #[tokio::test]
    async fn test_stop_after_termination_returns() {
        let service = test_service(32156, 32157, Protocol::Udp);
        let instance = Instance::from_service(&service, loopback(), "lo");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let handle = instance.spawn(events_tx);

        // Instance dies on its own from the unsupported protocol
        let _ = events_rx.recv().await;

        // Stopping an already-dead instance must not hang
        timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("stop should return immediately");
    }
}
