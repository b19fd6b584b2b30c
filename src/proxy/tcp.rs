//! TCP proxying: backend dialing and bidirectional byte relay.

use crate::backend::BackendPool;
use crate::util::ConnId;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Maximum times one connection is retried against another backend after a
/// dial failure. Selection failures and relay errors are never retried.
pub const MAX_DIAL_RETRIES: u32 = 10;

/// TCP proxy error.
#[derive(Debug, Error)]
pub enum TcpProxyError {
    #[error("failed to connect to backend {0}: {1}")]
    Dial(SocketAddr, #[source] io::Error),

    #[error("connection to backend {0} timed out")]
    DialTimeout(SocketAddr),

    #[error("relay failed: {0}")]
    Relay(#[source] io::Error),

    /// A relay task died without producing a result. Contained to the
    /// connection it belongs to.
    #[error("relay task failed unexpectedly")]
    RelayFault,
}

/// Relay direction, from the proxy's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToBackend,
    BackendToClient,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::ClientToBackend => write!(f, "client->backend"),
            Direction::BackendToClient => write!(f, "backend->client"),
        }
    }
}

/// Outcome of a relay once either direction completed.
#[derive(Debug)]
pub struct RelayDone {
    /// The direction that finished first.
    pub direction: Direction,
    /// Bytes moved in that direction.
    pub bytes: u64,
}

/// Connect to a backend, bounded by the backend's poll timeout.
pub async fn dial_backend(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, TcpProxyError> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(backend = %addr, error = %e, "failed to set TCP_NODELAY on backend connection");
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(TcpProxyError::Dial(addr, e)),
        Err(_) => Err(TcpProxyError::DialTimeout(addr)),
    }
}

/// Pump bytes between client and backend until either direction finishes.
///
/// Each direction runs in its own task so a fault in one cannot take the
/// process down; a task that dies surfaces as [`TcpProxyError::RelayFault`].
/// When the first direction completes (EOF counts as completion, not an
/// error) the other is aborted and both sockets close as their halves drop.
pub async fn relay_bidirectional(
    client: TcpStream,
    backend: TcpStream,
) -> Result<RelayDone, TcpProxyError> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut backend_read, mut backend_write) = backend.into_split();

    let mut to_backend =
        tokio::spawn(async move { tokio::io::copy(&mut client_read, &mut backend_write).await });
    let mut to_client =
        tokio::spawn(async move { tokio::io::copy(&mut backend_read, &mut client_write).await });

    let (result, direction) = tokio::select! {
        r = &mut to_backend => {
            to_client.abort();
            (r, Direction::ClientToBackend)
        }
        r = &mut to_client => {
            to_backend.abort();
            (r, Direction::BackendToClient)
        }
    };

    match result {
        Ok(Ok(bytes)) => Ok(RelayDone { direction, bytes }),
        Ok(Err(e)) => Err(TcpProxyError::Relay(e)),
        Err(_) => Err(TcpProxyError::RelayFault),
    }
}

/// Proxy one accepted connection to a backend from the pool.
///
/// Runs an explicit bounded retry loop: a failed dial marks the backend
/// unhealthy, schedules an out-of-band probe, and tries again with whatever
/// backend selection now yields, up to [`MAX_DIAL_RETRIES`] times. If no
/// backend is available the connection is dropped immediately, there is
/// nothing to retry against. All errors end at this function; none escape
/// to the listener.
pub async fn handle_connection(
    client: TcpStream,
    client_addr: SocketAddr,
    pool: Arc<BackendPool>,
    dst_port: u16,
) {
    let conn_id = ConnId::short();

    if let Err(e) = client.set_nodelay(true) {
        warn!(conn = %conn_id, error = %e, "failed to set TCP_NODELAY on client connection");
    }

    let mut retries = 0u32;

    loop {
        let backend = match pool.select_or_probe(dst_port).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!(conn = %conn_id, client = %client_addr, error = %e, "dropping connection");
                return;
            }
        };

        let target = backend.target(dst_port);
        match dial_backend(target, backend.poll_timeout()).await {
            Ok(stream) => {
                debug!(
                    conn = %conn_id,
                    client = %client_addr,
                    backend = %backend.name(),
                    target = %target,
                    "proxy session starting"
                );

                // Counted only after a successful dial so lost selections
                // never distort the least-connections metric
                backend.add_connection();
                let result = relay_bidirectional(client, stream).await;
                backend.remove_connection();

                match result {
                    Ok(done) => {
                        debug!(
                            conn = %conn_id,
                            direction = %done.direction,
                            bytes = done.bytes,
                            "proxy session completed"
                        );
                    }
                    Err(e) => {
                        warn!(
                            conn = %conn_id,
                            client = %client_addr,
                            backend = %backend.name(),
                            error = %e,
                            "proxy session failed"
                        );
                    }
                }
                return;
            }
            Err(e) => {
                warn!(
                    conn = %conn_id,
                    backend = %backend.name(),
                    target = %target,
                    error = %e,
                    "backend dial failed"
                );
                backend.set_healthy(false);

                // Re-check the backend off the connection path
                let failed = Arc::clone(&backend);
                tokio::spawn(async move {
                    failed.probe(dst_port).await;
                });

                retries += 1;
                if retries > MAX_DIAL_RETRIES {
                    warn!(
                        conn = %conn_id,
                        client = %client_addr,
                        "retry limit reached, dropping connection"
                    );
                    return;
                }

                debug!(conn = %conn_id, retry = retries, "retrying against another backend");
            }
        }
    }
}
