//! Virtual address allocation and host interface binding.

mod netdev;
mod pool;

pub use netdev::{register_address, unregister_address};
pub use pool::AddressPool;

use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

/// Errors from address allocation and interface binding.
#[derive(Debug, Error)]
pub enum AddressError {
    /// Every address in the pool's range is allocated.
    #[error("address pool {0} is exhausted")]
    PoolExhausted(IpNet),

    /// The address is already bound on the host. Non-fatal: callers treat
    /// it as success, the binding may be left over from a previous run.
    #[error("address {0} is already bound")]
    AlreadyBound(IpAddr),

    /// The binding command exited with code 1.
    #[error("binding addresses requires elevated privileges (run as root)")]
    PermissionDenied,

    /// No interface-aliasing command is known for this platform.
    #[error("address binding is not supported on this platform")]
    UnsupportedPlatform,

    /// The binding command failed with an unrecognized exit code.
    #[error("address command exited with code {0}")]
    CommandFailed(i32),

    /// The binding command could not be spawned.
    #[error("failed to run address command: {0}")]
    Spawn(#[source] std::io::Error),
}
