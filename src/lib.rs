//! viplb - a TCP load balancer with virtual IP management
//!
//! This crate provides a load balancer that:
//! - Allocates virtual IPs from a CIDR pool and binds them on a host device
//! - Proxies TCP connections to the least-loaded healthy backend
//! - Probes backend health and retries failed dials against other backends
//! - Reconciles running instances against persisted configuration

pub mod addressing;
pub mod backend;
pub mod config;
pub mod instance;
pub mod proxy;
pub mod reconciler;
pub mod util;

pub use config::Config;
