//! Configuration data types.
//!
//! These types are the persisted description of the address pool and the
//! services it serves. The reconciler reads them as an immutable snapshot
//! and writes them back only to make an auto-assigned service address
//! durable.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// The virtual address pool services draw from.
    pub ip_pool: IpPoolConfig,

    /// Service definitions.
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

/// Address pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpPoolConfig {
    /// Network device that virtual addresses are bound on.
    pub device: String,

    /// CIDR network addresses are allocated from.
    pub network: IpNet,

    /// Lowest address the allocator may hand out (inclusive).
    #[serde(default)]
    pub range_start: Option<IpAddr>,

    /// Highest address the allocator may hand out (inclusive).
    #[serde(default)]
    pub range_end: Option<IpAddr>,
}

/// A single load-balanced service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Unique name for this service.
    pub name: String,

    /// Address the service listens on. Assigned from the pool and written
    /// back to storage when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpNet>,

    /// Port mappings, one listener each.
    pub ports: Vec<PortMap>,

    /// Backends shared by all of this service's port mappings.
    pub backends: Vec<BackendConfig>,
}

/// A `(source port, destination port)` listener mapping.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PortMap {
    /// Unique name within the service.
    pub name: String,

    /// Wire protocol for this mapping.
    #[serde(default)]
    pub protocol: Protocol,

    /// Port the service listens on.
    pub src: u16,

    /// Port connections are forwarded to on the selected backend.
    pub dst: u16,
}

/// Wire protocol of a port mapping.
///
/// Dispatch is by variant; a protocol without a handler is rejected at
/// validation time. Adding a protocol means adding a variant and its
/// listener implementation.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// Whether a listener implementation exists for this protocol.
    pub fn has_handler(&self) -> bool {
        matches!(self, Protocol::Tcp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// A single backend server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique name within the service.
    pub name: String,

    /// Backend host address. Connections are forwarded to the active
    /// mapping's destination port on this host.
    pub host: IpAddr,

    /// How often the health prober sweeps this backend.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Bound on health probes and backend dials.
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,
}

// Default value functions
fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let json = r#"{
            "ip_pool": {
                "device": "eth0",
                "network": "10.1.0.0/16"
            },
            "services": [
                {
                    "name": "web",
                    "ports": [{"name": "http", "src": 80, "dst": 8080}],
                    "backends": [{"name": "web-1", "host": "10.0.1.10"}]
                }
            ]
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.ip_pool.device, "eth0");
        assert_eq!(config.ip_pool.network.to_string(), "10.1.0.0/16");
        assert!(config.ip_pool.range_start.is_none());

        let svc = &config.services[0];
        assert!(svc.address.is_none());
        assert_eq!(svc.ports[0].protocol, Protocol::Tcp);
        assert_eq!(svc.backends[0].poll_interval, Duration::from_secs(10));
        assert_eq!(svc.backends[0].poll_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_durations_roundtrip() {
        let json = r#"{
            "name": "b",
            "host": "10.0.0.1",
            "poll_interval": "2s",
            "poll_timeout": "500ms"
        }"#;

        let backend: BackendConfig = serde_json::from_str(json).unwrap();
        assert_eq!(backend.poll_interval, Duration::from_secs(2));
        assert_eq!(backend.poll_timeout, Duration::from_millis(500));

        let out = serde_json::to_string(&backend).unwrap();
        assert!(out.contains("500ms"));
    }

    #[test]
    fn test_protocol_serde() {
        let p: Protocol = serde_json::from_str("\"tcp\"").unwrap();
        assert_eq!(p, Protocol::Tcp);
        assert!(p.has_handler());

        let p: Protocol = serde_json::from_str("\"udp\"").unwrap();
        assert_eq!(p, Protocol::Udp);
        assert!(!p.has_handler());
    }

    #[test]
    fn test_service_address_parses_with_prefix() {
        let json = r#"{
            "name": "web",
            "address": "10.1.0.5/16",
            "ports": [{"name": "http", "src": 80, "dst": 8080}],
            "backends": [{"name": "web-1", "host": "10.0.1.10"}]
        }"#;

        let svc: ServiceConfig = serde_json::from_str(json).unwrap();
        let addr = svc.address.unwrap();
        assert_eq!(addr.addr().to_string(), "10.1.0.5");
        assert_eq!(addr.prefix_len(), 16);
    }
}
