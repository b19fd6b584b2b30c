//! Configuration validation.

use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - A pool device and usable network
/// - Unique service names
/// - Unique preassigned addresses
/// - Services with at least one port mapping and one backend
/// - Unique mapping names and nonzero ports within a service
/// - Port mapping protocols that have a registered handler
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing the problem.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.ip_pool.device.is_empty() {
        errors.push("ip_pool device cannot be empty".to_string());
    }

    if let (Some(start), Some(end)) = (config.ip_pool.range_start, config.ip_pool.range_end) {
        if start > end {
            errors.push(format!(
                "ip_pool range_start {start} is above range_end {end}"
            ));
        }
    }

    let mut service_names = HashSet::new();
    let mut addresses = HashSet::new();

    for service in &config.services {
        if service.name.is_empty() {
            errors.push("service name cannot be empty".to_string());
        }

        if !service_names.insert(&service.name) {
            errors.push(format!("duplicate service name: {}", service.name));
        }

        // Two running services must never share an address
        if let Some(addr) = service.address {
            if !addresses.insert(addr.addr()) {
                errors.push(format!(
                    "duplicate service address: {} (service: {})",
                    addr, service.name
                ));
            }
        }

        if service.ports.is_empty() {
            errors.push(format!(
                "service '{}' must have at least one port mapping",
                service.name
            ));
        }

        if service.backends.is_empty() {
            errors.push(format!(
                "service '{}' must have at least one backend",
                service.name
            ));
        }

        let mut port_names = HashSet::new();
        for port in &service.ports {
            if !port_names.insert(&port.name) {
                errors.push(format!(
                    "duplicate port mapping name '{}' in service '{}'",
                    port.name, service.name
                ));
            }

            if port.src == 0 || port.dst == 0 {
                errors.push(format!(
                    "port mapping '{}' in service '{}' has a zero port",
                    port.name, service.name
                ));
            }

            if !port.protocol.has_handler() {
                errors.push(format!(
                    "port mapping '{}' in service '{}' uses protocol {} which has no handler",
                    port.name, service.name, port.protocol
                ));
            }
        }

        let mut backend_names = HashSet::new();
        for backend in &service.backends {
            if !backend_names.insert(&backend.name) {
                errors.push(format!(
                    "duplicate backend name '{}' in service '{}'",
                    backend.name, service.name
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}
