//! Host network interface binding.
//!
//! Virtual addresses are bound and released with the platform's
//! interface-aliasing command (`ip` on Linux, `ifconfig` on macOS). The
//! loopback address is special-cased as always bound: no command runs and
//! both operations succeed immediately.

use crate::addressing::AddressError;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::debug;

/// Bind an address alias on the given device.
///
/// Exit code 1 from the command maps to [`AddressError::PermissionDenied`],
/// exit code 2 to [`AddressError::AlreadyBound`] which callers treat as
/// success.
pub async fn register_address(addr: IpNet, device: &str) -> Result<(), AddressError> {
    if addr.addr().is_loopback() {
        debug!(address = %addr, "loopback address, skipping interface bind");
        return Ok(());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        debug!(address = %addr, device = device, "binding address");
        run_addr_command(bind_command(&addr, device), addr.addr()).await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = device;
        Err(AddressError::UnsupportedPlatform)
    }
}

/// Remove an address alias from the given device.
///
/// The inverse of [`register_address`]. Callers log failures but never let
/// them block shutdown.
pub async fn unregister_address(addr: IpNet, device: &str) -> Result<(), AddressError> {
    if addr.addr().is_loopback() {
        debug!(address = %addr, "loopback address, skipping interface unbind");
        return Ok(());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    {
        debug!(address = %addr, device = device, "unbinding address");
        run_addr_command(unbind_command(&addr, device), addr.addr()).await
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = device;
        Err(AddressError::UnsupportedPlatform)
    }
}

#[cfg(target_os = "linux")]
fn bind_command(addr: &IpNet, device: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("ip");
    cmd.args(["addr", "add", &addr.to_string(), "dev", device]);
    cmd
}

#[cfg(target_os = "linux")]
fn unbind_command(addr: &IpNet, device: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("ip");
    cmd.args(["addr", "del", &addr.to_string(), "dev", device]);
    cmd
}

#[cfg(target_os = "macos")]
fn bind_command(addr: &IpNet, device: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("ifconfig");
    cmd.args([
        device,
        "inet",
        &addr.addr().to_string(),
        "netmask",
        &addr.netmask().to_string(),
        "alias",
    ]);
    cmd
}

#[cfg(target_os = "macos")]
fn unbind_command(addr: &IpNet, device: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("ifconfig");
    cmd.args([
        device,
        "inet",
        &addr.addr().to_string(),
        "netmask",
        &addr.netmask().to_string(),
        "delete",
    ]);
    cmd
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
async fn run_addr_command(
    mut cmd: tokio::process::Command,
    ip: IpAddr,
) -> Result<(), AddressError> {
    let output = cmd.output().await.map_err(AddressError::Spawn)?;

    if output.status.success() {
        return Ok(());
    }

    Err(exit_error(output.status.code(), ip))
}

/// Map an aliasing command's exit code to an error.
#[cfg_attr(not(any(target_os = "linux", target_os = "macos")), allow(dead_code))]
fn exit_error(code: Option<i32>, ip: IpAddr) -> AddressError {
    match code {
        Some(1) => AddressError::PermissionDenied,
        Some(2) => AddressError::AlreadyBound(ip),
        Some(c) => AddressError::CommandFailed(c),
        // Terminated by signal
        None => AddressError::CommandFailed(-1),
    }
}
