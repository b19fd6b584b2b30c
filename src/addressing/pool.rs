//! CIDR address pool.

use crate::addressing::AddressError;
use crate::config::IpPoolConfig;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Pool of virtual addresses allocated to services.
///
/// Allocation scans the pool's network in ascending order, skipping the
/// network and broadcast addresses and anything already allocated. The
/// allocated set is guarded by its own lock; the external bind/unbind
/// commands in [`super::netdev`] run without it.
pub struct AddressPool {
    device: String,
    network: IpNet,
    range_start: Option<IpAddr>,
    range_end: Option<IpAddr>,
    allocated: Mutex<BTreeSet<IpAddr>>,
}

impl AddressPool {
    /// Create a pool from its configuration.
    pub fn new(config: &IpPoolConfig) -> Self {
        Self {
            device: config.device.clone(),
            network: config.network,
            range_start: config.range_start,
            range_end: config.range_end,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    /// Device that pool addresses are bound on.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Network the pool allocates from.
    pub fn network(&self) -> IpNet {
        self.network
    }

    /// Allocate the first free address in the pool.
    ///
    /// The returned address carries the pool network's prefix length and is
    /// marked allocated before this returns.
    pub fn allocate(&self) -> Result<IpNet, AddressError> {
        let mut allocated = self.allocated.lock();

        for ip in self.network.hosts() {
            if self.range_start.is_some_and(|start| ip < start) {
                continue;
            }
            if self.range_end.is_some_and(|end| ip > end) {
                break;
            }
            if allocated.contains(&ip) {
                continue;
            }

            allocated.insert(ip);
            let addr = IpNet::new(ip, self.network.prefix_len())
                .expect("prefix length comes from the pool network");
            return Ok(addr);
        }

        Err(AddressError::PoolExhausted(self.network))
    }

    /// Mark a preassigned address as allocated.
    pub fn claim(&self, ip: IpAddr) {
        self.allocated.lock().insert(ip);
    }

    /// Return an address to the pool. Releasing an address that is not
    /// allocated is a no-op.
    pub fn release(&self, ip: IpAddr) {
        self.allocated.lock().remove(&ip);
    }

    /// Whether the given address is currently allocated.
    pub fn is_allocated(&self, ip: IpAddr) -> bool {
        self.allocated.lock().contains(&ip)
    }
}
