//! Overlay IP allocation
//!
//! Hosts of a CIDR exclude the network and broadcast addresses, except for
//! /31 (both addresses usable) and /32 (the single address). Allocation
//! always hands out the numerically lowest free host so that results are
//! reproducible for a given set of devices.

use dashmap::DashMap;
use ipnetwork::Ipv4Network;
use meshplane_common::{Database, Error, Network, Result};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Numeric range of assignable host addresses in `cidr`
pub fn host_range(cidr: Ipv4Network) -> RangeInclusive<u32> {
    let network = u32::from(cidr.network());
    let broadcast = u32::from(cidr.broadcast());
    match cidr.prefix() {
        31 | 32 => network..=broadcast,
        _ => (network + 1)..=(broadcast - 1),
    }
}

/// Whether `ip` is an assignable host of `cidr`
pub fn is_host(cidr: Ipv4Network, ip: Ipv4Addr) -> bool {
    host_range(cidr).contains(&u32::from(ip))
}

/// Lowest host of `cidr` not present in `used`
pub fn first_free(cidr: Ipv4Network, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    host_range(cidr)
        .map(Ipv4Addr::from)
        .find(|ip| !used.contains(ip))
}

/// `ip` is a host of `cidr` and nobody holds it yet
pub fn is_free(cidr: Ipv4Network, ip: Ipv4Addr, used: &HashSet<Ipv4Addr>) -> bool {
    is_host(cidr, ip) && !used.contains(&ip)
}

/// Allocates overlay IPs against the devices recorded in the database.
///
/// Callers that go on to persist a device must hold the network's lock from
/// [`IpAllocator::lock_network`] across allocation and insert.
pub struct IpAllocator {
    db: Database,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl IpAllocator {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            locks: DashMap::new(),
        }
    }

    /// Serialize allocate-and-insert for one network
    pub async fn lock_network(&self, network_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(network_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Next free overlay IP in `network`
    pub fn allocate(&self, network: &Network) -> Result<Ipv4Addr> {
        let used = self.db.used_ips(network.id)?;
        match first_free(network.cidr, &used) {
            Some(ip) => {
                debug!("Allocated {} in network {} ({} in use)", ip, network.name, used.len());
                Ok(ip)
            }
            None => Err(Error::Exhausted {
                network: network.name.clone(),
                cidr: network.cidr.to_string(),
            }),
        }
    }

    /// Whether `ip` can be assigned to a new device in `network`
    pub fn is_available(&self, network: &Network, ip: Ipv4Addr) -> Result<bool> {
        let used = self.db.used_ips(network.id)?;
        Ok(is_free(network.cidr, ip, &used))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshplane_common::parse_cidr;

    fn ips(list: &[&str]) -> HashSet<Ipv4Addr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_host_range_excludes_network_and_broadcast() {
        let cidr = parse_cidr("10.0.0.0/29").unwrap();
        let hosts: Vec<Ipv4Addr> = host_range(cidr).map(Ipv4Addr::from).collect();
        assert_eq!(hosts.len(), 6);
        assert_eq!(hosts[0], Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(hosts[5], Ipv4Addr::new(10, 0, 0, 6));
    }

    #[test]
    fn test_degenerate_prefixes() {
        let single = parse_cidr("10.0.0.7/32").unwrap();
        assert_eq!(first_free(single, &HashSet::new()), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(first_free(single, &ips(&["10.0.0.7"])), None);

        let pair = parse_cidr("10.0.0.6/31").unwrap();
        assert_eq!(first_free(pair, &HashSet::new()), Some(Ipv4Addr::new(10, 0, 0, 6)));
        assert_eq!(first_free(pair, &ips(&["10.0.0.6"])), Some(Ipv4Addr::new(10, 0, 0, 7)));
    }

    #[test]
    fn test_lowest_free_host() {
        let cidr = parse_cidr("10.0.0.0/29").unwrap();
        assert_eq!(
            first_free(cidr, &ips(&["10.0.0.1", "10.0.0.2"])),
            Some(Ipv4Addr::new(10, 0, 0, 3))
        );
        // Gaps are refilled before higher addresses
        assert_eq!(
            first_free(cidr, &ips(&["10.0.0.1", "10.0.0.3"])),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[test]
    fn test_numeric_not_lexical_order() {
        let cidr = parse_cidr("10.0.0.0/24").unwrap();
        let used: HashSet<Ipv4Addr> = (1..=9).map(|i| Ipv4Addr::new(10, 0, 0, i)).collect();
        assert_eq!(first_free(cidr, &used), Some(Ipv4Addr::new(10, 0, 0, 10)));
    }

    #[test]
    fn test_exhaustion() {
        let cidr = parse_cidr("10.0.0.0/30").unwrap();
        assert_eq!(first_free(cidr, &ips(&["10.0.0.1", "10.0.0.2"])), None);
        // Addresses outside the host range do not count towards exhaustion
        assert_eq!(
            first_free(cidr, &ips(&["10.0.0.0", "10.0.0.3", "10.0.0.1"])),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[test]
    fn test_is_free() {
        let cidr = parse_cidr("10.0.0.0/29").unwrap();
        let used = ips(&["10.0.0.1"]);
        assert!(!is_free(cidr, Ipv4Addr::new(10, 0, 0, 0), &used));
        assert!(!is_free(cidr, Ipv4Addr::new(10, 0, 0, 7), &used));
        assert!(!is_free(cidr, Ipv4Addr::new(10, 0, 1, 2), &used));
        assert!(!is_free(cidr, Ipv4Addr::new(10, 0, 0, 1), &used));
        assert!(is_free(cidr, Ipv4Addr::new(10, 0, 0, 2), &used));
    }

    #[tokio::test]
    async fn test_network_lock_is_shared_per_network() {
        let allocator = IpAllocator::new(Database::open_memory().unwrap());
        let network = Uuid::new_v4();

        let guard = allocator.lock_network(network).await;
        assert!(allocator.locks.get(&network).unwrap().try_lock().is_err());

        // Other networks are unaffected
        let other = allocator.lock_network(Uuid::new_v4()).await;
        drop(other);

        drop(guard);
        assert!(allocator.locks.get(&network).unwrap().try_lock().is_ok());
    }
}
