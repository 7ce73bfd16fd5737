//! Overlay IP Address Allocation
//!
//! Next-fit allocator inside the configured prefix. The network address and
//! the first host address are reserved; the scan skips both. Releasing an
//! address resets the cursor to the prefix base so the next allocation can
//! reclaim earlier holes (trades scan cost for reuse).

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use ipnet::Ipv4Net;

use crate::error::{ControlError, ControlResult};

/// IP allocator for the overlay prefix
pub struct Ipam {
    prefix: Ipv4Net,
    inner: Mutex<IpamState>,
}

struct IpamState {
    allocated: HashSet<Ipv4Addr>,
    cursor: u32,
}

impl Ipam {
    /// Create an allocator over `prefix`, pre-seeding already-allocated addresses
    pub fn new(prefix: Ipv4Net, allocated: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        Self {
            prefix,
            inner: Mutex::new(IpamState {
                allocated: allocated.into_iter().collect(),
                cursor: u32::from(prefix.network()),
            }),
        }
    }

    /// The configured prefix
    pub fn prefix(&self) -> Ipv4Net {
        self.prefix
    }

    /// Allocate the next free address inside the prefix
    ///
    /// Scans forward from the cursor, skipping allocated and reserved
    /// addresses; fails with `NoAddresses` once the scan leaves the prefix.
    pub fn allocate(&self) -> ControlResult<Ipv4Addr> {
        let mut state = self.inner.lock().expect("ipam lock poisoned");
        let last = u32::from(self.prefix.broadcast());

        let mut candidate = state.cursor;
        while candidate < last {
            candidate += 1;
            let addr = Ipv4Addr::from(candidate);
            if self.is_reserved(addr) || state.allocated.contains(&addr) {
                continue;
            }
            state.allocated.insert(addr);
            state.cursor = candidate;
            return Ok(addr);
        }

        Err(ControlError::NoAddresses)
    }

    /// Release an address back to the pool
    pub fn release(&self, addr: Ipv4Addr) {
        let mut state = self.inner.lock().expect("ipam lock poisoned");
        state.allocated.remove(&addr);
        state.cursor = u32::from(self.prefix.network());
    }

    fn is_reserved(&self, addr: Ipv4Addr) -> bool {
        let base = u32::from(self.prefix.network());
        let a = u32::from(addr);
        a == base || a == base + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipam(prefix: &str) -> Ipam {
        Ipam::new(prefix.parse().unwrap(), [])
    }

    #[test]
    fn test_first_allocation_skips_reserved() {
        let ipam = ipam("100.70.0.0/24");
        assert_eq!(ipam.allocate().unwrap(), "100.70.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ipam.allocate().unwrap(), "100.70.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_exhaustion_in_small_prefix() {
        let ipam = ipam("100.70.0.0/30");
        assert_eq!(ipam.allocate().unwrap(), "100.70.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ipam.allocate().unwrap(), "100.70.0.3".parse::<Ipv4Addr>().unwrap());
        assert!(matches!(ipam.allocate(), Err(ControlError::NoAddresses)));
    }

    #[test]
    fn test_release_reclaims_exactly_that_address() {
        let ipam = ipam("100.70.0.0/30");
        let first = ipam.allocate().unwrap();
        let _second = ipam.allocate().unwrap();
        assert!(ipam.allocate().is_err());

        ipam.release(first);
        assert_eq!(ipam.allocate().unwrap(), first);
        assert!(ipam.allocate().is_err());
    }

    #[test]
    fn test_preseeded_addresses_are_skipped() {
        let ipam = Ipam::new(
            "100.70.0.0/24".parse().unwrap(),
            ["100.70.0.2".parse().unwrap()],
        );
        assert_eq!(ipam.allocate().unwrap(), "100.70.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_allocations_are_unique() {
        let ipam = ipam("100.70.0.0/28");
        let mut seen = HashSet::new();
        while let Ok(addr) = ipam.allocate() {
            assert!(seen.insert(addr), "duplicate allocation {addr}");
            assert!(addr != "100.70.0.0".parse::<Ipv4Addr>().unwrap());
            assert!(addr != "100.70.0.1".parse::<Ipv4Addr>().unwrap());
        }
        assert_eq!(seen.len(), 16 - 2); // /28 minus the reserved pair
    }
}
