//! IPv4 routing table.
//!
//! An ordered list of destination/netmask/gateway entries with first-match
//! lookup and a default-gateway fallback. Route ordering is significant:
//! the table performs no conflict detection on insert, so callers must add
//! more-specific routes before less-specific ones.

use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::ipv4::Ipv4Addr;

bitflags! {
    /// Route entry flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RouteFlags: u32 {
        /// Route is usable.
        const UP       = 1 << 0;
        /// Traffic goes through the gateway address.
        const GATEWAY  = 1 << 1;
        /// Destination is a single host (netmask /32).
        const HOST     = 1 << 2;
        /// Route points at the loopback interface.
        const LOOPBACK = 1 << 3;
    }
}

/// A single routing table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub dest: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub flags: RouteFlags,
    pub metric: u32,
    /// Index of the owning interface.
    pub ifindex: usize,
}

impl RouteEntry {
    /// True if `addr` falls inside this entry's destination network.
    #[inline]
    pub fn matches(&self, addr: Ipv4Addr) -> bool {
        (addr.to_u32() & self.netmask.to_u32()) == (self.dest.to_u32() & self.netmask.to_u32())
    }

    /// Next-hop address for a packet routed through this entry.
    #[inline]
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.flags.contains(RouteFlags::GATEWAY) {
            self.gateway
        } else {
            dst
        }
    }
}

// ============================================================================
// RouteTable
// ============================================================================

/// The routing table: an ordered list scanned front to back.
pub struct RouteTable {
    entries: Mutex<Vec<RouteEntry>>,
}

impl RouteTable {
    pub const fn new() -> Self {
        RouteTable {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Append a route.
    ///
    /// Lookup is first-match in insertion order; callers adding both a
    /// specific route and a default route must insert the specific one
    /// first. The table does not reorder or detect conflicts.
    pub fn add(
        &self,
        dest: Ipv4Addr,
        gateway: Ipv4Addr,
        netmask: Ipv4Addr,
        flags: RouteFlags,
        metric: u32,
        ifindex: usize,
    ) {
        self.entries.lock().push(RouteEntry {
            dest,
            gateway,
            netmask,
            flags,
            metric,
            ifindex,
        });
    }

    /// Resolve a destination address.
    ///
    /// First pass returns the first entry whose masked destination matches;
    /// if none matches, a second pass returns the first gateway-flagged
    /// entry (the default route).
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<RouteEntry> {
        let entries = self.entries.lock();

        if let Some(entry) = entries.iter().find(|e| e.matches(addr)) {
            return Some(*entry);
        }
        entries
            .iter()
            .find(|e| e.flags.contains(RouteFlags::GATEWAY))
            .copied()
    }

    /// First route owned by the given interface, if any.
    pub fn lookup_by_interface(&self, ifindex: usize) -> Option<RouteEntry> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.ifindex == ifindex)
            .copied()
    }

    /// Purge every route owned by the given interface (interface detach).
    /// Returns the number of routes removed.
    pub fn remove_all_for(&self, ifindex: usize) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.ifindex != ifindex);
        before - entries.len()
    }

    /// Number of installed routes.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if no routes are installed.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_default() -> RouteTable {
        let table = RouteTable::new();
        // Specific route first, then the default — the ordering contract.
        table.add(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(255, 255, 255, 0),
            RouteFlags::UP,
            0,
            0,
        );
        table.add(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::UNSPECIFIED,
            RouteFlags::UP | RouteFlags::GATEWAY,
            0,
            0,
        );
        table
    }

    #[test]
    fn specific_route_matches_before_default() {
        let table = table_with_default();
        let route = table.lookup(Ipv4Addr::new(10, 0, 0, 5)).unwrap();
        assert_eq!(route.dest, Ipv4Addr::new(10, 0, 0, 0));
        assert!(!route.flags.contains(RouteFlags::GATEWAY));
        assert_eq!(route.next_hop(Ipv4Addr::new(10, 0, 0, 5)), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn unmatched_address_falls_back_to_gateway() {
        let table = table_with_default();
        let route = table.lookup(Ipv4Addr::new(8, 8, 8, 8)).unwrap();
        assert!(route.flags.contains(RouteFlags::GATEWAY));
        assert_eq!(route.next_hop(Ipv4Addr::new(8, 8, 8, 8)), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn lookup_fails_with_no_default() {
        let table = RouteTable::new();
        table.add(
            Ipv4Addr::new(192, 168, 1, 0),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(255, 255, 255, 0),
            RouteFlags::UP,
            0,
            1,
        );
        assert!(table.lookup(Ipv4Addr::new(8, 8, 8, 8)).is_none());
    }

    #[test]
    fn remove_all_for_purges_interface_routes() {
        let table = table_with_default();
        table.add(
            Ipv4Addr::new(192, 168, 1, 0),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(255, 255, 255, 0),
            RouteFlags::UP,
            0,
            1,
        );

        assert_eq!(table.remove_all_for(0), 2);
        assert_eq!(table.len(), 1);
        assert!(table.lookup_by_interface(0).is_none());
        assert!(table.lookup_by_interface(1).is_some());
    }
}
