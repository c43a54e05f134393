//! Network interface abstraction and registry.
//!
//! A [`NetIf`] couples a link driver's transmit function with the state the
//! stack needs per interface: name, index, flags, MTU, hardware address, a
//! bounded outbound queue, and cumulative statistics. Interfaces are
//! created once at attach time (driver probe or pseudo-device registration)
//! and never destroyed while the stack runs; the index assigned at attach
//! is stable and monotonically increasing.
//!
//! The bounded queue is the stack's only backpressure mechanism: there is
//! no flow control between the device and the protocol layers, so
//! `enqueue` fails closed (drop + statistic) rather than blocking.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use alloc::collections::VecDeque;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use spin::{Mutex, RwLock};

use crate::buffer::Packet;
use crate::ipv4::Ipv4Addr;

/// Standard 6-byte link-layer hardware address.
pub type MacAddress = [u8; 6];

/// Maximum number of attached interfaces.
pub const MAX_INTERFACES: usize = 8;

/// Default capacity of a per-interface packet queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

bitflags! {
    /// Interface state and capability flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IfFlags: u32 {
        /// Interface is administratively up.
        const UP        = 1 << 0;
        /// Link is running (carrier present).
        const RUNNING   = 1 << 1;
        /// Interface supports link-layer broadcast.
        const BROADCAST = 1 << 2;
        /// Loopback pseudo-device.
        const LOOPBACK  = 1 << 3;
        /// Interface receives multicast frames.
        const MULTICAST = 1 << 4;
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from interface registration and control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetIfError {
    /// An interface with this name is already attached.
    AlreadyAttached,
    /// The interface table is full.
    TooManyInterfaces,
}

/// Errors from transmit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// The outbound queue is full (packet dropped, counted).
    QueueFull,
    /// The interface is down.
    LinkDown,
    /// No link-layer address could be resolved for the next hop.
    Unresolved,
    /// The packet cannot be transmitted as built.
    InvalidBuffer,
}

// ============================================================================
// Statistics
// ============================================================================

/// Cumulative per-interface statistics.
#[derive(Debug, Default)]
pub struct NetIfStats {
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub rx_errors: AtomicU64,
    pub rx_dropped: AtomicU64,
    /// Frames rejected for being shorter than the link header.
    pub rx_length_errors: AtomicU64,
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_errors: AtomicU64,
    pub tx_dropped: AtomicU64,
    pub multicast: AtomicU64,
}

impl NetIfStats {
    pub const fn new() -> Self {
        NetIfStats {
            rx_packets: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            rx_length_errors: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            tx_errors: AtomicU64::new(0),
            tx_dropped: AtomicU64::new(0),
            multicast: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_rx(&self, bytes: usize) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tx(&self, bytes: usize) {
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rx_errors(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rx_length_errors(&self) {
        self.rx_length_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tx_errors(&self) {
        self.tx_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_multicast(&self) {
        self.multicast.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// PacketQueue
// ============================================================================

/// A bounded FIFO packet queue guarded by a dedicated lock.
///
/// `enqueue` never blocks: when the queue is at capacity the packet is
/// dropped and the drop counter incremented.
#[derive(Debug)]
pub struct PacketQueue {
    inner: Mutex<VecDeque<Packet>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        PacketQueue {
            inner: Mutex::new(VecDeque::new()),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a packet. Returns `false` (packet dropped, counter bumped)
    /// when the queue is full.
    pub fn enqueue(&self, pkt: Packet) -> bool {
        let mut queue = self.inner.lock();
        if queue.len() >= self.capacity {
            drop(queue);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(pkt);
        true
    }

    /// Remove the packet at the head of the queue.
    pub fn dequeue(&self) -> Option<Packet> {
        self.inner.lock().pop_front()
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if no packets are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Packets dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Discard all queued packets (interface going down).
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

// ============================================================================
// LinkDriver
// ============================================================================

/// Per-device transmit function.
///
/// The driver consumes the packet on every path — success, queued for
/// later, and error — so buffer ownership stays single-threaded.
pub trait LinkDriver: Send + Sync {
    fn transmit(&self, iface: &NetIf, pkt: Packet) -> Result<(), TxError>;
}

// ============================================================================
// NetIf
// ============================================================================

/// A network interface: link driver plus the per-interface state the stack
/// manages on its behalf.
pub struct NetIf {
    name: String,
    index: usize,
    mtu: usize,
    hw_addr: MacAddress,
    flags: Mutex<IfFlags>,
    /// Configured IPv4 address and netmask, if any.
    addr: Mutex<Option<(Ipv4Addr, Ipv4Addr)>>,
    /// Bounded outbound queue drained by the driver or a poll task.
    pub queue: PacketQueue,
    pub stats: NetIfStats,
    driver: Box<dyn LinkDriver>,
}

impl NetIf {
    /// Build an interface ready for [`NetIfRegistry::attach`]. The index is
    /// assigned by the registry.
    pub fn new(
        name: String,
        mtu: usize,
        hw_addr: MacAddress,
        flags: IfFlags,
        driver: Box<dyn LinkDriver>,
    ) -> Self {
        NetIf {
            name,
            index: 0,
            mtu,
            hw_addr,
            flags: Mutex::new(flags),
            addr: Mutex::new(None),
            queue: PacketQueue::new(DEFAULT_QUEUE_CAPACITY),
            stats: NetIfStats::new(),
            driver,
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    #[inline]
    pub fn hw_addr(&self) -> MacAddress {
        self.hw_addr
    }

    pub fn flags(&self) -> IfFlags {
        *self.flags.lock()
    }

    pub fn is_up(&self) -> bool {
        self.flags().contains(IfFlags::UP)
    }

    pub fn is_loopback(&self) -> bool {
        self.flags().contains(IfFlags::LOOPBACK)
    }

    pub fn set_up(&self, up: bool) {
        let mut flags = self.flags.lock();
        if up {
            flags.insert(IfFlags::UP | IfFlags::RUNNING);
        } else {
            flags.remove(IfFlags::UP | IfFlags::RUNNING);
        }
    }

    /// Configured IPv4 address, if any.
    pub fn ipv4_addr(&self) -> Option<Ipv4Addr> {
        let addr = *self.addr.lock();
        addr.map(|(addr, _)| addr)
    }

    /// Configured IPv4 address and netmask, if any.
    pub fn ipv4_addr_mask(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        *self.addr.lock()
    }

    /// Assign the interface IPv4 address and netmask.
    pub fn set_ipv4_addr(&self, addr: Ipv4Addr, netmask: Ipv4Addr) {
        *self.addr.lock() = Some((addr, netmask));
    }

    /// Hand a packet to the link driver. The driver owns the packet from
    /// here on every outcome.
    pub fn transmit(&self, pkt: Packet) -> Result<(), TxError> {
        if !self.is_up() {
            self.stats.inc_tx_dropped();
            return Err(TxError::LinkDown);
        }
        let len = pkt.len();
        match self.driver.transmit(self, pkt) {
            Ok(()) => {
                self.stats.inc_tx(len);
                Ok(())
            }
            Err(e) => {
                self.stats.inc_tx_errors();
                Err(e)
            }
        }
    }
}

impl core::fmt::Debug for NetIf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetIf")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("mtu", &self.mtu)
            .field("flags", &self.flags())
            .finish()
    }
}

// ============================================================================
// NetIfRegistry
// ============================================================================

/// The global interface list.
pub struct NetIfRegistry {
    interfaces: RwLock<Vec<Arc<NetIf>>>,
    next_index: AtomicUsize,
}

impl NetIfRegistry {
    pub const fn new() -> Self {
        NetIfRegistry {
            interfaces: RwLock::new(Vec::new()),
            next_index: AtomicUsize::new(0),
        }
    }

    /// Attach an interface: refuse duplicates by name, assign the next
    /// index, link into the list.
    pub fn attach(&self, mut iface: NetIf) -> Result<Arc<NetIf>, NetIfError> {
        let mut interfaces = self.interfaces.write();

        if interfaces.len() >= MAX_INTERFACES {
            return Err(NetIfError::TooManyInterfaces);
        }
        if interfaces.iter().any(|i| i.name == iface.name) {
            return Err(NetIfError::AlreadyAttached);
        }

        iface.index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let iface = Arc::new(iface);
        interfaces.push(iface.clone());

        log::debug!("netif: attached {} (index {})", iface.name, iface.index);
        Ok(iface)
    }

    /// Look up an interface by index.
    pub fn get_by_index(&self, index: usize) -> Option<Arc<NetIf>> {
        self.interfaces
            .read()
            .iter()
            .find(|i| i.index == index)
            .cloned()
    }

    /// Look up an interface by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<NetIf>> {
        self.interfaces
            .read()
            .iter()
            .find(|i| i.name == name)
            .cloned()
    }

    /// Number of attached interfaces.
    pub fn count(&self) -> usize {
        self.interfaces.read().len()
    }

    /// Snapshot of all attached interfaces.
    pub fn list(&self) -> Vec<Arc<NetIf>> {
        self.interfaces.read().clone()
    }
}

impl Default for NetIfRegistry {
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
    use alloc::string::ToString;

    struct NullDriver;

    impl LinkDriver for NullDriver {
        fn transmit(&self, _iface: &NetIf, _pkt: Packet) -> Result<(), TxError> {
            Ok(())
        }
    }

    fn test_iface(name: &str) -> NetIf {
        NetIf::new(
            name.to_string(),
            1500,
            [0x02, 0, 0, 0, 0, 1],
            IfFlags::UP | IfFlags::RUNNING | IfFlags::BROADCAST,
            Box::new(NullDriver),
        )
    }

    #[test]
    fn attach_assigns_monotonic_indices() {
        let registry = NetIfRegistry::new();
        let a = registry.attach(test_iface("eth0")).unwrap();
        let b = registry.attach(test_iface("eth1")).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn attach_refuses_duplicate_name() {
        let registry = NetIfRegistry::new();
        registry.attach(test_iface("eth0")).unwrap();
        assert_eq!(
            registry.attach(test_iface("eth0")).unwrap_err(),
            NetIfError::AlreadyAttached
        );
    }

    #[test]
    fn lookup_by_index_and_name() {
        let registry = NetIfRegistry::new();
        registry.attach(test_iface("eth0")).unwrap();
        registry.attach(test_iface("lo")).unwrap();

        assert_eq!(registry.get_by_name("lo").unwrap().index(), 1);
        assert_eq!(registry.get_by_index(0).unwrap().name(), "eth0");
        assert!(registry.get_by_index(7).is_none());
        assert!(registry.get_by_name("wlan0").is_none());
    }

    #[test]
    fn queue_backpressure_drops_and_counts() {
        let queue = PacketQueue::new(2);
        assert!(queue.enqueue(Packet::from_slice(&[1])));
        assert!(queue.enqueue(Packet::from_slice(&[2])));
        // Full: the third enqueue fails closed without blocking.
        assert!(!queue.enqueue(Packet::from_slice(&[3])));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 2);

        // FIFO order and count consistency.
        assert_eq!(queue.dequeue().unwrap().data(), &[1]);
        assert_eq!(queue.dequeue().unwrap().data(), &[2]);
        assert!(queue.dequeue().is_none());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn transmit_on_down_interface_fails() {
        let iface = test_iface("eth0");
        iface.set_up(false);
        assert_eq!(
            iface.transmit(Packet::from_slice(&[0; 64])),
            Err(TxError::LinkDown)
        );
        assert_eq!(iface.stats.tx_dropped.load(Ordering::Relaxed), 1);
    }
}
