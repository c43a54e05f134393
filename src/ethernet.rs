//! Ethernet framing layer.
//!
//! Frames and unframes Ethernet II headers, classifies frames by
//! destination address and EtherType, and dispatches to the IPv4 and ARP
//! layers. Device drivers deliver raw frames through [`receive`]; outbound
//! packets descend through [`send`], which resolves the next-hop hardware
//! address and prepends the link header.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arp;
use crate::buffer::Packet;
use crate::ipv4::{self, Ipv4Addr};
use crate::netif::{IfFlags, LinkDriver, MacAddress, NetIf, NetIfError, TxError};
use crate::stack::{DropReason, NetStack, RxVerdict};
use crate::{NetError, ETH_HEADER_LEN};

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Unit numbers for `eth{n}` interface naming, assigned in attach order.
static ETH_UNIT: AtomicUsize = AtomicUsize::new(0);

// ============================================================================
// EthAddr
// ============================================================================

/// A 6-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EthAddr(pub MacAddress);

impl EthAddr {
    /// All-zero address (unset).
    pub const ZERO: EthAddr = EthAddr([0; 6]);

    /// Link-layer broadcast address.
    pub const BROADCAST: EthAddr = EthAddr([0xff; 6]);

    /// True for the all-ones broadcast address.
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    /// True for group (multicast) addresses, broadcast included.
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl From<MacAddress> for EthAddr {
    fn from(mac: MacAddress) -> Self {
        EthAddr(mac)
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from Ethernet frame parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EthError {
    /// Frame is shorter than the fixed link header.
    Truncated,
}

// ============================================================================
// EthHeader
// ============================================================================

/// Parsed Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: EthAddr,
    pub src: EthAddr,
    pub ethertype: u16,
}

/// Parse an Ethernet frame into its header and payload.
pub fn parse_ethernet(frame: &[u8]) -> Result<(EthHeader, &[u8]), EthError> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(EthError::Truncated);
    }

    let mut dst = [0u8; 6];
    let mut src = [0u8; 6];
    dst.copy_from_slice(&frame[0..6]);
    src.copy_from_slice(&frame[6..12]);
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);

    Ok((
        EthHeader {
            dst: EthAddr(dst),
            src: EthAddr(src),
            ethertype,
        },
        &frame[ETH_HEADER_LEN..],
    ))
}

/// Serialize a link header into `buf` (must be `ETH_HEADER_LEN` bytes).
pub fn write_ethernet_header(buf: &mut [u8], dst: EthAddr, src: EthAddr, ethertype: u16) {
    buf[0..6].copy_from_slice(&dst.0);
    buf[6..12].copy_from_slice(&src.0);
    buf[12..14].copy_from_slice(&ethertype.to_be_bytes());
}

/// Build a complete Ethernet frame around `payload`.
pub fn build_ethernet_frame(
    dst: EthAddr,
    src: EthAddr,
    ethertype: u16,
    payload: &[u8],
) -> alloc::vec::Vec<u8> {
    let mut frame = alloc::vec![0u8; ETH_HEADER_LEN + payload.len()];
    write_ethernet_header(&mut frame[..ETH_HEADER_LEN], dst, src, ethertype);
    frame[ETH_HEADER_LEN..].copy_from_slice(payload);
    frame
}

// ============================================================================
// Attach
// ============================================================================

/// Attach an Ethernet device, assigning the next `eth{n}` pseudo-name.
///
/// If this is the first interface and no route exists yet, the registered
/// address-configuration hook (the external DHCP client) is invoked —
/// attach order therefore decides which interface becomes the DHCP client.
pub fn attach(
    stack: &NetStack,
    driver: Box<dyn LinkDriver>,
    hw_addr: MacAddress,
    mtu: usize,
) -> Result<Arc<NetIf>, NetIfError> {
    let unit = ETH_UNIT.fetch_add(1, Ordering::SeqCst);
    let name = format!("eth{}", unit);

    let iface = NetIf::new(
        name,
        mtu,
        hw_addr,
        IfFlags::UP | IfFlags::RUNNING | IfFlags::BROADCAST | IfFlags::MULTICAST,
        driver,
    );
    let iface = stack.interfaces.attach(iface)?;

    if stack.routes.is_empty() {
        stack.request_address_config(iface.index());
    }

    Ok(iface)
}

// ============================================================================
// Receive path
// ============================================================================

/// Entry point for device drivers: hand a freshly received frame to the
/// stack, which takes responsibility for it from here.
///
/// Validates the minimum frame length, classifies broadcast/multicast by
/// destination address, and dispatches by EtherType. Unknown EtherTypes
/// are counted and dropped — not an error.
pub fn receive(stack: &NetStack, ifindex: usize, mut pkt: Packet, now: u64) -> RxVerdict {
    let iface = match stack.interfaces.get_by_index(ifindex) {
        Some(iface) => iface,
        None => return RxVerdict::Dropped(DropReason::NoSuchInterface),
    };
    iface.stats.inc_rx(pkt.len());
    pkt.set_ifindex(ifindex);

    if pkt.len() < ETH_HEADER_LEN {
        iface.stats.inc_rx_length_errors();
        return RxVerdict::Dropped(DropReason::ShortFrame);
    }

    let (hdr, _) = match parse_ethernet(pkt.data()) {
        Ok(parsed) => parsed,
        Err(_) => {
            iface.stats.inc_rx_errors();
            return RxVerdict::Dropped(DropReason::ShortFrame);
        }
    };

    if hdr.dst.is_broadcast() {
        pkt.broadcast = true;
    } else if hdr.dst.is_multicast() {
        iface.stats.inc_multicast();
    }

    // Strip the link header; the payload keeps its wire alignment.
    if pkt.pull_header(ETH_HEADER_LEN).is_err() {
        iface.stats.inc_rx_errors();
        return RxVerdict::Dropped(DropReason::ShortFrame);
    }

    match hdr.ethertype {
        ETHERTYPE_IPV4 => ipv4::receive(stack, &iface, &hdr, pkt, now),
        ETHERTYPE_ARP => arp::input(stack, &iface, &hdr, pkt, now),
        _ => {
            stack.stats.inc_unknown_ethertype();
            RxVerdict::Dropped(DropReason::UnknownEtherType)
        }
    }
}

// ============================================================================
// Send path
// ============================================================================

/// Prepend the link header and hand the packet to the interface driver.
///
/// `next_hop` is the on-link destination (the final destination or the
/// gateway, as chosen by the routing table); its hardware address comes
/// from the ARP cache. The transmit path owns the packet on every outcome.
pub fn send(
    stack: &NetStack,
    iface: &Arc<NetIf>,
    next_hop: Ipv4Addr,
    ethertype: u16,
    mut pkt: Packet,
    now: u64,
) -> Result<(), NetError> {
    let dst = if next_hop.is_broadcast() || pkt.broadcast {
        EthAddr::BROADCAST
    } else {
        match arp::resolve(stack, iface, next_hop, now) {
            Some(mac) => mac,
            None => {
                // Resolution is in flight; the packet is dropped rather
                // than queued (no per-destination pending queue).
                iface.stats.inc_tx_dropped();
                return Err(NetError::HostUnreachable);
            }
        }
    };

    let src = EthAddr(iface.hw_addr());
    let hdr = pkt.push_header(ETH_HEADER_LEN).map_err(|_| NetError::NoBufferSpace)?;
    write_ethernet_header(hdr, dst, src, ethertype);

    iface.transmit(pkt).map_err(|e| match e {
        TxError::QueueFull => NetError::QueueFull,
        TxError::LinkDown => NetError::InterfaceDown,
        _ => NetError::IoError,
    })
}

/// Transmit a pre-built frame (ARP replies and requests).
pub fn transmit_frame(iface: &Arc<NetIf>, frame: &[u8]) -> Result<(), NetError> {
    let pkt = Packet::from_slice(frame);
    iface.transmit(pkt).map_err(|e| match e {
        TxError::QueueFull => NetError::QueueFull,
        TxError::LinkDown => NetError::InterfaceDown,
        _ => NetError::IoError,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_header() {
        let mut frame = [0u8; 64];
        write_ethernet_header(
            &mut frame[..ETH_HEADER_LEN],
            EthAddr([1, 2, 3, 4, 5, 6]),
            EthAddr([7, 8, 9, 10, 11, 12]),
            ETHERTYPE_IPV4,
        );

        let (hdr, payload) = parse_ethernet(&frame).unwrap();
        assert_eq!(hdr.dst, EthAddr([1, 2, 3, 4, 5, 6]));
        assert_eq!(hdr.src, EthAddr([7, 8, 9, 10, 11, 12]));
        assert_eq!(hdr.ethertype, ETHERTYPE_IPV4);
        assert_eq!(payload.len(), 64 - ETH_HEADER_LEN);
    }

    #[test]
    fn short_frame_is_rejected() {
        assert_eq!(parse_ethernet(&[0u8; 13]), Err(EthError::Truncated));
    }

    #[test]
    fn address_classification() {
        assert!(EthAddr::BROADCAST.is_broadcast());
        assert!(EthAddr::BROADCAST.is_multicast());
        assert!(EthAddr([0x01, 0, 0x5e, 0, 0, 1]).is_multicast());
        assert!(!EthAddr([0x02, 0, 0, 0, 0, 1]).is_multicast());
        assert!(!EthAddr([0x02, 0, 0, 0, 0, 1]).is_broadcast());
    }

    struct SinkDriver;

    impl LinkDriver for SinkDriver {
        fn transmit(&self, _iface: &NetIf, _pkt: Packet) -> Result<(), crate::netif::TxError> {
            Ok(())
        }
    }

    static HOOK_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn config_hook(_ifindex: usize) {
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn first_attach_with_no_routes_requests_address_config() {
        let stack = NetStack::new();
        stack.set_addr_config_hook(config_hook);

        // First interface, empty route table: the external client is asked
        // to configure it.
        let a = attach(&stack, Box::new(SinkDriver), [2, 0, 0, 0, 0, 1], 1500).unwrap();
        assert!(a.name().starts_with("eth"));
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 1);

        // With a route present, later attaches stay silent.
        stack.routes.add(
            Ipv4Addr::new(10, 0, 0, 0),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(255, 255, 255, 0),
            crate::route::RouteFlags::UP,
            0,
            a.index(),
        );
        let b = attach(&stack, Box::new(SinkDriver), [2, 0, 0, 0, 0, 2], 1500).unwrap();
        assert!(b.name().starts_with("eth"));
        assert_ne!(a.name(), b.name());
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), 1);
    }
}
