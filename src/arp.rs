//! ARP — link-layer address resolution.
//!
//! Parses and builds ARP packets for Ethernet/IPv4, maintains the bounded
//! resolution cache, and answers requests for our own addresses. Static
//! cache entries (the gateway, typically) never expire and are never
//! overwritten by traffic.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::Packet;
use crate::ethernet::{build_ethernet_frame, transmit_frame, EthAddr, EthHeader, ETHERTYPE_ARP};
use crate::ipv4::Ipv4Addr;
use crate::netif::NetIf;
use crate::stack::{DropReason, NetStack, RxVerdict};

/// Hardware type: Ethernet.
const HTYPE_ETHERNET: u16 = 1;
/// Protocol type: IPv4.
const PTYPE_IPV4: u16 = 0x0800;
/// Hardware address length for Ethernet.
const HLEN_ETHERNET: u8 = 6;
/// Protocol address length for IPv4.
const PLEN_IPV4: u8 = 4;

/// ARP operation: Request.
pub const OPCODE_REQUEST: u16 = 1;
/// ARP operation: Reply.
pub const OPCODE_REPLY: u16 = 2;

/// ARP packet size for Ethernet/IPv4.
pub const ARP_PACKET_LEN: usize = 28;

/// Dynamic cache entry lifetime in ticks (5 minutes).
pub const CACHE_TTL_TICKS: u64 = 5 * 60 * crate::TICKS_PER_SEC;

/// Maximum ARP cache entries.
pub const CACHE_MAX_ENTRIES: usize = 256;

// ============================================================================
// ARP Operation Code
// ============================================================================

/// ARP operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    /// who-has
    Request,
    /// is-at
    Reply,
}

impl ArpOp {
    pub fn from_raw(op: u16) -> Option<Self> {
        match op {
            OPCODE_REQUEST => Some(ArpOp::Request),
            OPCODE_REPLY => Some(ArpOp::Reply),
            _ => None,
        }
    }

    pub fn to_raw(self) -> u16 {
        match self {
            ArpOp::Request => OPCODE_REQUEST,
            ArpOp::Reply => OPCODE_REPLY,
        }
    }
}

// ============================================================================
// ARP Packet
// ============================================================================

/// Parsed ARP packet for Ethernet/IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub sender_hw: EthAddr,
    pub sender_ip: Ipv4Addr,
    pub target_hw: EthAddr,
    pub target_ip: Ipv4Addr,
    pub op: ArpOp,
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from ARP parsing and cache maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpError {
    /// Packet is too short.
    Truncated,
    /// Hardware type is not Ethernet.
    InvalidHardwareType,
    /// Protocol type is not IPv4.
    InvalidProtocolType,
    /// Address length fields are wrong for Ethernet/IPv4.
    InvalidAddressLength,
    /// Unknown operation code.
    InvalidOpcode,
    /// Sender address is broadcast, multicast, zero, or unspecified.
    InvalidSender,
    /// Update would overwrite a static entry.
    StaticConflict,
    /// Cache is full of unexpired entries.
    CacheFull,
}

// ============================================================================
// Statistics
// ============================================================================

/// ARP statistics.
#[derive(Debug, Default)]
pub struct ArpStats {
    pub rx_packets: AtomicU64,
    pub rx_requests: AtomicU64,
    pub rx_replies: AtomicU64,
    pub tx_replies: AtomicU64,
    pub tx_requests: AtomicU64,
    pub rx_errors: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

impl ArpStats {
    pub const fn new() -> Self {
        ArpStats {
            rx_packets: AtomicU64::new(0),
            rx_requests: AtomicU64::new(0),
            rx_replies: AtomicU64::new(0),
            tx_replies: AtomicU64::new(0),
            tx_requests: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// ARP Cache
// ============================================================================

/// Type of cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpEntryKind {
    /// Statically configured: never expires, never overwritten.
    Static,
    /// Learned from traffic, expires after [`CACHE_TTL_TICKS`].
    Dynamic,
}

/// One resolution cache entry.
#[derive(Debug, Clone, Copy)]
pub struct ArpEntry {
    pub mac: EthAddr,
    pub kind: ArpEntryKind,
    pub updated_at: u64,
}

/// Bounded IP-to-MAC resolution cache.
pub struct ArpCache {
    entries: BTreeMap<Ipv4Addr, ArpEntry>,
    ttl: u64,
    max_entries: usize,
}

impl ArpCache {
    pub fn new(ttl: u64, max_entries: usize) -> Self {
        ArpCache {
            entries: BTreeMap::new(),
            ttl,
            max_entries,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CACHE_TTL_TICKS, CACHE_MAX_ENTRIES)
    }

    /// Look up an unexpired entry.
    pub fn lookup(&self, ip: Ipv4Addr, now: u64) -> Option<EthAddr> {
        let entry = self.entries.get(&ip)?;
        match entry.kind {
            ArpEntryKind::Static => Some(entry.mac),
            ArpEntryKind::Dynamic => {
                if now.saturating_sub(entry.updated_at) < self.ttl {
                    Some(entry.mac)
                } else {
                    None
                }
            }
        }
    }

    /// Insert or refresh an entry. Static entries are never overwritten by
    /// dynamic updates; a full cache evicts the oldest dynamic entry.
    pub fn insert(
        &mut self,
        ip: Ipv4Addr,
        mac: EthAddr,
        kind: ArpEntryKind,
        now: u64,
    ) -> Result<(), ArpError> {
        if let Some(existing) = self.entries.get_mut(&ip) {
            if existing.kind == ArpEntryKind::Static && kind == ArpEntryKind::Dynamic {
                return Err(ArpError::StaticConflict);
            }
            existing.mac = mac;
            existing.kind = kind;
            existing.updated_at = now;
            return Ok(());
        }

        if self.entries.len() >= self.max_entries {
            let oldest = self
                .entries
                .iter()
                .filter(|(_, e)| e.kind == ArpEntryKind::Dynamic)
                .min_by_key(|(_, e)| e.updated_at)
                .map(|(ip, _)| *ip);
            match oldest {
                Some(victim) => {
                    self.entries.remove(&victim);
                }
                // Only static entries remain; refuse the insertion rather
                // than letting traffic evict configuration.
                None => return Err(ArpError::CacheFull),
            }
        }

        self.entries.insert(ip, ArpEntry { mac, kind, updated_at: now });
        Ok(())
    }

    /// Add a static entry that never expires.
    pub fn add_static(&mut self, ip: Ipv4Addr, mac: EthAddr, now: u64) -> Result<(), ArpError> {
        self.insert(ip, mac, ArpEntryKind::Static, now)
    }

    /// Drop expired dynamic entries.
    pub fn purge_expired(&mut self, now: u64) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| {
            e.kind == ArpEntryKind::Static || now.saturating_sub(e.updated_at) < ttl
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Parsing and Serialization
// ============================================================================

/// Parse and validate an ARP packet.
pub fn parse_arp(buf: &[u8]) -> Result<ArpPacket, ArpError> {
    if buf.len() < ARP_PACKET_LEN {
        return Err(ArpError::Truncated);
    }

    let htype = u16::from_be_bytes([buf[0], buf[1]]);
    if htype != HTYPE_ETHERNET {
        return Err(ArpError::InvalidHardwareType);
    }

    let ptype = u16::from_be_bytes([buf[2], buf[3]]);
    if ptype != PTYPE_IPV4 {
        return Err(ArpError::InvalidProtocolType);
    }

    if buf[4] != HLEN_ETHERNET || buf[5] != PLEN_IPV4 {
        return Err(ArpError::InvalidAddressLength);
    }

    let opcode = u16::from_be_bytes([buf[6], buf[7]]);
    let op = ArpOp::from_raw(opcode).ok_or(ArpError::InvalidOpcode)?;

    let mut sender_hw = [0u8; 6];
    sender_hw.copy_from_slice(&buf[8..14]);
    let sender_hw = EthAddr(sender_hw);
    let sender_ip = Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]);

    let mut target_hw = [0u8; 6];
    target_hw.copy_from_slice(&buf[18..24]);
    let target_hw = EthAddr(target_hw);
    let target_ip = Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27]);

    // A broadcast, multicast, or zero sender MAC is never legitimate.
    if sender_hw.is_broadcast() || sender_hw.is_multicast() || sender_hw == EthAddr::ZERO {
        return Err(ArpError::InvalidSender);
    }
    if sender_ip.is_unspecified() {
        return Err(ArpError::InvalidSender);
    }

    Ok(ArpPacket {
        sender_hw,
        sender_ip,
        target_hw,
        target_ip,
        op,
    })
}

/// Serialize an ARP packet (28 bytes, Ethernet payload).
pub fn serialize_arp(pkt: &ArpPacket) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ARP_PACKET_LEN);
    buf.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
    buf.extend_from_slice(&PTYPE_IPV4.to_be_bytes());
    buf.push(HLEN_ETHERNET);
    buf.push(PLEN_IPV4);
    buf.extend_from_slice(&pkt.op.to_raw().to_be_bytes());
    buf.extend_from_slice(&pkt.sender_hw.0);
    buf.extend_from_slice(&pkt.sender_ip.octets());
    buf.extend_from_slice(&pkt.target_hw.0);
    buf.extend_from_slice(&pkt.target_ip.octets());
    buf
}

/// Build a complete ARP reply frame.
pub fn build_arp_reply(
    our_mac: EthAddr,
    our_ip: Ipv4Addr,
    target_mac: EthAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let payload = serialize_arp(&ArpPacket {
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: target_mac,
        target_ip,
        op: ArpOp::Reply,
    });
    build_ethernet_frame(target_mac, our_mac, ETHERTYPE_ARP, &payload)
}

/// Build a complete broadcast ARP request frame.
pub fn build_arp_request(our_mac: EthAddr, our_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let payload = serialize_arp(&ArpPacket {
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: EthAddr::ZERO,
        target_ip,
        op: ArpOp::Request,
    });
    build_ethernet_frame(EthAddr::BROADCAST, our_mac, ETHERTYPE_ARP, &payload)
}

/// Build a gratuitous ARP announcement (sender IP == target IP).
pub fn build_gratuitous_arp(our_mac: EthAddr, our_ip: Ipv4Addr) -> Vec<u8> {
    let payload = serialize_arp(&ArpPacket {
        sender_hw: our_mac,
        sender_ip: our_ip,
        target_hw: EthAddr::ZERO,
        target_ip: our_ip,
        op: ArpOp::Request,
    });
    build_ethernet_frame(EthAddr::BROADCAST, our_mac, ETHERTYPE_ARP, &payload)
}

// ============================================================================
// Receive path
// ============================================================================

/// Process an incoming ARP packet: learn the sender mapping and answer
/// requests addressed to this interface's IPv4 address.
pub fn input(
    stack: &NetStack,
    iface: &Arc<NetIf>,
    _eth_hdr: &EthHeader,
    pkt: Packet,
    now: u64,
) -> RxVerdict {
    stack.arp_stats.rx_packets.fetch_add(1, Ordering::Relaxed);

    let arp = match parse_arp(pkt.data()) {
        Ok(arp) => arp,
        Err(e) => {
            stack.arp_stats.rx_errors.fetch_add(1, Ordering::Relaxed);
            return RxVerdict::Dropped(DropReason::Arp(e));
        }
    };

    let our_ip = iface.ipv4_addr();
    let addressed_to_us = our_ip == Some(arp.target_ip);

    // Learn the sender mapping when the packet involves us; refreshing on
    // replies keeps entries warm without caching every broadcast.
    if addressed_to_us || arp.op == ArpOp::Reply {
        let _ = stack
            .arp
            .lock()
            .insert(arp.sender_ip, arp.sender_hw, ArpEntryKind::Dynamic, now);
    }

    match arp.op {
        ArpOp::Request if addressed_to_us => {
            stack.arp_stats.rx_requests.fetch_add(1, Ordering::Relaxed);
            let our_ip = our_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
            let reply =
                build_arp_reply(EthAddr(iface.hw_addr()), our_ip, arp.sender_hw, arp.sender_ip);
            if transmit_frame(iface, &reply).is_ok() {
                stack.arp_stats.tx_replies.fetch_add(1, Ordering::Relaxed);
            }
            RxVerdict::Delivered
        }
        ArpOp::Request => RxVerdict::Delivered,
        ArpOp::Reply => {
            stack.arp_stats.rx_replies.fetch_add(1, Ordering::Relaxed);
            RxVerdict::Delivered
        }
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Resolve the hardware address of an on-link next hop.
///
/// On a cache miss an ARP request is broadcast and `None` is returned; the
/// caller drops the packet (there is no per-destination pending queue).
pub fn resolve(
    stack: &NetStack,
    iface: &Arc<NetIf>,
    next_hop: Ipv4Addr,
    now: u64,
) -> Option<EthAddr> {
    if let Some(mac) = stack.arp.lock().lookup(next_hop, now) {
        stack.arp_stats.cache_hits.fetch_add(1, Ordering::Relaxed);
        return Some(mac);
    }
    stack.arp_stats.cache_misses.fetch_add(1, Ordering::Relaxed);

    if let Some(our_ip) = iface.ipv4_addr() {
        let request = build_arp_request(EthAddr(iface.hw_addr()), our_ip, next_hop);
        if transmit_frame(iface, &request).is_ok() {
            stack.arp_stats.tx_requests.fetch_add(1, Ordering::Relaxed);
        }
    }
    None
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: EthAddr = EthAddr([0x02, 0, 0, 0, 0, 0xaa]);
    const MAC_B: EthAddr = EthAddr([0x02, 0, 0, 0, 0, 0xbb]);

    #[test]
    fn parse_round_trips_serialize() {
        let pkt = ArpPacket {
            sender_hw: MAC_A,
            sender_ip: Ipv4Addr::new(10, 0, 0, 1),
            target_hw: EthAddr::ZERO,
            target_ip: Ipv4Addr::new(10, 0, 0, 2),
            op: ArpOp::Request,
        };
        let bytes = serialize_arp(&pkt);
        assert_eq!(bytes.len(), ARP_PACKET_LEN);

        let parsed = parse_arp(&bytes).unwrap();
        assert_eq!(parsed.sender_hw, MAC_A);
        assert_eq!(parsed.sender_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.target_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(parsed.op, ArpOp::Request);
    }

    #[test]
    fn parse_rejects_bad_sender() {
        let mut pkt = serialize_arp(&ArpPacket {
            sender_hw: MAC_A,
            sender_ip: Ipv4Addr::new(10, 0, 0, 1),
            target_hw: EthAddr::ZERO,
            target_ip: Ipv4Addr::new(10, 0, 0, 2),
            op: ArpOp::Request,
        });
        // Overwrite the sender MAC with broadcast.
        pkt[8..14].copy_from_slice(&[0xff; 6]);
        assert_eq!(parse_arp(&pkt), Err(ArpError::InvalidSender));
    }

    #[test]
    fn cache_expires_dynamic_entries() {
        let mut cache = ArpCache::new(100, 8);
        cache
            .insert(Ipv4Addr::new(10, 0, 0, 1), MAC_A, ArpEntryKind::Dynamic, 0)
            .unwrap();

        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 1), 50), Some(MAC_A));
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 1), 100), None);

        cache.purge_expired(100);
        assert!(cache.is_empty());
    }

    #[test]
    fn static_entries_survive_conflicts_and_expiry() {
        let mut cache = ArpCache::new(100, 8);
        cache.add_static(Ipv4Addr::new(10, 0, 0, 1), MAC_A, 0).unwrap();

        assert_eq!(
            cache.insert(Ipv4Addr::new(10, 0, 0, 1), MAC_B, ArpEntryKind::Dynamic, 10),
            Err(ArpError::StaticConflict)
        );
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 1), 10_000), Some(MAC_A));

        cache.purge_expired(10_000);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_cache_evicts_oldest_dynamic() {
        let mut cache = ArpCache::new(1_000, 2);
        cache
            .insert(Ipv4Addr::new(10, 0, 0, 1), MAC_A, ArpEntryKind::Dynamic, 0)
            .unwrap();
        cache
            .insert(Ipv4Addr::new(10, 0, 0, 2), MAC_A, ArpEntryKind::Dynamic, 5)
            .unwrap();
        cache
            .insert(Ipv4Addr::new(10, 0, 0, 3), MAC_B, ArpEntryKind::Dynamic, 10)
            .unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(Ipv4Addr::new(10, 0, 0, 1), 10).is_none());
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 3), 10), Some(MAC_B));
    }
}
