//! UDP — stateless datagram demultiplexing.
//!
//! Parses and validates UDP headers (length cross-check against the IP
//! payload, optional-but-checked checksum), demultiplexes by destination
//! port into bounded per-binding inboxes, and builds outbound datagrams
//! with the pseudo-header checksum filled in.
//!
//! A datagram for an unbound port triggers ICMP port-unreachable — unless
//! it was addressed to a broadcast destination, which routinely has no
//! listener and must not generate error storms.
//!
//! # References
//! - RFC 768: User Datagram Protocol

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::buffer::{HeadroomClass, Packet};
use crate::icmp::{self, IcmpErrorKind};
use crate::ipv4::{self, transport_checksum, Ipv4Addr, Ipv4Header};
use crate::netif::NetIf;
use crate::stack::{DropReason, NetStack, RxVerdict};
use crate::NetError;

/// UDP header length in bytes.
pub const UDP_HEADER_LEN: usize = 8;

/// UDP protocol number.
pub const UDP_PROTO: u8 = 17;

/// Capacity of one binding's inbox; delivery fails closed beyond it.
pub const INBOX_CAPACITY: usize = 64;

// ============================================================================
// Header
// ============================================================================

/// Parsed UDP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header + payload length.
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from UDP parsing and binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpError {
    /// Datagram shorter than the UDP header.
    Truncated,
    /// Length field disagrees with the IP payload.
    BadLength,
    /// Nonzero checksum failed verification.
    ChecksumInvalid,
    /// Port already bound.
    PortInUse,
}

// ============================================================================
// Statistics
// ============================================================================

/// UDP statistics.
#[derive(Debug, Default)]
pub struct UdpStats {
    pub rx_datagrams: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub tx_datagrams: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_errors: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub no_listener: AtomicU64,
}

impl UdpStats {
    pub const fn new() -> Self {
        UdpStats {
            rx_datagrams: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            tx_datagrams: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            no_listener: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Parsing and Building
// ============================================================================

/// Parse a UDP header without validating against addresses.
pub fn parse_udp_header(buf: &[u8]) -> Result<UdpHeader, UdpError> {
    if buf.len() < UDP_HEADER_LEN {
        return Err(UdpError::Truncated);
    }
    Ok(UdpHeader {
        src_port: u16::from_be_bytes([buf[0], buf[1]]),
        dst_port: u16::from_be_bytes([buf[2], buf[3]]),
        length: u16::from_be_bytes([buf[4], buf[5]]),
        checksum: u16::from_be_bytes([buf[6], buf[7]]),
    })
}

/// Parse and validate a UDP datagram from an IP payload.
///
/// A zero checksum means the sender did not compute one (legal for IPv4);
/// a nonzero checksum is verified against the pseudo-header.
pub fn parse_udp<'a>(
    payload: &'a [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
) -> Result<(UdpHeader, &'a [u8]), UdpError> {
    let header = parse_udp_header(payload)?;

    let length = header.length as usize;
    if length < UDP_HEADER_LEN || length > payload.len() {
        return Err(UdpError::BadLength);
    }

    if header.checksum != 0 && transport_checksum(src, dst, UDP_PROTO, &payload[..length]) != 0 {
        return Err(UdpError::ChecksumInvalid);
    }

    Ok((header, &payload[UDP_HEADER_LEN..length]))
}

/// Build a complete UDP datagram with the pseudo-header checksum computed.
/// A computed checksum of zero is transmitted as 0xFFFF per RFC 768.
pub fn build_udp_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let length = (UDP_HEADER_LEN + payload.len()) as u16;
    let header = UdpHeader {
        src_port,
        dst_port,
        length,
        checksum: 0,
    };

    let mut datagram = Vec::with_capacity(length as usize);
    datagram.extend_from_slice(&header.to_bytes());
    datagram.extend_from_slice(payload);

    let mut csum = transport_checksum(src, dst, UDP_PROTO, &datagram);
    if csum == 0 {
        csum = 0xffff;
    }
    datagram[6..8].copy_from_slice(&csum.to_be_bytes());
    datagram
}

// ============================================================================
// Port Bindings
// ============================================================================

/// One datagram queued for the socket layer.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub data: Vec<u8>,
}

/// A listening port with its bounded inbox.
pub struct UdpBinding {
    port: u16,
    inbox: Mutex<VecDeque<UdpDatagram>>,
    dropped: AtomicU64,
    /// Most recent ICMP error reported against this binding, consumed by
    /// the socket layer.
    last_error: Mutex<Option<IcmpErrorKind>>,
}

impl UdpBinding {
    fn new(port: u16) -> Self {
        UdpBinding {
            port,
            inbox: Mutex::new(VecDeque::new()),
            dropped: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Pop the next queued datagram.
    pub fn recv(&self) -> Option<UdpDatagram> {
        self.inbox.lock().pop_front()
    }

    /// Number of queued datagrams.
    pub fn pending(&self) -> usize {
        self.inbox.lock().len()
    }

    /// Datagrams dropped because the inbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Take the pending error notification, if one arrived.
    pub fn take_error(&self) -> Option<IcmpErrorKind> {
        self.last_error.lock().take()
    }

    fn deliver(&self, datagram: UdpDatagram) -> bool {
        let mut inbox = self.inbox.lock();
        if inbox.len() >= INBOX_CAPACITY {
            drop(inbox);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        inbox.push_back(datagram);
        true
    }
}

/// The UDP port-to-binding table.
pub struct UdpPortTable {
    bindings: Mutex<BTreeMap<u16, Arc<UdpBinding>>>,
}

impl UdpPortTable {
    pub const fn new() -> Self {
        UdpPortTable {
            bindings: Mutex::new(BTreeMap::new()),
        }
    }

    /// Bind a listening port.
    pub fn bind(&self, port: u16) -> Result<Arc<UdpBinding>, UdpError> {
        let mut bindings = self.bindings.lock();
        if bindings.contains_key(&port) {
            return Err(UdpError::PortInUse);
        }
        let binding = Arc::new(UdpBinding::new(port));
        bindings.insert(port, binding.clone());
        Ok(binding)
    }

    /// Release a port.
    pub fn unbind(&self, port: u16) {
        self.bindings.lock().remove(&port);
    }

    pub fn lookup(&self, port: u16) -> Option<Arc<UdpBinding>> {
        self.bindings.lock().get(&port).cloned()
    }
}

impl Default for UdpPortTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Receive path
// ============================================================================

/// Process an inbound UDP datagram.
pub fn receive(
    stack: &NetStack,
    _iface: &Arc<NetIf>,
    ip_hdr: &Ipv4Header,
    payload: &[u8],
    is_broadcast_dst: bool,
    now: u64,
) -> RxVerdict {
    stack.udp_stats.rx_datagrams.fetch_add(1, Ordering::Relaxed);

    let (header, data) = match parse_udp(payload, ip_hdr.src, ip_hdr.dst) {
        Ok(parsed) => parsed,
        Err(e) => {
            match e {
                UdpError::ChecksumInvalid => {
                    stack.udp_stats.checksum_errors.fetch_add(1, Ordering::Relaxed)
                }
                _ => stack.udp_stats.rx_errors.fetch_add(1, Ordering::Relaxed),
            };
            return RxVerdict::Dropped(DropReason::Udp(e));
        }
    };

    if let Some(binding) = stack.udp_ports.lookup(header.dst_port) {
        stack
            .udp_stats
            .rx_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        let delivered = binding.deliver(UdpDatagram {
            src: ip_hdr.src,
            src_port: header.src_port,
            data: data.to_vec(),
        });
        if delivered {
            RxVerdict::Delivered
        } else {
            RxVerdict::Dropped(DropReason::InboxFull)
        }
    } else {
        stack.udp_stats.no_listener.fetch_add(1, Ordering::Relaxed);
        // Broadcast traffic routinely has no listener; only unicast earns
        // a notification.
        if !is_broadcast_dst {
            icmp::port_unreachable(stack, ip_hdr, payload, now);
        }
        RxVerdict::Dropped(DropReason::NoListener)
    }
}

/// ICMP error concerning a datagram we sent: surface it on the binding
/// that owns the original source port.
pub fn error(stack: &NetStack, kind: IcmpErrorKind, _orig_hdr: &Ipv4Header, orig_l4: &[u8], _now: u64) {
    if orig_l4.len() < 2 {
        return;
    }
    let src_port = u16::from_be_bytes([orig_l4[0], orig_l4[1]]);
    if let Some(binding) = stack.udp_ports.lookup(src_port) {
        *binding.last_error.lock() = Some(kind);
    }
}

// ============================================================================
// Send path
// ============================================================================

/// Build and transmit a datagram from the socket layer.
///
/// Fills source/destination ports, sets the length, computes the
/// pseudo-header checksum, and hands the result to the IP layer.
pub fn send(
    stack: &NetStack,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
    now: u64,
) -> Result<(), NetError> {
    let src = stack.source_for(dst).ok_or(NetError::NetworkUnreachable)?;
    let datagram = build_udp_datagram(src, dst, src_port, dst_port, payload);

    let mut pkt = Packet::alloc(datagram.len(), HeadroomClass::Transport);
    pkt.append(&datagram).map_err(|_| NetError::NoBufferSpace)?;

    ipv4::send(stack, dst, UDP_PROTO, pkt, now)?;
    stack.udp_stats.tx_datagrams.fetch_add(1, Ordering::Relaxed);
    stack
        .udp_stats
        .tx_bytes
        .fetch_add(payload.len() as u64, Ordering::Relaxed);
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const DST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn build_and_parse_round_trip() {
        let datagram = build_udp_datagram(SRC, DST, 5000, 53, b"query");
        let (header, data) = parse_udp(&datagram, SRC, DST).unwrap();

        assert_eq!(header.src_port, 5000);
        assert_eq!(header.dst_port, 53);
        assert_eq!(header.length as usize, UDP_HEADER_LEN + 5);
        assert_ne!(header.checksum, 0);
        assert_eq!(data, b"query");
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut datagram = build_udp_datagram(SRC, DST, 1, 2, b"data");
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;
        assert_eq!(parse_udp(&datagram, SRC, DST), Err(UdpError::ChecksumInvalid));
    }

    #[test]
    fn zero_checksum_is_accepted() {
        let mut datagram = build_udp_datagram(SRC, DST, 1, 2, b"data");
        datagram[6] = 0;
        datagram[7] = 0;
        assert!(parse_udp(&datagram, SRC, DST).is_ok());
    }

    #[test]
    fn length_field_is_cross_checked() {
        let mut datagram = build_udp_datagram(SRC, DST, 1, 2, b"data");
        // Claim more bytes than the IP payload carries.
        let bogus = (datagram.len() + 8) as u16;
        datagram[4..6].copy_from_slice(&bogus.to_be_bytes());
        assert_eq!(parse_udp(&datagram, SRC, DST), Err(UdpError::BadLength));
    }

    #[test]
    fn port_table_binds_uniquely() {
        let table = UdpPortTable::new();
        let binding = table.bind(4242).unwrap();
        assert_eq!(binding.port(), 4242);
        assert!(matches!(table.bind(4242), Err(UdpError::PortInUse)));

        table.unbind(4242);
        assert!(table.bind(4242).is_ok());
    }

    #[test]
    fn inbox_is_bounded() {
        let binding = UdpBinding::new(9);
        for i in 0..INBOX_CAPACITY {
            assert!(binding.deliver(UdpDatagram {
                src: SRC,
                src_port: 1000,
                data: alloc::vec![i as u8],
            }));
        }
        assert!(!binding.deliver(UdpDatagram {
            src: SRC,
            src_port: 1000,
            data: alloc::vec![0xff],
        }));
        assert_eq!(binding.dropped(), 1);
        assert_eq!(binding.pending(), INBOX_CAPACITY);
    }
}
