//! Protocol and domain dispatch tables.
//!
//! Static per-domain tables map `(protocol number, socket type)` to a
//! protocol descriptor whose operations vtable is a [`ProtoOps`] trait
//! object — one implementation per protocol. The tables are populated once
//! at `network_init` and read-only afterwards.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::icmp::IcmpErrorKind;
use crate::ipv4::Ipv4Header;
use crate::netif::NetIf;
use crate::stack::{NetStack, RxVerdict};

// ============================================================================
// Families and Socket Types
// ============================================================================

/// Address family / protocol domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    /// IPv4 internet domain.
    Inet,
}

impl Domain {
    pub fn from_raw(family: u32) -> Option<Self> {
        match family {
            2 => Some(Domain::Inet),
            _ => None,
        }
    }
}

/// Socket type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    /// Reliable byte stream (TCP).
    Stream,
    /// Datagrams (UDP).
    Datagram,
    /// Raw network-layer access.
    Raw,
}

impl SockType {
    pub fn from_raw(ty: u32) -> Option<Self> {
        match ty {
            1 => Some(SockType::Stream),
            2 => Some(SockType::Datagram),
            3 => Some(SockType::Raw),
            _ => None,
        }
    }
}

// ============================================================================
// ProtoOps
// ============================================================================

/// Operations vtable for one protocol.
///
/// `receive` is the inbound demultiplex entry the IPv4 layer dispatches
/// into; `error` is the ICMP error-notification channel, invoked with the
/// header of the datagram the error quotes.
pub trait ProtoOps: Send + Sync {
    fn name(&self) -> &'static str;

    fn receive(
        &self,
        stack: &NetStack,
        iface: &Arc<NetIf>,
        ip_hdr: &Ipv4Header,
        payload: &[u8],
        is_broadcast_dst: bool,
        now: u64,
    ) -> RxVerdict;

    /// Inbound ICMP error concerning a datagram this protocol sent.
    fn error(
        &self,
        _stack: &NetStack,
        _kind: IcmpErrorKind,
        _orig_hdr: &Ipv4Header,
        _orig_l4: &[u8],
        _now: u64,
    ) {
    }
}

// ============================================================================
// Protocol Implementations
// ============================================================================

struct IcmpOps;
struct UdpOps;
struct TcpOps;
struct RawOps;

/// Datagrams accepted by the raw catch-all (nothing consumes them yet
/// beyond the counter; the socket layer's raw delivery sits above us).
static RAW_RX: AtomicU64 = AtomicU64::new(0);

impl ProtoOps for IcmpOps {
    fn name(&self) -> &'static str {
        "icmp"
    }

    fn receive(
        &self,
        stack: &NetStack,
        iface: &Arc<NetIf>,
        ip_hdr: &Ipv4Header,
        payload: &[u8],
        is_broadcast_dst: bool,
        now: u64,
    ) -> RxVerdict {
        crate::icmp::receive(stack, iface, ip_hdr, payload, is_broadcast_dst, now)
    }
}

impl ProtoOps for UdpOps {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn receive(
        &self,
        stack: &NetStack,
        iface: &Arc<NetIf>,
        ip_hdr: &Ipv4Header,
        payload: &[u8],
        is_broadcast_dst: bool,
        now: u64,
    ) -> RxVerdict {
        crate::udp::receive(stack, iface, ip_hdr, payload, is_broadcast_dst, now)
    }

    fn error(
        &self,
        stack: &NetStack,
        kind: IcmpErrorKind,
        orig_hdr: &Ipv4Header,
        orig_l4: &[u8],
        now: u64,
    ) {
        crate::udp::error(stack, kind, orig_hdr, orig_l4, now);
    }
}

impl ProtoOps for TcpOps {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn receive(
        &self,
        stack: &NetStack,
        iface: &Arc<NetIf>,
        ip_hdr: &Ipv4Header,
        payload: &[u8],
        is_broadcast_dst: bool,
        now: u64,
    ) -> RxVerdict {
        crate::tcp_conn::receive(stack, iface, ip_hdr, payload, is_broadcast_dst, now)
    }

    fn error(
        &self,
        stack: &NetStack,
        kind: IcmpErrorKind,
        orig_hdr: &Ipv4Header,
        orig_l4: &[u8],
        now: u64,
    ) {
        crate::tcp_conn::error(stack, kind, orig_hdr, orig_l4, now);
    }
}

impl ProtoOps for RawOps {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn receive(
        &self,
        _stack: &NetStack,
        _iface: &Arc<NetIf>,
        _ip_hdr: &Ipv4Header,
        _payload: &[u8],
        _is_broadcast_dst: bool,
        _now: u64,
    ) -> RxVerdict {
        RAW_RX.fetch_add(1, Ordering::Relaxed);
        RxVerdict::Delivered
    }
}

static ICMP_OPS: IcmpOps = IcmpOps;
static UDP_OPS: UdpOps = UdpOps;
static TCP_OPS: TcpOps = TcpOps;
static RAW_OPS: RawOps = RawOps;

// ============================================================================
// Descriptors and Table
// ============================================================================

/// One `(socket type, protocol)` binding in a domain's table.
#[derive(Clone, Copy)]
pub struct ProtoDescriptor {
    pub domain: Domain,
    pub sock_type: SockType,
    /// IP protocol number; 0 marks the raw catch-all.
    pub protocol: u8,
    pub ops: &'static dyn ProtoOps,
}

impl core::fmt::Debug for ProtoDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProtoDescriptor")
            .field("domain", &self.domain)
            .field("sock_type", &self.sock_type)
            .field("protocol", &self.protocol)
            .field("ops", &self.ops.name())
            .finish()
    }
}

/// The per-domain dispatch tables. Built at boot, immutable afterwards.
pub struct ProtocolTable {
    inet: Vec<ProtoDescriptor>,
}

impl ProtocolTable {
    /// The boot-time internet domain table.
    pub fn inet_default() -> Self {
        ProtocolTable {
            inet: alloc::vec![
                ProtoDescriptor {
                    domain: Domain::Inet,
                    sock_type: SockType::Stream,
                    protocol: 6,
                    ops: &TCP_OPS,
                },
                ProtoDescriptor {
                    domain: Domain::Inet,
                    sock_type: SockType::Datagram,
                    protocol: 17,
                    ops: &UDP_OPS,
                },
                ProtoDescriptor {
                    domain: Domain::Inet,
                    sock_type: SockType::Raw,
                    protocol: 1,
                    ops: &ICMP_OPS,
                },
                // Catch-all raw binding: protocol 0 matches any raw request
                // without an exact entry.
                ProtoDescriptor {
                    domain: Domain::Inet,
                    sock_type: SockType::Raw,
                    protocol: 0,
                    ops: &RAW_OPS,
                },
            ],
        }
    }

    fn domain_table(&self, domain: Domain) -> &[ProtoDescriptor] {
        match domain {
            Domain::Inet => &self.inet,
        }
    }

    /// Exact `(protocol, socket type)` match; a raw request without an
    /// exact entry falls back to the protocol-zero raw catch-all.
    pub fn find_proto(
        &self,
        domain: Domain,
        protocol: u8,
        sock_type: SockType,
    ) -> Option<&ProtoDescriptor> {
        let table = self.domain_table(domain);
        if let Some(desc) = table
            .iter()
            .find(|d| d.protocol == protocol && d.sock_type == sock_type)
        {
            return Some(desc);
        }
        if sock_type == SockType::Raw {
            return table
                .iter()
                .find(|d| d.sock_type == SockType::Raw && d.protocol == 0);
        }
        None
    }

    /// First descriptor of the given socket type — default protocol
    /// selection for callers that do not name one.
    pub fn find_proto_by_type(&self, domain: Domain, sock_type: SockType) -> Option<&ProtoDescriptor> {
        self.domain_table(domain)
            .iter()
            .find(|d| d.sock_type == sock_type)
    }

    /// Inbound demultiplex: the operations of the protocol owning an IP
    /// protocol number.
    pub fn find_input(&self, protocol: u8) -> Option<&'static dyn ProtoOps> {
        self.inet
            .iter()
            .find(|d| d.protocol == protocol && d.protocol != 0)
            .map(|d| d.ops)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_lookup() {
        let table = ProtocolTable::inet_default();
        let tcp = table.find_proto(Domain::Inet, 6, SockType::Stream).unwrap();
        assert_eq!(tcp.ops.name(), "tcp");

        let udp = table.find_proto(Domain::Inet, 17, SockType::Datagram).unwrap();
        assert_eq!(udp.ops.name(), "udp");

        // Mismatched type does not cross-match.
        assert!(table.find_proto(Domain::Inet, 6, SockType::Datagram).is_none());
    }

    #[test]
    fn raw_catch_all_fallback() {
        let table = ProtocolTable::inet_default();
        // Exact raw entry wins.
        let icmp = table.find_proto(Domain::Inet, 1, SockType::Raw).unwrap();
        assert_eq!(icmp.ops.name(), "icmp");

        // Unknown raw protocol falls back to the protocol-zero entry.
        let any = table.find_proto(Domain::Inet, 89, SockType::Raw).unwrap();
        assert_eq!(any.protocol, 0);
        assert_eq!(any.ops.name(), "raw");
    }

    #[test]
    fn lookup_by_type_alone() {
        let table = ProtocolTable::inet_default();
        let stream = table.find_proto_by_type(Domain::Inet, SockType::Stream).unwrap();
        assert_eq!(stream.protocol, 6);
    }

    #[test]
    fn input_demux_skips_catch_all() {
        let table = ProtocolTable::inet_default();
        assert_eq!(table.find_input(17).unwrap().name(), "udp");
        assert_eq!(table.find_input(6).unwrap().name(), "tcp");
        assert!(table.find_input(0).is_none());
        assert!(table.find_input(89).is_none());
    }
}
