//! Loopback pseudo-device.
//!
//! A synthetic interface whose transmit never touches hardware: outgoing
//! IPv4 packets land on the interface's own queue and a background poll
//! re-injects them through the normal receive path. ICMP echo requests
//! are answered during transmit — the reply is built fresh from the
//! parsed request (addresses swapped, type flipped, both checksums
//! recomputed), so a ping of the loopback address reflects without
//! round-tripping through the Ethernet layer.

use alloc::boxed::Box;
use alloc::string::ToString;
use alloc::sync::Arc;

use crate::buffer::{HeadroomClass, Packet};
use crate::ethernet::{EthAddr, EthHeader, ETHERTYPE_IPV4};
use crate::icmp::{self, ICMP_TYPE_ECHO_REQUEST};
use crate::ipv4::{self, write_ipv4_header, Ipv4Addr, Ipv4Proto};
use crate::netif::{IfFlags, LinkDriver, NetIf, NetIfError, TxError};
use crate::route::RouteFlags;
use crate::stack::NetStack;
use crate::IPV4_HEADER_MIN_LEN;

/// Loopback MTU; large because no physical framing constrains it.
pub const LOOPBACK_MTU: usize = 65535;

/// Packets re-injected per poll pass.
pub const POLL_BUDGET: usize = 32;

// ============================================================================
// Driver
// ============================================================================

/// The loopback link driver: transmit queues onto the interface's own
/// packet queue for later re-injection.
pub struct LoopbackDriver;

impl LinkDriver for LoopbackDriver {
    fn transmit(&self, iface: &NetIf, pkt: Packet) -> Result<(), TxError> {
        let pkt = match rewrite_echo_request(&pkt) {
            Some(reply) => reply,
            None => pkt,
        };
        if iface.queue.enqueue(pkt) {
            Ok(())
        } else {
            Err(TxError::QueueFull)
        }
    }
}

/// If the outgoing packet is an ICMP echo request, build the echo reply
/// it will be answered with.
///
/// The reply is constructed from the parsed fields rather than edited in
/// place, so both the ICMP and IP checksums are correct by construction.
fn rewrite_echo_request(pkt: &Packet) -> Option<Packet> {
    let (hdr, _options, payload) = ipv4::parse_ipv4(pkt.data()).ok()?;
    if hdr.proto() != Some(Ipv4Proto::Icmp) || payload.first() != Some(&ICMP_TYPE_ECHO_REQUEST) {
        return None;
    }

    let reply_icmp = icmp::build_echo_reply(payload).ok()?;

    let mut reply = Packet::alloc(IPV4_HEADER_MIN_LEN + reply_icmp.len(), HeadroomClass::Link);
    let buf = reply.extend(IPV4_HEADER_MIN_LEN + reply_icmp.len()).ok()?;
    // Source and destination swap; everything else is rebuilt.
    write_ipv4_header(
        buf,
        hdr.dst,
        hdr.src,
        Ipv4Proto::Icmp.to_raw(),
        reply_icmp.len() as u16,
        ipv4::DEFAULT_TTL,
        hdr.identification,
        0,
    );
    buf[IPV4_HEADER_MIN_LEN..].copy_from_slice(&reply_icmp);
    Some(reply)
}

// ============================================================================
// Attach and Poll
// ============================================================================

/// Register the loopback interface, its address, and its route.
///
/// Called once from `network_init`, before any Ethernet device, so
/// loopback conventionally takes index 0.
pub fn attach(stack: &NetStack) -> Result<Arc<NetIf>, NetIfError> {
    let iface = NetIf::new(
        "lo".to_string(),
        LOOPBACK_MTU,
        [0; 6],
        IfFlags::UP | IfFlags::RUNNING | IfFlags::LOOPBACK,
        Box::new(LoopbackDriver),
    );
    let iface = stack.interfaces.attach(iface)?;
    iface.set_ipv4_addr(Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0));

    stack.routes.add(
        Ipv4Addr::new(127, 0, 0, 0),
        Ipv4Addr::UNSPECIFIED,
        Ipv4Addr::new(255, 0, 0, 0),
        RouteFlags::UP | RouteFlags::LOOPBACK,
        0,
        iface.index(),
    );
    Ok(iface)
}

/// Drain the loopback queue, re-injecting each packet through the normal
/// IPv4 receive path. Returns the number of packets delivered; the
/// background loopback task calls this until it returns zero.
pub fn poll(stack: &NetStack, now: u64) -> usize {
    let Some(iface) = stack.interfaces.get_by_name("lo") else {
        return 0;
    };

    let eth_hdr = EthHeader {
        dst: EthAddr::ZERO,
        src: EthAddr::ZERO,
        ethertype: ETHERTYPE_IPV4,
    };

    let mut delivered = 0;
    while delivered < POLL_BUDGET {
        let Some(mut pkt) = iface.queue.dequeue() else { break };
        iface.stats.inc_rx(pkt.len());
        pkt.set_ifindex(iface.index());
        ipv4::receive(stack, &iface, &eth_hdr, pkt, now);
        delivered += 1;
    }
    delivered
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::icmp::build_echo_request;
    use crate::ipv4::compute_checksum;

    fn echo_request_packet(id: u16, seq: u16) -> Packet {
        let icmp = build_echo_request(id, seq, b"lo ping");
        let mut pkt = Packet::alloc(IPV4_HEADER_MIN_LEN + icmp.len(), HeadroomClass::Link);
        let buf = pkt.extend(IPV4_HEADER_MIN_LEN + icmp.len()).unwrap();
        write_ipv4_header(
            buf,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            Ipv4Proto::Icmp.to_raw(),
            icmp.len() as u16,
            64,
            0x42,
            0,
        );
        buf[IPV4_HEADER_MIN_LEN..].copy_from_slice(&icmp);
        pkt
    }

    #[test]
    fn echo_request_becomes_reply_with_valid_checksums() {
        let pkt = echo_request_packet(0x77, 3);
        let reply = rewrite_echo_request(&pkt).expect("echo request must be rewritten");

        let (hdr, _, payload) = ipv4::parse_ipv4(reply.data()).unwrap();
        assert_eq!(hdr.src, Ipv4Addr::LOCALHOST);
        assert_eq!(hdr.dst, Ipv4Addr::LOCALHOST);
        assert_eq!(hdr.proto(), Some(Ipv4Proto::Icmp));

        // ICMP checksum of the rewritten message verifies clean.
        assert_eq!(compute_checksum(payload, payload.len()), 0);
        assert_eq!(payload[0], crate::icmp::ICMP_TYPE_ECHO_REPLY);

        let (icmp_hdr, body) = icmp::parse_icmp(payload).unwrap();
        assert_eq!(icmp_hdr.id, 0x77);
        assert_eq!(icmp_hdr.seq, 3);
        assert_eq!(body, b"lo ping");
    }

    #[test]
    fn non_echo_traffic_is_not_rewritten() {
        let mut pkt = Packet::alloc(IPV4_HEADER_MIN_LEN + 8, HeadroomClass::Link);
        let buf = pkt.extend(IPV4_HEADER_MIN_LEN + 8).unwrap();
        write_ipv4_header(
            buf,
            Ipv4Addr::LOCALHOST,
            Ipv4Addr::LOCALHOST,
            Ipv4Proto::Udp.to_raw(),
            8,
            64,
            1,
            0,
        );
        assert!(rewrite_echo_request(&pkt).is_none());
    }
}
