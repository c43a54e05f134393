//! ICMP — control message generation and consumption.
//!
//! Answers echo requests (with suppression of consecutive duplicates and
//! token-bucket rate limiting), and builds the error notifications other
//! protocols use as their shared error-reporting channel: destination
//! unreachable in its variants, time exceeded (TTL and reassembly), and
//! parameter problem. Notifications quote the offending packet's IP header
//! plus the first 8 payload bytes, per the RFC 792 convention.
//!
//! Inbound error messages are demultiplexed back to the owning protocol's
//! error handler through the dispatch table.
//!
//! # References
//! - RFC 792: Internet Control Message Protocol

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::buffer::{HeadroomClass, Packet};
use crate::ipv4::{self, compute_checksum, Ipv4Addr, Ipv4Header, Ipv4Proto};
use crate::netif::NetIf;
use crate::stack::{DropReason, NetStack, RxVerdict};
use crate::IPV4_HEADER_MIN_LEN;

/// ICMP header length (type, code, checksum, rest-of-header).
pub const ICMP_HEADER_LEN: usize = 8;

pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_DEST_UNREACHABLE: u8 = 3;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;
pub const ICMP_TYPE_TIME_EXCEEDED: u8 = 11;
pub const ICMP_TYPE_PARAM_PROBLEM: u8 = 12;

pub const ICMP_CODE_NET_UNREACHABLE: u8 = 0;
pub const ICMP_CODE_HOST_UNREACHABLE: u8 = 1;
pub const ICMP_CODE_PROTO_UNREACHABLE: u8 = 2;
pub const ICMP_CODE_PORT_UNREACHABLE: u8 = 3;

pub const ICMP_CODE_TTL_EXCEEDED: u8 = 0;
pub const ICMP_CODE_FRAG_TIME_EXCEEDED: u8 = 1;

/// Generated ICMP messages per second (echo replies and errors share the
/// bucket).
pub const ICMP_RATE_PER_SEC: u64 = 50;

/// Burst capacity of the rate limiter.
pub const ICMP_RATE_BURST: u64 = 100;

// ============================================================================
// Errors
// ============================================================================

/// Errors from ICMP parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpError {
    Truncated,
    ChecksumMismatch,
}

/// Classification of an inbound ICMP error, delivered to the owning
/// protocol's error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpErrorKind {
    NetUnreachable,
    HostUnreachable,
    ProtoUnreachable,
    PortUnreachable,
    TtlExpired,
    FragReassemblyExceeded,
    ParamProblem,
}

impl IcmpErrorKind {
    fn from_wire(icmp_type: u8, code: u8) -> Option<Self> {
        match (icmp_type, code) {
            (ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_NET_UNREACHABLE) => {
                Some(IcmpErrorKind::NetUnreachable)
            }
            (ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_HOST_UNREACHABLE) => {
                Some(IcmpErrorKind::HostUnreachable)
            }
            (ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_PROTO_UNREACHABLE) => {
                Some(IcmpErrorKind::ProtoUnreachable)
            }
            (ICMP_TYPE_DEST_UNREACHABLE, ICMP_CODE_PORT_UNREACHABLE) => {
                Some(IcmpErrorKind::PortUnreachable)
            }
            (ICMP_TYPE_DEST_UNREACHABLE, _) => Some(IcmpErrorKind::HostUnreachable),
            (ICMP_TYPE_TIME_EXCEEDED, ICMP_CODE_FRAG_TIME_EXCEEDED) => {
                Some(IcmpErrorKind::FragReassemblyExceeded)
            }
            (ICMP_TYPE_TIME_EXCEEDED, _) => Some(IcmpErrorKind::TtlExpired),
            (ICMP_TYPE_PARAM_PROBLEM, _) => Some(IcmpErrorKind::ParamProblem),
            _ => None,
        }
    }
}

// ============================================================================
// Header
// ============================================================================

/// Parsed ICMP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    /// Identifier for echo messages, unused otherwise.
    pub id: u16,
    /// Sequence number for echo messages, pointer/unused otherwise.
    pub seq: u16,
}

/// Parse an ICMP message, verifying the checksum over the whole message.
pub fn parse_icmp(packet: &[u8]) -> Result<(IcmpHeader, &[u8]), IcmpError> {
    if packet.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }
    if compute_checksum(packet, packet.len()) != 0 {
        return Err(IcmpError::ChecksumMismatch);
    }

    let hdr = IcmpHeader {
        icmp_type: packet[0],
        code: packet[1],
        checksum: u16::from_be_bytes([packet[2], packet[3]]),
        id: u16::from_be_bytes([packet[4], packet[5]]),
        seq: u16::from_be_bytes([packet[6], packet[7]]),
    };
    Ok((hdr, &packet[ICMP_HEADER_LEN..]))
}

// ============================================================================
// Message Building
// ============================================================================

/// Build an echo reply from a validated echo request: type flipped,
/// id/seq/payload preserved, checksum recomputed.
pub fn build_echo_reply(request: &[u8]) -> Result<Vec<u8>, IcmpError> {
    if request.len() < ICMP_HEADER_LEN {
        return Err(IcmpError::Truncated);
    }
    let mut reply = request.to_vec();
    reply[0] = ICMP_TYPE_ECHO_REPLY;
    reply[1] = 0;
    reply[2] = 0;
    reply[3] = 0;
    let csum = compute_checksum(&reply, reply.len());
    reply[2..4].copy_from_slice(&csum.to_be_bytes());
    Ok(reply)
}

/// Build an echo request (diagnostics and the loopback tests).
pub fn build_echo_request(id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    msg.push(ICMP_TYPE_ECHO_REQUEST);
    msg.push(0);
    msg.extend_from_slice(&[0, 0]);
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    let csum = compute_checksum(&msg, msg.len());
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    msg
}

/// Build a notification message: header with `rest` in bytes 4..8,
/// followed by the quoted original datagram head.
fn build_notification(icmp_type: u8, code: u8, rest: u32, quoted: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + quoted.len());
    msg.push(icmp_type);
    msg.push(code);
    msg.extend_from_slice(&[0, 0]);
    msg.extend_from_slice(&rest.to_be_bytes());
    msg.extend_from_slice(quoted);
    let csum = compute_checksum(&msg, msg.len());
    msg[2..4].copy_from_slice(&csum.to_be_bytes());
    msg
}

/// Rebuild the offending datagram's header plus up to 8 payload bytes for
/// quoting inside a notification.
fn quote_original(hdr: &Ipv4Header, l4_bytes: &[u8]) -> Vec<u8> {
    let quoted_len = core::cmp::min(l4_bytes.len(), 8);
    let mut quoted = alloc::vec![0u8; IPV4_HEADER_MIN_LEN + quoted_len];

    quoted[0] = 0x45;
    quoted[1] = hdr.dscp_ecn;
    let total_len = (IPV4_HEADER_MIN_LEN + quoted_len) as u16;
    quoted[2..4].copy_from_slice(&total_len.to_be_bytes());
    quoted[4..6].copy_from_slice(&hdr.identification.to_be_bytes());
    quoted[6..8].copy_from_slice(&hdr.flags_fragment.to_be_bytes());
    quoted[8] = hdr.ttl;
    quoted[9] = hdr.protocol;
    quoted[12..16].copy_from_slice(&hdr.src.octets());
    quoted[16..20].copy_from_slice(&hdr.dst.octets());
    let csum = compute_checksum(&quoted[..IPV4_HEADER_MIN_LEN], IPV4_HEADER_MIN_LEN);
    quoted[10..12].copy_from_slice(&csum.to_be_bytes());

    quoted[IPV4_HEADER_MIN_LEN..].copy_from_slice(&l4_bytes[..quoted_len]);
    quoted
}

// ============================================================================
// Rate Limiting
// ============================================================================

/// Token-bucket limiter for generated ICMP traffic.
pub struct TokenBucket {
    state: Mutex<TokenBucketState>,
    rate_per_sec: u64,
    burst: u64,
}

struct TokenBucketState {
    tokens: u64,
    last_refill: u64,
}

impl TokenBucket {
    pub const fn new(rate_per_sec: u64, burst: u64) -> Self {
        TokenBucket {
            state: Mutex::new(TokenBucketState {
                tokens: burst,
                last_refill: 0,
            }),
            rate_per_sec,
            burst,
        }
    }

    /// Take one token; `false` means the caller must drop the message.
    pub fn allow(&self, now: u64) -> bool {
        let mut state = self.state.lock();
        let elapsed = now.saturating_sub(state.last_refill);
        let refill = elapsed * self.rate_per_sec / crate::TICKS_PER_SEC;
        if refill > 0 {
            state.tokens = core::cmp::min(state.tokens + refill, self.burst);
            state.last_refill = now;
        }
        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }
}

// ============================================================================
// Per-Stack ICMP State
// ============================================================================

/// ICMP state owned by the stack context.
pub struct IcmpState {
    /// Limits all generated replies and notifications.
    pub limiter: TokenBucket,
    /// Last echo request seen, for consecutive-duplicate suppression under
    /// packet duplication.
    last_echo: Mutex<Option<(Ipv4Addr, u16, u16)>>,
    pub rx_messages: AtomicU64,
    pub echo_requests: AtomicU64,
    pub echo_replies_sent: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub rate_limited: AtomicU64,
    pub rx_errors: AtomicU64,
}

impl IcmpState {
    pub const fn new() -> Self {
        IcmpState {
            limiter: TokenBucket::new(ICMP_RATE_PER_SEC, ICMP_RATE_BURST),
            last_echo: Mutex::new(None),
            rx_messages: AtomicU64::new(0),
            echo_requests: AtomicU64::new(0),
            echo_replies_sent: AtomicU64::new(0),
            notifications_sent: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
        }
    }
}

impl Default for IcmpState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Receive path
// ============================================================================

/// Process an inbound ICMP message.
pub fn receive(
    stack: &NetStack,
    _iface: &Arc<NetIf>,
    ip_hdr: &Ipv4Header,
    payload: &[u8],
    is_broadcast_dst: bool,
    now: u64,
) -> RxVerdict {
    stack.icmp.rx_messages.fetch_add(1, Ordering::Relaxed);

    let (hdr, _body) = match parse_icmp(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            stack.icmp.rx_errors.fetch_add(1, Ordering::Relaxed);
            return RxVerdict::Dropped(DropReason::Icmp(e));
        }
    };

    match hdr.icmp_type {
        ICMP_TYPE_ECHO_REQUEST => {
            stack.icmp.echo_requests.fetch_add(1, Ordering::Relaxed);

            // Never answer a request addressed to broadcast/multicast.
            if is_broadcast_dst || ip_hdr.dst.is_multicast() {
                return RxVerdict::Delivered;
            }

            // Suppress consecutive identical requests: duplicated packets
            // must not produce duplicated replies.
            {
                let mut last = stack.icmp.last_echo.lock();
                let this = (ip_hdr.src, hdr.id, hdr.seq);
                if *last == Some(this) {
                    return RxVerdict::Delivered;
                }
                *last = Some(this);
            }

            if !stack.icmp.limiter.allow(now) {
                stack.icmp.rate_limited.fetch_add(1, Ordering::Relaxed);
                return RxVerdict::Dropped(DropReason::RateLimited);
            }

            let reply = match build_echo_reply(payload) {
                Ok(reply) => reply,
                Err(e) => {
                    stack.icmp.rx_errors.fetch_add(1, Ordering::Relaxed);
                    return RxVerdict::Dropped(DropReason::Icmp(e));
                }
            };

            let mut pkt = Packet::alloc(reply.len(), HeadroomClass::Transport);
            if pkt.append(&reply).is_err() {
                return RxVerdict::Dropped(DropReason::NoBuffer);
            }
            if ipv4::send(stack, ip_hdr.src, Ipv4Proto::Icmp.to_raw(), pkt, now).is_ok() {
                stack.icmp.echo_replies_sent.fetch_add(1, Ordering::Relaxed);
            }
            RxVerdict::Delivered
        }
        ICMP_TYPE_ECHO_REPLY => RxVerdict::Delivered,
        _ => {
            // Error notification: route it back to the protocol that owns
            // the quoted datagram.
            if let Some(kind) = IcmpErrorKind::from_wire(hdr.icmp_type, hdr.code) {
                dispatch_error(stack, kind, &payload[ICMP_HEADER_LEN..], now);
            }
            RxVerdict::Delivered
        }
    }
}

/// Hand an inbound error to the owning protocol's error handler, keyed by
/// the protocol number of the quoted datagram.
fn dispatch_error(stack: &NetStack, kind: IcmpErrorKind, quoted: &[u8], now: u64) {
    if quoted.len() < IPV4_HEADER_MIN_LEN {
        return;
    }
    let (orig_hdr, _, orig_l4) = match ipv4::parse_ipv4(quoted) {
        Ok(parsed) => parsed,
        Err(_) => return,
    };
    if let Some(ops) = stack.protocols.find_input(orig_hdr.protocol) {
        ops.error(stack, kind, &orig_hdr, orig_l4, now);
    }
}

// ============================================================================
// Notification Senders
// ============================================================================

/// Common path for all outbound notifications: rate limit, refuse
/// broadcast/multicast originators, quote the offender, send.
fn send_notification(
    stack: &NetStack,
    icmp_type: u8,
    code: u8,
    rest: u32,
    offender: &Ipv4Header,
    l4_bytes: &[u8],
    now: u64,
) {
    // Errors about broadcast traffic would amplify; errors to invalid
    // sources would reflect.
    if offender.dst.is_broadcast() || offender.dst.is_multicast() {
        return;
    }
    if !offender.src.is_valid_source() {
        return;
    }
    if !stack.icmp.limiter.allow(now) {
        stack.icmp.rate_limited.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let quoted = quote_original(offender, l4_bytes);
    let msg = build_notification(icmp_type, code, rest, &quoted);

    let mut pkt = Packet::alloc(msg.len(), HeadroomClass::Transport);
    if pkt.append(&msg).is_err() {
        return;
    }
    if ipv4::send(stack, offender.src, Ipv4Proto::Icmp.to_raw(), pkt, now).is_ok() {
        stack.icmp.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// No transport listener on the destination port (UDP, mostly).
pub fn port_unreachable(stack: &NetStack, offender: &Ipv4Header, l4: &[u8], now: u64) {
    send_notification(
        stack,
        ICMP_TYPE_DEST_UNREACHABLE,
        ICMP_CODE_PORT_UNREACHABLE,
        0,
        offender,
        l4,
        now,
    );
}

/// No handler for the datagram's transport protocol.
pub fn proto_unreachable(stack: &NetStack, offender: &Ipv4Header, l4: &[u8], now: u64) {
    send_notification(
        stack,
        ICMP_TYPE_DEST_UNREACHABLE,
        ICMP_CODE_PROTO_UNREACHABLE,
        0,
        offender,
        l4,
        now,
    );
}

/// Destination unreachable with an explicit code (net/host variants).
pub fn dest_unreachable(stack: &NetStack, code: u8, offender: &Ipv4Header, l4: &[u8], now: u64) {
    send_notification(stack, ICMP_TYPE_DEST_UNREACHABLE, code, 0, offender, l4, now);
}

/// TTL reached zero in transit.
pub fn ttl_expired(stack: &NetStack, offender: &Ipv4Header, l4: &[u8], now: u64) {
    send_notification(
        stack,
        ICMP_TYPE_TIME_EXCEEDED,
        ICMP_CODE_TTL_EXCEEDED,
        0,
        offender,
        l4,
        now,
    );
}

/// Fragment reassembly timed out before the datagram completed.
pub fn frag_expired(stack: &NetStack, offender: &Ipv4Header, l4: &[u8], now: u64) {
    send_notification(
        stack,
        ICMP_TYPE_TIME_EXCEEDED,
        ICMP_CODE_FRAG_TIME_EXCEEDED,
        0,
        offender,
        l4,
        now,
    );
}

/// Malformed header field at byte offset `pointer`.
pub fn param_problem(stack: &NetStack, pointer: u8, offender: &Ipv4Header, l4: &[u8], now: u64) {
    send_notification(
        stack,
        ICMP_TYPE_PARAM_PROBLEM,
        0,
        (pointer as u32) << 24,
        offender,
        l4,
        now,
    );
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_checksum_round_trip() {
        let msg = build_echo_request(0x1234, 1, b"ping payload");
        assert_eq!(compute_checksum(&msg, msg.len()), 0);

        let (hdr, body) = parse_icmp(&msg).unwrap();
        assert_eq!(hdr.icmp_type, ICMP_TYPE_ECHO_REQUEST);
        assert_eq!(hdr.id, 0x1234);
        assert_eq!(hdr.seq, 1);
        assert_eq!(body, b"ping payload");
    }

    #[test]
    fn echo_reply_flips_type_and_rechecksums() {
        let request = build_echo_request(7, 42, &[0xab; 16]);
        let reply = build_echo_reply(&request).unwrap();

        assert_eq!(reply[0], ICMP_TYPE_ECHO_REPLY);
        assert_eq!(compute_checksum(&reply, reply.len()), 0);

        let (hdr, body) = parse_icmp(&reply).unwrap();
        assert_eq!(hdr.id, 7);
        assert_eq!(hdr.seq, 42);
        assert_eq!(body, &[0xab; 16]);
    }

    #[test]
    fn parse_rejects_bad_checksum() {
        let mut msg = build_echo_request(1, 1, b"x");
        msg[4] ^= 0xff;
        assert_eq!(parse_icmp(&msg), Err(IcmpError::ChecksumMismatch));
    }

    #[test]
    fn notification_quotes_header_and_eight_bytes() {
        let offender = Ipv4Header {
            version: 4,
            ihl: 5,
            dscp_ecn: 0,
            total_len: 48,
            identification: 0x99,
            flags_fragment: 0,
            ttl: 60,
            protocol: 17,
            checksum: 0,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
        };
        let l4 = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let quoted = quote_original(&offender, &l4);

        assert_eq!(quoted.len(), IPV4_HEADER_MIN_LEN + 8);
        assert_eq!(quoted[9], 17);
        assert_eq!(&quoted[IPV4_HEADER_MIN_LEN..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        // The quoted header itself checksums clean.
        assert_eq!(compute_checksum(&quoted[..IPV4_HEADER_MIN_LEN], IPV4_HEADER_MIN_LEN), 0);

        let msg = build_notification(
            ICMP_TYPE_DEST_UNREACHABLE,
            ICMP_CODE_PORT_UNREACHABLE,
            0,
            &quoted,
        );
        assert_eq!(compute_checksum(&msg, msg.len()), 0);
        assert_eq!(msg[0], ICMP_TYPE_DEST_UNREACHABLE);
        assert_eq!(msg[1], ICMP_CODE_PORT_UNREACHABLE);
    }

    #[test]
    fn token_bucket_limits_and_refills() {
        let bucket = TokenBucket::new(10, 2);
        assert!(bucket.allow(0));
        assert!(bucket.allow(0));
        assert!(!bucket.allow(0));

        // One second of ticks refills up to the burst cap.
        assert!(bucket.allow(crate::TICKS_PER_SEC));
        assert!(bucket.allow(crate::TICKS_PER_SEC));
        assert!(!bucket.allow(crate::TICKS_PER_SEC));
    }
}
