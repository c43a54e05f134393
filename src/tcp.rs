//! TCP wire format, control block, and transmission algorithms.
//!
//! This module owns everything below the connection state machine: header
//! and option parsing/serialization (MSS, SACK-permitted, SACK blocks,
//! timestamps), the control block with its RFC 793 sequence spaces,
//! wraparound-safe sequence arithmetic, RFC 6298 round-trip-time
//! estimation, ACK processing with Karn's rule, and the congestion window
//! bookkeeping the sender gates itself on. The connection automaton that
//! drives these pieces lives in `tcp_conn`.
//!
//! # References
//! - RFC 793: Transmission Control Protocol
//! - RFC 2018: TCP Selective Acknowledgment Options
//! - RFC 5681: TCP Congestion Control
//! - RFC 6298: Computing TCP's Retransmission Timer
//! - RFC 6528: Defending Against Sequence Number Attacks

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::ipv4::{transport_checksum, Ipv4Addr};
use crate::TICKS_PER_SEC;

// ============================================================================
// Constants
// ============================================================================

/// TCP header minimum length (no options).
pub const TCP_HEADER_MIN_LEN: usize = 20;

/// TCP protocol number.
pub const TCP_PROTO: u8 = 6;

/// Conservative default MSS (RFC 879).
pub const TCP_DEFAULT_MSS: u16 = 536;

/// MSS for Ethernet paths (1500 - 20 IP - 20 TCP).
pub const TCP_ETHERNET_MSS: u16 = 1460;

/// Default receive window in bytes.
pub const TCP_DEFAULT_WINDOW: u16 = 65535;

/// Receive buffer capacity per connection.
pub const TCP_RECV_BUFFER_CAP: usize = 64 * 1024;

/// Initial retransmission timeout.
pub const TCP_INITIAL_RTO_TICKS: u64 = TICKS_PER_SEC;

/// RTO floor per RFC 6298 section 2.4.
pub const TCP_MIN_RTO_TICKS: u64 = TICKS_PER_SEC;

/// RTO ceiling.
pub const TCP_MAX_RTO_TICKS: u64 = 120 * TICKS_PER_SEC;

/// Maximum segment lifetime; TIME_WAIT holds for twice this.
pub const TCP_MSL_TICKS: u64 = 60 * TICKS_PER_SEC;

/// TIME_WAIT hold period (2 x MSL).
pub const TCP_TIME_WAIT_TICKS: u64 = 2 * TCP_MSL_TICKS;

/// Ceiling on how long a connection may sit in a closing state before it
/// is force-closed, whichever of this and 2MSL comes first.
pub const TCP_USER_TIMEOUT_TICKS: u64 = 180 * TICKS_PER_SEC;

/// Delayed-ACK coalescing window.
pub const TCP_DELAYED_ACK_TICKS: u64 = TICKS_PER_SEC / 5;

/// Retransmission attempts before the connection is aborted.
pub const TCP_MAX_RETRIES: u8 = 12;

/// Idle period before keepalive probing starts.
pub const TCP_KEEPALIVE_IDLE_TICKS: u64 = 600 * TICKS_PER_SEC;

/// Interval between keepalive probes.
pub const TCP_KEEPALIVE_INTERVAL_TICKS: u64 = 75 * TICKS_PER_SEC;

/// Unanswered keepalive probes before the connection is aborted.
pub const TCP_KEEPALIVE_MAX_PROBES: u8 = 9;

/// Out-of-order segments buffered per connection.
pub const TCP_MAX_OOO_SEGMENTS: usize = 16;

/// SACK blocks tracked and advertised (RFC 2018 limit with other options
/// present).
pub const TCP_MAX_SACK_BLOCKS: usize = 4;

// ============================================================================
// Flags
// ============================================================================

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

// ============================================================================
// State Machine States
// ============================================================================

/// TCP connection state per RFC 793.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    /// Data may be queued for sending in this state.
    pub fn can_send(&self) -> bool {
        matches!(self, TcpState::Established | TcpState::CloseWait)
    }

    /// Data from the peer is still accepted in this state.
    pub fn can_receive(&self) -> bool {
        matches!(
            self,
            TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
        )
    }

    /// Sequence numbers have been synchronized (handshake done).
    pub fn is_synchronized(&self) -> bool {
        !matches!(
            self,
            TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynReceived
        )
    }
}

// ============================================================================
// Sequence Arithmetic
// ============================================================================

/// a < b in sequence space (wraparound-safe).
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// a <= b in sequence space.
#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

/// a > b in sequence space.
#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) < 0
}

/// a >= b in sequence space.
#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    a == b || seq_gt(a, b)
}

/// seq falls within the window `[left, left + size)`.
#[inline]
pub fn seq_in_window(seq: u32, left: u32, size: u32) -> bool {
    if size == 0 {
        return seq == left;
    }
    let right = left.wrapping_add(size);
    if seq_le(left, right) {
        seq_ge(seq, left) && seq_lt(seq, right)
    } else {
        seq_ge(seq, left) || seq_lt(seq, right)
    }
}

// ============================================================================
// Header
// ============================================================================

/// Parsed TCP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Data offset in 32-bit words (5..=15).
    pub data_offset: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    pub fn new(
        src_port: u16,
        dst_port: u16,
        seq_num: u32,
        ack_num: u32,
        flags: u8,
        window: u16,
    ) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq_num,
            ack_num,
            data_offset: 5,
            flags,
            window,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    #[inline]
    pub fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    #[inline]
    pub fn is_syn(&self) -> bool {
        self.flags & TCP_FLAG_SYN != 0
    }

    #[inline]
    pub fn is_ack(&self) -> bool {
        self.flags & TCP_FLAG_ACK != 0
    }

    #[inline]
    pub fn is_fin(&self) -> bool {
        self.flags & TCP_FLAG_FIN != 0
    }

    #[inline]
    pub fn is_rst(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }

    /// Serialize the fixed 20-byte header (checksum as stored).
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_MIN_LEN] {
        let mut bytes = [0u8; TCP_HEADER_MIN_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_num.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_num.to_be_bytes());
        bytes[12] = self.data_offset << 4;
        bytes[13] = self.flags;
        bytes[14..16].copy_from_slice(&self.window.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from TCP segment processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpError {
    Truncated,
    InvalidHeaderLen,
    BadChecksum,
    ConnectionReset,
    ConnectionExists,
    InvalidState,
    NotConnected,
    PortInUse,
    Timeout,
    WouldBlock,
}

/// Result type for TCP operations.
pub type TcpResult<T> = Result<T, TcpError>;

// ============================================================================
// Statistics
// ============================================================================

/// TCP stack statistics.
#[derive(Debug, Default)]
pub struct TcpStats {
    pub rx_segments: AtomicU64,
    pub tx_segments: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub connections_established: AtomicU64,
    pub connections_reset: AtomicU64,
    pub retransmissions: AtomicU64,
    pub out_of_order: AtomicU64,
    pub keepalive_probes: AtomicU64,
}

impl TcpStats {
    pub const fn new() -> Self {
        TcpStats {
            rx_segments: AtomicU64::new(0),
            tx_segments: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            checksum_errors: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connections_reset: AtomicU64::new(0),
            retransmissions: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            keepalive_probes: AtomicU64::new(0),
        }
    }
}

// ============================================================================
// Options
// ============================================================================

/// A selectively acknowledged range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SackBlock {
    pub start: u32,
    pub end: u32,
}

/// Options parsed from a received segment.
#[derive(Debug, Clone, Default)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub sack_permitted: bool,
    pub sack_blocks: Vec<SackBlock>,
    pub timestamps: Option<(u32, u32)>,
}

/// Options to serialize into an outgoing segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOptionsOut<'a> {
    pub mss: Option<u16>,
    pub sack_permitted: bool,
    pub sack_blocks: &'a [SackBlock],
    pub timestamps: Option<(u32, u32)>,
}

impl<'a> TcpOptionsOut<'a> {
    pub fn none() -> Self {
        TcpOptionsOut {
            mss: None,
            sack_permitted: false,
            sack_blocks: &[],
            timestamps: None,
        }
    }
}

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;
const OPT_SACK_PERMITTED: u8 = 4;
const OPT_SACK: u8 = 5;
const OPT_TIMESTAMPS: u8 = 8;

/// Parse the option bytes of a segment.
pub fn parse_tcp_options(segment: &[u8], header: &TcpHeader) -> TcpOptions {
    let mut options = TcpOptions::default();
    let header_len = header.header_len();
    if header_len <= TCP_HEADER_MIN_LEN || segment.len() < header_len {
        return options;
    }

    let bytes = &segment[TCP_HEADER_MIN_LEN..header_len];
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            OPT_END => break,
            OPT_NOP => {
                i += 1;
                continue;
            }
            kind => {
                if i + 1 >= bytes.len() {
                    break;
                }
                let len = bytes[i + 1] as usize;
                if len < 2 || i + len > bytes.len() {
                    break;
                }
                let body = &bytes[i + 2..i + len];
                match kind {
                    OPT_MSS if body.len() == 2 => {
                        options.mss = Some(u16::from_be_bytes([body[0], body[1]]));
                    }
                    OPT_SACK_PERMITTED if body.is_empty() => {
                        options.sack_permitted = true;
                    }
                    OPT_SACK if body.len() % 8 == 0 => {
                        for block in body.chunks_exact(8) {
                            if options.sack_blocks.len() >= TCP_MAX_SACK_BLOCKS {
                                break;
                            }
                            options.sack_blocks.push(SackBlock {
                                start: u32::from_be_bytes([block[0], block[1], block[2], block[3]]),
                                end: u32::from_be_bytes([block[4], block[5], block[6], block[7]]),
                            });
                        }
                    }
                    OPT_TIMESTAMPS if body.len() == 8 => {
                        options.timestamps = Some((
                            u32::from_be_bytes([body[0], body[1], body[2], body[3]]),
                            u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
                        ));
                    }
                    _ => {}
                }
                i += len;
            }
        }
    }
    options
}

/// Serialize options, padded with NOPs to a 32-bit boundary.
fn serialize_options(options: &TcpOptionsOut<'_>) -> Vec<u8> {
    let mut bytes = Vec::new();

    if let Some(mss) = options.mss {
        bytes.push(OPT_MSS);
        bytes.push(4);
        bytes.extend_from_slice(&mss.to_be_bytes());
    }
    if options.sack_permitted {
        bytes.push(OPT_SACK_PERMITTED);
        bytes.push(2);
    }
    if let Some((ts_val, ts_ecr)) = options.timestamps {
        bytes.push(OPT_TIMESTAMPS);
        bytes.push(10);
        bytes.extend_from_slice(&ts_val.to_be_bytes());
        bytes.extend_from_slice(&ts_ecr.to_be_bytes());
    }
    if !options.sack_blocks.is_empty() {
        let blocks = &options.sack_blocks[..options.sack_blocks.len().min(TCP_MAX_SACK_BLOCKS)];
        bytes.push(OPT_SACK);
        bytes.push(2 + 8 * blocks.len() as u8);
        for block in blocks {
            bytes.extend_from_slice(&block.start.to_be_bytes());
            bytes.extend_from_slice(&block.end.to_be_bytes());
        }
    }

    while bytes.len() % 4 != 0 {
        bytes.push(OPT_NOP);
    }
    bytes
}

// ============================================================================
// Parsing and Building
// ============================================================================

/// Parse a TCP header (checksum is the caller's problem).
pub fn parse_tcp_header(data: &[u8]) -> TcpResult<TcpHeader> {
    if data.len() < TCP_HEADER_MIN_LEN {
        return Err(TcpError::Truncated);
    }

    let data_offset = (data[12] >> 4) & 0x0f;
    if data_offset < 5 {
        return Err(TcpError::InvalidHeaderLen);
    }
    if data.len() < (data_offset as usize) * 4 {
        return Err(TcpError::Truncated);
    }

    Ok(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// Verify a received segment's checksum against the pseudo-header.
pub fn verify_tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    transport_checksum(src, dst, TCP_PROTO, segment) == 0
}

/// Build a complete TCP segment: header, options, payload, checksum.
pub fn build_tcp_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq_num: u32,
    ack_num: u32,
    flags: u8,
    window: u16,
    options: &TcpOptionsOut<'_>,
    payload: &[u8],
) -> Vec<u8> {
    let opt_bytes = serialize_options(options);
    let header_len = TCP_HEADER_MIN_LEN + opt_bytes.len();

    let mut header = TcpHeader::new(src_port, dst_port, seq_num, ack_num, flags, window);
    header.data_offset = (header_len / 4) as u8;

    let mut segment = Vec::with_capacity(header_len + payload.len());
    segment.extend_from_slice(&header.to_bytes());
    segment.extend_from_slice(&opt_bytes);
    segment.extend_from_slice(payload);

    let csum = transport_checksum(src_ip, dst_ip, TCP_PROTO, &segment);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());
    segment
}

// ============================================================================
// Initial Sequence Numbers
// ============================================================================

/// Monotonic component mixed into ISNs so two connections opened in the
/// same tick never collide.
static ISN_COUNTER: AtomicU64 = AtomicU64::new(0x9e37_79b9);

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Generate an initial sequence number from a keyed hash over the
/// connection 4-tuple plus time, per the RFC 6528 construction.
pub fn generate_isn(key: &TcpConnKey, now: u64) -> u32 {
    let counter = ISN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut h = splitmix64(
        (key.local_ip.to_u32() as u64) << 32 | key.remote_ip.to_u32() as u64,
    );
    h ^= splitmix64((key.local_port as u64) << 16 | key.remote_port as u64);
    h ^= splitmix64(counter ^ (now << 20));
    (h ^ (h >> 32)) as u32
}

// ============================================================================
// Control Block
// ============================================================================

/// 4-tuple connection identity, from the local end's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcpConnKey {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

impl TcpConnKey {
    pub fn new(local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Self {
        TcpConnKey {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        }
    }
}

/// A buffered outbound segment awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    /// Sequence number of the first byte.
    pub seq: u32,
    pub data: Vec<u8>,
    /// FIN occupies one sequence number after the data.
    pub fin: bool,
    /// Tick the segment was (last) sent at.
    pub sent_at: u64,
    pub retrans_count: u8,
}

impl TcpSegment {
    /// Sequence space consumed by this segment.
    pub fn seq_len(&self) -> u32 {
        self.data.len() as u32 + if self.fin { 1 } else { 0 }
    }

    pub fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.seq_len())
    }
}

/// TCP control block: all per-connection protocol state.
#[derive(Debug)]
pub struct TcpControlBlock {
    pub state: TcpState,
    pub key: TcpConnKey,

    // Send sequence space (RFC 793 section 3.2).
    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_wl1: u32,
    pub snd_wl2: u32,

    // Congestion control (RFC 5681).
    pub cwnd: u32,
    pub ssthresh: u32,
    pub dup_ack_count: u8,

    // Receive sequence space.
    pub irs: u32,
    pub rcv_nxt: u32,
    pub rcv_wnd: u32,

    // Segment sizes.
    pub snd_mss: u16,
    pub rcv_mss: u16,

    // Negotiated options.
    pub sack_enabled: bool,
    pub ts_enabled: bool,
    /// Most recent peer timestamp, echoed in our segments.
    pub ts_recent: u32,

    // Retransmission state (RFC 6298).
    pub rto_ticks: u64,
    pub srtt_ticks: u64,
    pub rttvar_ticks: u64,
    pub retries: u8,

    // Buffers.
    pub send_buffer: VecDeque<TcpSegment>,
    pub recv_buffer: VecDeque<u8>,
    /// Out-of-order segments, kept sorted by sequence number.
    pub ooo_queue: VecDeque<TcpSegment>,
    /// Discontiguous received ranges advertised to the peer.
    pub sack_blocks: Vec<SackBlock>,

    // Close handling.
    pub fin_sent: bool,
    pub fin_received: bool,

    // Delayed ACK.
    pub ack_pending: bool,
    pub segments_since_ack: u8,

    // Liveness bookkeeping.
    pub last_activity: u64,
    pub time_wait_start: u64,
    pub keepalive_probes: u8,
}

/// Initial congestion window per RFC 5681 section 3.1:
/// `min(4*SMSS, max(2*SMSS, 4380))`.
#[inline]
pub fn initial_cwnd(smss: u16) -> u32 {
    let smss = smss as u32;
    core::cmp::min(smss * 4, core::cmp::max(smss * 2, 4380))
}

impl TcpControlBlock {
    /// Control block for an active open (client side).
    pub fn new_client(key: TcpConnKey, iss: u32, now: u64) -> Self {
        TcpControlBlock {
            state: TcpState::Closed,
            key,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            cwnd: initial_cwnd(TCP_DEFAULT_MSS),
            ssthresh: 64 * 1024,
            dup_ack_count: 0,
            irs: 0,
            rcv_nxt: 0,
            rcv_wnd: TCP_DEFAULT_WINDOW as u32,
            snd_mss: TCP_DEFAULT_MSS,
            rcv_mss: TCP_ETHERNET_MSS,
            sack_enabled: false,
            ts_enabled: false,
            ts_recent: 0,
            rto_ticks: TCP_INITIAL_RTO_TICKS,
            srtt_ticks: 0,
            rttvar_ticks: 0,
            retries: 0,
            send_buffer: VecDeque::new(),
            recv_buffer: VecDeque::new(),
            ooo_queue: VecDeque::new(),
            sack_blocks: Vec::new(),
            fin_sent: false,
            fin_received: false,
            ack_pending: false,
            segments_since_ack: 0,
            last_activity: now,
            time_wait_start: 0,
            keepalive_probes: 0,
        }
    }

    /// Control block for a passive open (SYN just received).
    pub fn new_server(key: TcpConnKey, iss: u32, irs: u32, now: u64) -> Self {
        let mut tcb = Self::new_client(key, iss, now);
        tcb.irs = irs;
        tcb.rcv_nxt = irs.wrapping_add(1);
        tcb.state = TcpState::SynReceived;
        tcb
    }

    /// Unacknowledged bytes in flight.
    #[inline]
    pub fn bytes_in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Room left for new data: `min(peer window, cwnd) - in flight`.
    pub fn send_window_available(&self) -> u32 {
        let effective = core::cmp::min(self.snd_wnd, self.cwnd.max(self.snd_mss as u32));
        effective.saturating_sub(self.bytes_in_flight())
    }

    /// Receive window to advertise, accounting for buffered data.
    pub fn advertised_window(&self) -> u16 {
        let used = self.recv_buffer.len();
        let avail = (TCP_RECV_BUFFER_CAP.saturating_sub(used)).min(u16::MAX as usize);
        avail as u16
    }

    /// Record a received out-of-order range for SACK advertisement.
    ///
    /// The most recent block goes first (RFC 2018 ordering); overlapping
    /// blocks are merged and at most [`TCP_MAX_SACK_BLOCKS`] are kept.
    pub fn add_sack_block(&mut self, start: u32, end: u32) {
        let mut merged = SackBlock { start, end };
        self.sack_blocks.retain(|b| {
            let overlaps = seq_le(b.start, merged.end) && seq_le(merged.start, b.end);
            if overlaps {
                if seq_lt(b.start, merged.start) {
                    merged.start = b.start;
                }
                if seq_gt(b.end, merged.end) {
                    merged.end = b.end;
                }
            }
            !overlaps
        });
        self.sack_blocks.insert(0, merged);
        self.sack_blocks.truncate(TCP_MAX_SACK_BLOCKS);
    }

    /// Drop SACK blocks that the cumulative ACK point has overtaken.
    pub fn prune_sack_blocks(&mut self) {
        let rcv_nxt = self.rcv_nxt;
        self.sack_blocks.retain(|b| seq_gt(b.end, rcv_nxt));
    }
}

// ============================================================================
// RTT Estimation (RFC 6298)
// ============================================================================

/// Clock granularity G for the RTO variance term, in ticks.
const RTO_GRANULARITY_TICKS: u64 = 1;

/// Update the smoothed RTT and variance from one sample and derive the
/// retransmission timeout.
///
/// First sample: `SRTT = R, RTTVAR = R/2`. Then
/// `RTTVAR = 3/4 RTTVAR + 1/4 |SRTT - R|` and
/// `SRTT = 7/8 SRTT + 1/8 R`; `RTO = SRTT + max(G, 4*RTTVAR)`, clamped to
/// `[TCP_MIN_RTO_TICKS, TCP_MAX_RTO_TICKS]`.
pub fn update_rtt(tcb: &mut TcpControlBlock, sample_ticks: u64) {
    if sample_ticks == 0 || sample_ticks > 600 * TICKS_PER_SEC {
        return;
    }

    if tcb.srtt_ticks == 0 {
        tcb.srtt_ticks = sample_ticks;
        tcb.rttvar_ticks = sample_ticks / 2;
    } else {
        let err = tcb.srtt_ticks.abs_diff(sample_ticks);
        tcb.rttvar_ticks = (3 * tcb.rttvar_ticks + err) / 4;
        tcb.srtt_ticks = (7 * tcb.srtt_ticks + sample_ticks) / 8;
    }

    let variance_term = core::cmp::max(RTO_GRANULARITY_TICKS, 4 * tcb.rttvar_ticks);
    tcb.rto_ticks = tcb
        .srtt_ticks
        .saturating_add(variance_term)
        .clamp(TCP_MIN_RTO_TICKS, TCP_MAX_RTO_TICKS);
}

// ============================================================================
// ACK Processing
// ============================================================================

/// Outcome of ACK processing, feeding the congestion response.
#[derive(Debug, Default, Clone, Copy)]
pub struct AckUpdate {
    /// Newly acknowledged bytes (0 for a duplicate).
    pub newly_acked: u32,
    /// ACK repeated the current acknowledgment point.
    pub duplicate: bool,
}

/// Advance `snd_una`, drop fully acknowledged segments from the send
/// buffer, and sample RTT from the first segment never retransmitted
/// (Karn's rule keeps ambiguous samples out of the estimate).
pub fn handle_ack(tcb: &mut TcpControlBlock, ack_num: u32, now: u64) -> AckUpdate {
    let mut update = AckUpdate::default();

    if seq_gt(ack_num, tcb.snd_una) {
        update.newly_acked = ack_num.wrapping_sub(tcb.snd_una);

        let mut rtt_sampled = false;
        while let Some(seg) = tcb.send_buffer.front() {
            if !seq_ge(ack_num, seg.end_seq()) {
                break;
            }
            let seg = tcb.send_buffer.pop_front().expect("front just checked");
            if !rtt_sampled && seg.retrans_count == 0 {
                update_rtt(tcb, now.saturating_sub(seg.sent_at));
                rtt_sampled = true;
            }
        }

        tcb.snd_una = ack_num;
        tcb.retries = 0;
    } else if ack_num == tcb.snd_una && tcb.bytes_in_flight() > 0 {
        update.duplicate = true;
    }

    update
}

// ============================================================================
// Congestion Window (RFC 5681, simplified)
// ============================================================================

/// Action requested by the congestion response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionAction {
    None,
    /// Third duplicate ACK: retransmit the first unacknowledged segment.
    FastRetransmit,
}

/// Grow or shrink the congestion window after an ACK.
///
/// Slow start grows `cwnd` by one MSS-bounded increment per ACK until it
/// passes `ssthresh`, then congestion avoidance grows it about one MSS
/// per round trip. Three duplicate ACKs halve the window and request a
/// fast retransmit.
pub fn update_congestion(tcb: &mut TcpControlBlock, update: AckUpdate) -> CongestionAction {
    let mss = tcb.snd_mss as u32;

    if update.newly_acked > 0 {
        tcb.dup_ack_count = 0;
        if tcb.cwnd < tcb.ssthresh {
            tcb.cwnd = tcb.cwnd.saturating_add(core::cmp::min(update.newly_acked, mss).max(1));
        } else {
            let increment = mss.saturating_mul(mss) / tcb.cwnd.max(1);
            tcb.cwnd = tcb.cwnd.saturating_add(increment.max(1));
        }
        return CongestionAction::None;
    }

    if update.duplicate {
        tcb.dup_ack_count = tcb.dup_ack_count.saturating_add(1);
        if tcb.dup_ack_count == 3 {
            let flight = tcb.bytes_in_flight().max(mss);
            tcb.ssthresh = core::cmp::max(flight / 2, 2 * mss);
            tcb.cwnd = tcb.ssthresh;
            return CongestionAction::FastRetransmit;
        }
    }

    CongestionAction::None
}

/// Collapse the window after a retransmission timeout: back to one
/// segment in slow start.
pub fn on_retransmission_timeout(tcb: &mut TcpControlBlock) {
    let flight = tcb.bytes_in_flight().max(tcb.snd_mss as u32);
    tcb.ssthresh = core::cmp::max(flight / 2, 2 * tcb.snd_mss as u32);
    tcb.cwnd = tcb.snd_mss as u32;
    tcb.dup_ack_count = 0;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn test_key() -> TcpConnKey {
        TcpConnKey::new(A, 4000, B, 80)
    }

    #[test]
    fn sequence_arithmetic_wraps() {
        assert!(seq_lt(100, 200));
        assert!(seq_le(100, 100));
        assert!(seq_gt(200, 100));
        assert!(seq_lt(0xffff_ffff, 0));
        assert!(seq_gt(0, 0xffff_ffff));
        assert!(seq_in_window(5, 0, 10));
        assert!(seq_in_window(0xffff_fffe, 0xffff_fff0, 0x20));
        assert!(!seq_in_window(11, 0, 10));
        assert!(seq_in_window(3, 3, 0));
    }

    #[test]
    fn header_build_parse_round_trip() {
        let segment = build_tcp_segment(
            A,
            B,
            4000,
            80,
            1000,
            2000,
            TCP_FLAG_ACK | TCP_FLAG_PSH,
            8192,
            &TcpOptionsOut::none(),
            b"hello",
        );

        let hdr = parse_tcp_header(&segment).unwrap();
        assert_eq!(hdr.src_port, 4000);
        assert_eq!(hdr.dst_port, 80);
        assert_eq!(hdr.seq_num, 1000);
        assert_eq!(hdr.ack_num, 2000);
        assert!(hdr.is_ack());
        assert!(!hdr.is_syn());
        assert_eq!(hdr.window, 8192);
        assert_eq!(&segment[hdr.header_len()..], b"hello");
        assert!(verify_tcp_checksum(A, B, &segment));
    }

    #[test]
    fn corrupted_segment_fails_checksum() {
        let mut segment = build_tcp_segment(
            A,
            B,
            1,
            2,
            0,
            0,
            TCP_FLAG_SYN,
            1024,
            &TcpOptionsOut::none(),
            &[],
        );
        segment[4] ^= 0xff;
        assert!(!verify_tcp_checksum(A, B, &segment));
    }

    #[test]
    fn options_round_trip() {
        let blocks = [
            SackBlock { start: 3000, end: 3500 },
            SackBlock { start: 4000, end: 4100 },
        ];
        let segment = build_tcp_segment(
            A,
            B,
            1,
            2,
            100,
            200,
            TCP_FLAG_SYN,
            1024,
            &TcpOptionsOut {
                mss: Some(1460),
                sack_permitted: true,
                sack_blocks: &blocks,
                timestamps: Some((111, 222)),
            },
            &[],
        );

        let hdr = parse_tcp_header(&segment).unwrap();
        assert_eq!(hdr.header_len() % 4, 0);
        assert!(verify_tcp_checksum(A, B, &segment));

        let options = parse_tcp_options(&segment, &hdr);
        assert_eq!(options.mss, Some(1460));
        assert!(options.sack_permitted);
        assert_eq!(options.timestamps, Some((111, 222)));
        assert_eq!(options.sack_blocks.len(), 2);
        assert_eq!(options.sack_blocks[0], SackBlock { start: 3000, end: 3500 });
    }

    #[test]
    fn isn_differs_per_connection_and_time() {
        let key = test_key();
        let other = TcpConnKey::new(A, 4001, B, 80);
        let isn_a = generate_isn(&key, 100);
        let isn_b = generate_isn(&other, 100);
        let isn_c = generate_isn(&key, 200);
        assert_ne!(isn_a, isn_b);
        assert_ne!(isn_a, isn_c);
    }

    #[test]
    fn rtt_estimation_and_rto_bounds() {
        let mut tcb = TcpControlBlock::new_client(test_key(), 1, 0);

        update_rtt(&mut tcb, 30);
        assert_eq!(tcb.srtt_ticks, 30);
        assert_eq!(tcb.rttvar_ticks, 15);
        // RTO floors at the minimum even for fast paths.
        assert_eq!(tcb.rto_ticks, TCP_MIN_RTO_TICKS);

        // A slow sample raises the estimate smoothly.
        update_rtt(&mut tcb, 400);
        assert!(tcb.srtt_ticks > 30 && tcb.srtt_ticks < 400);
        assert!(tcb.rto_ticks >= TCP_MIN_RTO_TICKS);
        assert!(tcb.rto_ticks <= TCP_MAX_RTO_TICKS);
    }

    #[test]
    fn ack_advances_and_drops_acked_segments() {
        let mut tcb = TcpControlBlock::new_client(test_key(), 1000, 0);
        tcb.snd_una = 1000;
        tcb.snd_nxt = 1300;
        tcb.send_buffer.push_back(TcpSegment {
            seq: 1000,
            data: alloc::vec![0u8; 100],
            fin: false,
            sent_at: 10,
            retrans_count: 0,
        });
        tcb.send_buffer.push_back(TcpSegment {
            seq: 1100,
            data: alloc::vec![0u8; 200],
            fin: false,
            sent_at: 12,
            retrans_count: 0,
        });

        let update = handle_ack(&mut tcb, 1100, 50);
        assert_eq!(update.newly_acked, 100);
        assert_eq!(tcb.snd_una, 1100);
        assert_eq!(tcb.send_buffer.len(), 1);
        // RTT sampled from the first non-retransmitted segment.
        assert_eq!(tcb.srtt_ticks, 40);

        // Same ACK again while data is outstanding: duplicate.
        let update = handle_ack(&mut tcb, 1100, 60);
        assert!(update.duplicate);
        assert_eq!(update.newly_acked, 0);
    }

    #[test]
    fn karn_rule_skips_retransmitted_samples() {
        let mut tcb = TcpControlBlock::new_client(test_key(), 0, 0);
        tcb.snd_una = 0;
        tcb.snd_nxt = 100;
        tcb.send_buffer.push_back(TcpSegment {
            seq: 0,
            data: alloc::vec![0u8; 100],
            fin: false,
            sent_at: 10,
            retrans_count: 1,
        });

        handle_ack(&mut tcb, 100, 500);
        assert_eq!(tcb.srtt_ticks, 0);
    }

    #[test]
    fn congestion_slow_start_then_avoidance() {
        let mut tcb = TcpControlBlock::new_client(test_key(), 0, 0);
        tcb.snd_mss = 1000;
        tcb.cwnd = 1000;
        tcb.ssthresh = 3000;

        // Slow start: one MSS per ACK.
        update_congestion(&mut tcb, AckUpdate { newly_acked: 1000, duplicate: false });
        assert_eq!(tcb.cwnd, 2000);
        update_congestion(&mut tcb, AckUpdate { newly_acked: 1000, duplicate: false });
        assert_eq!(tcb.cwnd, 3000);

        // Past ssthresh: roughly MSS^2/cwnd per ACK.
        update_congestion(&mut tcb, AckUpdate { newly_acked: 1000, duplicate: false });
        assert!(tcb.cwnd > 3000 && tcb.cwnd < 3500);
    }

    #[test]
    fn triple_duplicate_ack_triggers_fast_retransmit() {
        let mut tcb = TcpControlBlock::new_client(test_key(), 0, 0);
        tcb.snd_mss = 1000;
        tcb.snd_una = 0;
        tcb.snd_nxt = 8000;
        tcb.cwnd = 8000;

        let dup = AckUpdate { newly_acked: 0, duplicate: true };
        assert_eq!(update_congestion(&mut tcb, dup), CongestionAction::None);
        assert_eq!(update_congestion(&mut tcb, dup), CongestionAction::None);
        assert_eq!(update_congestion(&mut tcb, dup), CongestionAction::FastRetransmit);
        assert_eq!(tcb.ssthresh, 4000);
        assert_eq!(tcb.cwnd, 4000);

        on_retransmission_timeout(&mut tcb);
        assert_eq!(tcb.cwnd, 1000);
    }

    #[test]
    fn sack_blocks_merge_and_cap() {
        let mut tcb = TcpControlBlock::new_client(test_key(), 0, 0);
        tcb.add_sack_block(1000, 1100);
        tcb.add_sack_block(2000, 2100);
        // Adjacent-overlapping range merges with the first block.
        tcb.add_sack_block(1100, 1200);
        assert_eq!(tcb.sack_blocks[0], SackBlock { start: 1000, end: 1200 });
        assert_eq!(tcb.sack_blocks.len(), 2);

        tcb.add_sack_block(3000, 3100);
        tcb.add_sack_block(4000, 4100);
        tcb.add_sack_block(5000, 5100);
        assert_eq!(tcb.sack_blocks.len(), TCP_MAX_SACK_BLOCKS);

        // Cumulative ACK overtakes the oldest ranges.
        tcb.rcv_nxt = 3100;
        tcb.prune_sack_blocks();
        assert!(tcb.sack_blocks.iter().all(|b| seq_gt(b.end, 3100)));
    }

    #[test]
    fn send_window_respects_cwnd_and_peer() {
        let mut tcb = TcpControlBlock::new_client(test_key(), 0, 0);
        tcb.snd_mss = 1000;
        tcb.snd_una = 0;
        tcb.snd_nxt = 2000;
        tcb.snd_wnd = 10_000;
        tcb.cwnd = 5000;
        assert_eq!(tcb.send_window_available(), 3000);

        tcb.cwnd = 10_000;
        tcb.snd_wnd = 4000;
        assert_eq!(tcb.send_window_available(), 2000);
    }
}
