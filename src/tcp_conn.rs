//! TCP connection state machine.
//!
//! Drives the RFC 793 automaton over the control blocks defined in `tcp`:
//! passive and active open, the three-way handshake, data transfer with
//! the sliding window, graceful and simultaneous close, and the 2MSL
//! TIME_WAIT hold. Four timers serve each connection — retransmission
//! (exponential backoff, bounded retries), delayed ACK, keepalive, and
//! the linger timer that ends TIME_WAIT.
//!
//! Timer handlers never hold a reference to the connection: they capture
//! only the 4-tuple key and re-look the connection up when they fire, so
//! a handler racing teardown finds nothing and returns. Teardown cancels
//! all four timers before the connection structure is dropped from the
//! table.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::buffer::{HeadroomClass, Packet};
use crate::icmp::IcmpErrorKind;
use crate::ipv4::{self, Ipv4Addr, Ipv4Header};
use crate::netif::NetIf;
use crate::stack::{net_stack, DropReason, NetStack, RxVerdict};
use crate::tcp::*;
use crate::timer::NetTimer;
use crate::NetError;

/// Maximum pending reset notifications retained for the socket layer.
const MAX_PENDING_ERRORS: usize = 64;

/// First ephemeral port.
const EPHEMERAL_BASE: u16 = 49152;

static EPHEMERAL_NEXT: AtomicU32 = AtomicU32::new(EPHEMERAL_BASE as u32);

// ============================================================================
// Connection and Table
// ============================================================================

/// The four per-connection timers. Handles are kept so teardown can cancel
/// them; the timers themselves only know the connection key.
#[derive(Default)]
struct ConnTimers {
    retransmit: Option<Arc<NetTimer>>,
    delayed_ack: Option<Arc<NetTimer>>,
    keepalive: Option<Arc<NetTimer>>,
    linger: Option<Arc<NetTimer>>,
}

impl ConnTimers {
    /// Cancel every armed timer. Must run before the connection structure
    /// is dropped; a fired-but-unclaimed handler then finds the table
    /// entry gone and returns without touching freed state.
    fn cancel_all(&mut self) {
        for timer in [
            self.retransmit.take(),
            self.delayed_ack.take(),
            self.keepalive.take(),
            self.linger.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
    }
}

/// One TCP connection.
pub struct TcpConn {
    pub tcb: TcpControlBlock,
    timers: ConnTimers,
    /// Key of the listener that spawned this connection, if passive.
    listen_port: Option<u16>,
}

impl TcpConn {
    fn new(tcb: TcpControlBlock) -> Self {
        TcpConn {
            tcb,
            timers: ConnTimers::default(),
            listen_port: None,
        }
    }
}

/// A passive-open listener.
struct Listener {
    backlog: usize,
    /// Connections that completed the handshake, awaiting accept().
    accept_queue: VecDeque<TcpConnKey>,
}

/// The connection table plus listeners and pending error notifications.
pub struct TcpTable {
    conns: Mutex<BTreeMap<TcpConnKey, TcpConn>>,
    listeners: Mutex<BTreeMap<u16, Listener>>,
    /// Reset/unreachable notifications for connections already torn down,
    /// consumed by the socket layer.
    pending_errors: Mutex<VecDeque<(TcpConnKey, TcpError)>>,
    pub stats: TcpStats,
}

impl TcpTable {
    pub const fn new() -> Self {
        TcpTable {
            conns: Mutex::new(BTreeMap::new()),
            listeners: Mutex::new(BTreeMap::new()),
            pending_errors: Mutex::new(VecDeque::new()),
            stats: TcpStats::new(),
        }
    }

    /// State of a connection, if it still exists.
    pub fn state_of(&self, key: &TcpConnKey) -> Option<TcpState> {
        self.conns.lock().get(key).map(|c| c.tcb.state)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }

    /// True when no connections exist.
    pub fn is_empty(&self) -> bool {
        self.conns.lock().is_empty()
    }

    /// Take the oldest pending error notification, if any.
    pub fn take_error(&self) -> Option<(TcpConnKey, TcpError)> {
        self.pending_errors.lock().pop_front()
    }

    fn record_error(&self, key: TcpConnKey, err: TcpError) {
        let mut errors = self.pending_errors.lock();
        if errors.len() >= MAX_PENDING_ERRORS {
            errors.pop_front();
        }
        errors.push_back((key, err));
    }
}

impl Default for TcpTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove a connection, cancelling its timers first. The only teardown
/// path — every caller goes through here so the cancel-before-drop
/// invariant holds everywhere.
fn remove_conn(conns: &mut BTreeMap<TcpConnKey, TcpConn>, key: &TcpConnKey) {
    if let Some(mut conn) = conns.remove(key) {
        conn.timers.cancel_all();
        log::trace!("tcp: removed connection {:?}", key);
    }
}

// ============================================================================
// Segment Output
// ============================================================================

/// Build and transmit one segment for a connection.
fn send_segment(
    stack: &NetStack,
    tcb: &TcpControlBlock,
    seq: u32,
    flags: u8,
    payload: &[u8],
    options: &TcpOptionsOut<'_>,
    now: u64,
) -> Result<(), NetError> {
    let ack = if flags & TCP_FLAG_ACK != 0 { tcb.rcv_nxt } else { 0 };
    let segment = build_tcp_segment(
        tcb.key.local_ip,
        tcb.key.remote_ip,
        tcb.key.local_port,
        tcb.key.remote_port,
        seq,
        ack,
        flags,
        tcb.advertised_window(),
        options,
        payload,
    );

    let mut pkt = Packet::alloc(segment.len(), HeadroomClass::Transport);
    pkt.append(&segment).map_err(|_| NetError::NoBufferSpace)?;
    ipv4::send(stack, tcb.key.remote_ip, TCP_PROTO, pkt, now)?;
    stack.tcp.stats.tx_segments.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Options for an ACK-bearing segment: SACK blocks when negotiated,
/// timestamp echo when negotiated.
fn ack_options(tcb: &TcpControlBlock, now: u64) -> TcpOptionsOut<'_> {
    TcpOptionsOut {
        mss: None,
        sack_permitted: false,
        sack_blocks: if tcb.sack_enabled { &tcb.sack_blocks } else { &[] },
        timestamps: tcb.ts_enabled.then_some((now as u32, tcb.ts_recent)),
    }
}

/// Send a bare ACK for the current receive state.
fn send_ack(stack: &NetStack, tcb: &mut TcpControlBlock, now: u64) {
    let opts = ack_options(tcb, now);
    let _ = send_segment(stack, tcb, tcb.snd_nxt, TCP_FLAG_ACK, &[], &opts, now);
    tcb.ack_pending = false;
    tcb.segments_since_ack = 0;
}

/// Send a RST answering a segment that has no connection (RFC 793
/// reset generation rules).
fn send_rst_for(
    stack: &NetStack,
    ip_hdr: &Ipv4Header,
    hdr: &TcpHeader,
    data_len: usize,
    now: u64,
) {
    let (seq, ack, flags) = if hdr.is_ack() {
        (hdr.ack_num, 0, TCP_FLAG_RST)
    } else {
        let mut seg_len = data_len as u32;
        if hdr.is_syn() {
            seg_len = seg_len.wrapping_add(1);
        }
        if hdr.is_fin() {
            seg_len = seg_len.wrapping_add(1);
        }
        (0, hdr.seq_num.wrapping_add(seg_len), TCP_FLAG_RST | TCP_FLAG_ACK)
    };

    let segment = build_tcp_segment(
        ip_hdr.dst,
        ip_hdr.src,
        hdr.dst_port,
        hdr.src_port,
        seq,
        ack,
        flags,
        0,
        &TcpOptionsOut::none(),
        &[],
    );
    let mut pkt = Packet::alloc(segment.len(), HeadroomClass::Transport);
    if pkt.append(&segment).is_ok() {
        let _ = ipv4::send(stack, ip_hdr.src, TCP_PROTO, pkt, now);
    }
}

// ============================================================================
// Timer Arming
// ============================================================================

fn arm_retransmit(stack: &NetStack, conn: &mut TcpConn, now: u64) {
    if let Some(t) = conn.timers.retransmit.take() {
        t.cancel();
    }
    let key = conn.tcb.key;
    conn.timers.retransmit = Some(stack.timers.insert(
        now,
        conn.tcb.rto_ticks,
        Box::new(move || on_retransmit_timer(key)),
    ));
}

fn cancel_retransmit(conn: &mut TcpConn) {
    if let Some(t) = conn.timers.retransmit.take() {
        t.cancel();
    }
}

fn arm_delayed_ack(stack: &NetStack, conn: &mut TcpConn, now: u64) {
    if conn
        .timers
        .delayed_ack
        .as_ref()
        .map_or(false, |t| !t.is_cancelled())
    {
        return;
    }
    let key = conn.tcb.key;
    conn.timers.delayed_ack = Some(stack.timers.insert(
        now,
        TCP_DELAYED_ACK_TICKS,
        Box::new(move || on_delayed_ack_timer(key)),
    ));
}

fn arm_keepalive(stack: &NetStack, conn: &mut TcpConn, now: u64, delay: u64) {
    if let Some(t) = conn.timers.keepalive.take() {
        t.cancel();
    }
    let key = conn.tcb.key;
    conn.timers.keepalive = Some(stack.timers.insert(
        now,
        delay,
        Box::new(move || on_keepalive_timer(key)),
    ));
}

/// Move to TIME_WAIT: everything but the linger timer is cancelled, and
/// the linger timer reclaims the connection after 2MSL (bounded by the
/// user-timeout ceiling).
fn enter_time_wait(stack: &NetStack, conn: &mut TcpConn, now: u64) {
    conn.tcb.state = TcpState::TimeWait;
    conn.tcb.time_wait_start = now;

    if let Some(t) = conn.timers.retransmit.take() {
        t.cancel();
    }
    if let Some(t) = conn.timers.delayed_ack.take() {
        t.cancel();
    }
    if let Some(t) = conn.timers.keepalive.take() {
        t.cancel();
    }
    if let Some(t) = conn.timers.linger.take() {
        t.cancel();
    }

    let key = conn.tcb.key;
    let hold = core::cmp::min(TCP_TIME_WAIT_TICKS, TCP_USER_TIMEOUT_TICKS);
    conn.timers.linger = Some(stack.timers.insert(
        now,
        hold,
        Box::new(move || on_linger_timer(key)),
    ));
}

// ============================================================================
// Timer Handlers
// ============================================================================

/// Retransmission timeout: resend the oldest unacknowledged segment with
/// exponential backoff; give up and reset the connection after
/// [`TCP_MAX_RETRIES`] attempts.
fn on_retransmit_timer(key: TcpConnKey) {
    let Some(stack) = net_stack() else { return };
    let now = stack.now();

    let mut conns = stack.tcp.conns.lock();
    let Some(conn) = conns.get_mut(&key) else { return };

    conn.tcb.retries = conn.tcb.retries.saturating_add(1);
    if conn.tcb.retries > TCP_MAX_RETRIES {
        stack.tcp.record_error(key, TcpError::Timeout);
        stack.tcp.stats.connections_reset.fetch_add(1, Ordering::Relaxed);
        remove_conn(&mut conns, &key);
        return;
    }

    on_retransmission_timeout(&mut conn.tcb);
    // Exponential backoff, capped.
    conn.tcb.rto_ticks = (conn.tcb.rto_ticks * 2).min(TCP_MAX_RTO_TICKS);

    match conn.tcb.state {
        TcpState::SynSent => {
            let opts = syn_options(&conn.tcb, now);
            let _ = send_segment(stack, &conn.tcb, conn.tcb.iss, TCP_FLAG_SYN, &[], &opts, now);
        }
        TcpState::SynReceived => {
            let opts = syn_options(&conn.tcb, now);
            let _ = send_segment(
                stack,
                &conn.tcb,
                conn.tcb.iss,
                TCP_FLAG_SYN | TCP_FLAG_ACK,
                &[],
                &opts,
                now,
            );
        }
        _ => retransmit_front(stack, conn, now),
    }
    stack.tcp.stats.retransmissions.fetch_add(1, Ordering::Relaxed);
    arm_retransmit(stack, conn, now);
}

/// Resend the first segment in the send buffer (RTO or fast retransmit).
fn retransmit_front(stack: &NetStack, conn: &mut TcpConn, now: u64) {
    let Some(front) = conn.tcb.send_buffer.front_mut() else {
        // Nothing buffered: a lone FIN may still be outstanding.
        if conn.tcb.fin_sent && seq_lt(conn.tcb.snd_una, conn.tcb.snd_nxt) {
            let seq = conn.tcb.snd_nxt.wrapping_sub(1);
            let opts = ack_options(&conn.tcb, now);
            let _ = send_segment(
                stack,
                &conn.tcb,
                seq,
                TCP_FLAG_FIN | TCP_FLAG_ACK,
                &[],
                &opts,
                now,
            );
        }
        return;
    };

    front.retrans_count = front.retrans_count.saturating_add(1);
    front.sent_at = now;
    let seq = front.seq;
    let fin = front.fin;
    let data = front.data.clone();

    let mut flags = TCP_FLAG_ACK;
    if fin {
        flags |= TCP_FLAG_FIN;
    }
    let opts = ack_options(&conn.tcb, now);
    let _ = send_segment(stack, &conn.tcb, seq, flags, &data, &opts, now);
}

/// Delayed-ACK timer: flush the pending acknowledgment.
fn on_delayed_ack_timer(key: TcpConnKey) {
    let Some(stack) = net_stack() else { return };
    let now = stack.now();

    let mut conns = stack.tcp.conns.lock();
    let Some(conn) = conns.get_mut(&key) else { return };
    conn.timers.delayed_ack = None;
    if conn.tcb.ack_pending {
        send_ack(stack, &mut conn.tcb, now);
    }
}

/// Keepalive timer: probe an idle established connection, abort after
/// too many unanswered probes.
fn on_keepalive_timer(key: TcpConnKey) {
    let Some(stack) = net_stack() else { return };
    let now = stack.now();

    let mut conns = stack.tcp.conns.lock();
    let Some(conn) = conns.get_mut(&key) else { return };
    conn.timers.keepalive = None;

    if conn.tcb.state != TcpState::Established {
        return;
    }

    let idle = now.saturating_sub(conn.tcb.last_activity);
    if idle < TCP_KEEPALIVE_IDLE_TICKS {
        // Activity since arming: push the probe out.
        let remaining = TCP_KEEPALIVE_IDLE_TICKS - idle;
        arm_keepalive(stack, conn, now, remaining);
        return;
    }

    conn.tcb.keepalive_probes = conn.tcb.keepalive_probes.saturating_add(1);
    if conn.tcb.keepalive_probes > TCP_KEEPALIVE_MAX_PROBES {
        stack.tcp.record_error(key, TcpError::Timeout);
        stack.tcp.stats.connections_reset.fetch_add(1, Ordering::Relaxed);
        remove_conn(&mut conns, &key);
        return;
    }

    // Probe: an ACK one byte below snd_nxt forces a fresh ACK from the
    // peer without carrying data.
    let seq = conn.tcb.snd_nxt.wrapping_sub(1);
    let opts = ack_options(&conn.tcb, now);
    let _ = send_segment(stack, &conn.tcb, seq, TCP_FLAG_ACK, &[], &opts, now);
    stack.tcp.stats.keepalive_probes.fetch_add(1, Ordering::Relaxed);
    arm_keepalive(stack, conn, now, TCP_KEEPALIVE_INTERVAL_TICKS);
}

/// Linger timer: the 2MSL wait is over, reclaim the connection.
fn on_linger_timer(key: TcpConnKey) {
    let Some(stack) = net_stack() else { return };
    let mut conns = stack.tcp.conns.lock();
    if let Some(conn) = conns.get(&key) {
        if conn.tcb.state == TcpState::TimeWait {
            remove_conn(&mut conns, &key);
        }
    }
}

// ============================================================================
// User API (socket layer entry points)
// ============================================================================

/// Options carried on our SYN and SYN-ACK segments.
fn syn_options(tcb: &TcpControlBlock, now: u64) -> TcpOptionsOut<'static> {
    TcpOptionsOut {
        mss: Some(tcb.rcv_mss),
        sack_permitted: true,
        sack_blocks: &[],
        timestamps: tcb.ts_enabled.then_some((now as u32, tcb.ts_recent)),
    }
}

/// Open a listening port.
pub fn listen(stack: &NetStack, port: u16, backlog: usize) -> TcpResult<()> {
    let mut listeners = stack.tcp.listeners.lock();
    if listeners.contains_key(&port) {
        return Err(TcpError::PortInUse);
    }
    listeners.insert(
        port,
        Listener {
            backlog: backlog.max(1),
            accept_queue: VecDeque::new(),
        },
    );
    Ok(())
}

/// Stop listening; established connections survive.
pub fn unlisten(stack: &NetStack, port: u16) {
    stack.tcp.listeners.lock().remove(&port);
}

/// Pop a connection that completed its handshake on a listening port.
pub fn accept(stack: &NetStack, port: u16) -> Option<TcpConnKey> {
    stack
        .tcp
        .listeners
        .lock()
        .get_mut(&port)?
        .accept_queue
        .pop_front()
}

fn alloc_ephemeral_port(conns: &BTreeMap<TcpConnKey, TcpConn>, local_ip: Ipv4Addr) -> u16 {
    loop {
        let raw = EPHEMERAL_NEXT.fetch_add(1, Ordering::Relaxed);
        let port = EPHEMERAL_BASE + (raw % (u16::MAX as u32 - EPHEMERAL_BASE as u32)) as u16;
        let in_use = conns
            .keys()
            .any(|k| k.local_ip == local_ip && k.local_port == port);
        if !in_use {
            return port;
        }
    }
}

/// Active open: allocate a connection, send the SYN, arm retransmission.
pub fn connect(
    stack: &NetStack,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    now: u64,
) -> Result<TcpConnKey, NetError> {
    let local_ip = stack.source_for(remote_ip).ok_or(NetError::NetworkUnreachable)?;

    let mut conns = stack.tcp.conns.lock();
    let local_port = alloc_ephemeral_port(&conns, local_ip);
    let key = TcpConnKey::new(local_ip, local_port, remote_ip, remote_port);
    if conns.contains_key(&key) {
        return Err(NetError::AddressInUse);
    }

    let iss = generate_isn(&key, now);
    let mut tcb = TcpControlBlock::new_client(key, iss, now);
    tcb.state = TcpState::SynSent;
    tcb.snd_nxt = iss.wrapping_add(1);

    let opts = syn_options(&tcb, now);
    send_segment(stack, &tcb, iss, TCP_FLAG_SYN, &[], &opts, now)?;

    let mut conn = TcpConn::new(tcb);
    arm_retransmit(stack, &mut conn, now);
    conns.insert(key, conn);
    Ok(key)
}

/// Queue and transmit data on an established connection. Returns the
/// number of bytes accepted (bounded by the send window).
pub fn send(stack: &NetStack, key: &TcpConnKey, data: &[u8], now: u64) -> TcpResult<usize> {
    let mut conns = stack.tcp.conns.lock();
    let conn = conns.get_mut(key).ok_or(TcpError::NotConnected)?;
    if !conn.tcb.state.can_send() {
        return Err(TcpError::InvalidState);
    }

    let window = conn.tcb.send_window_available() as usize;
    let accepted = data.len().min(window);
    if accepted == 0 {
        return Err(TcpError::WouldBlock);
    }

    let mss = conn.tcb.snd_mss as usize;
    let mut offset = 0;
    while offset < accepted {
        let chunk = (accepted - offset).min(mss);
        let seq = conn.tcb.snd_nxt;
        let payload = &data[offset..offset + chunk];

        let mut flags = TCP_FLAG_ACK;
        if offset + chunk == accepted {
            flags |= TCP_FLAG_PSH;
        }
        let opts = ack_options(&conn.tcb, now);
        send_segment(stack, &conn.tcb, seq, flags, payload, &opts, now)
            .map_err(|_| TcpError::WouldBlock)?;

        conn.tcb.send_buffer.push_back(TcpSegment {
            seq,
            data: payload.to_vec(),
            fin: false,
            sent_at: now,
            retrans_count: 0,
        });
        conn.tcb.snd_nxt = seq.wrapping_add(chunk as u32);
        offset += chunk;
    }

    conn.tcb.last_activity = now;
    arm_retransmit(stack, conn, now);
    Ok(accepted)
}

/// Drain up to `max` bytes of in-order received data.
pub fn recv(stack: &NetStack, key: &TcpConnKey, max: usize) -> TcpResult<Vec<u8>> {
    let mut conns = stack.tcp.conns.lock();
    let conn = conns.get_mut(key).ok_or(TcpError::NotConnected)?;
    let take = conn.tcb.recv_buffer.len().min(max);
    Ok(conn.tcb.recv_buffer.drain(..take).collect())
}

/// Graceful close: send FIN and walk the closing states.
pub fn close(stack: &NetStack, key: &TcpConnKey, now: u64) -> TcpResult<()> {
    let mut conns = stack.tcp.conns.lock();
    let conn = conns.get_mut(key).ok_or(TcpError::NotConnected)?;

    match conn.tcb.state {
        TcpState::SynSent | TcpState::SynReceived => {
            remove_conn(&mut conns, key);
            Ok(())
        }
        TcpState::Established | TcpState::CloseWait => {
            let next = if conn.tcb.state == TcpState::Established {
                TcpState::FinWait1
            } else {
                TcpState::LastAck
            };
            send_fin(stack, conn, now);
            conn.tcb.state = next;
            arm_retransmit(stack, conn, now);
            Ok(())
        }
        _ => Err(TcpError::InvalidState),
    }
}

/// Abortive close: RST to the peer, connection reclaimed immediately.
pub fn abort(stack: &NetStack, key: &TcpConnKey, now: u64) -> TcpResult<()> {
    let mut conns = stack.tcp.conns.lock();
    let conn = conns.get_mut(key).ok_or(TcpError::NotConnected)?;

    if conn.tcb.state.is_synchronized() {
        let _ = send_segment(
            stack,
            &conn.tcb,
            conn.tcb.snd_nxt,
            TCP_FLAG_RST | TCP_FLAG_ACK,
            &[],
            &TcpOptionsOut::none(),
            now,
        );
    }
    stack.tcp.stats.connections_reset.fetch_add(1, Ordering::Relaxed);
    remove_conn(&mut conns, key);
    Ok(())
}

fn send_fin(stack: &NetStack, conn: &mut TcpConn, now: u64) {
    let seq = conn.tcb.snd_nxt;
    let opts = ack_options(&conn.tcb, now);
    let _ = send_segment(
        stack,
        &conn.tcb,
        seq,
        TCP_FLAG_FIN | TCP_FLAG_ACK,
        &[],
        &opts,
        now,
    );
    conn.tcb.send_buffer.push_back(TcpSegment {
        seq,
        data: Vec::new(),
        fin: true,
        sent_at: now,
        retrans_count: 0,
    });
    conn.tcb.snd_nxt = seq.wrapping_add(1);
    conn.tcb.fin_sent = true;
}

// ============================================================================
// ICMP Error Channel
// ============================================================================

/// An ICMP error quoting one of our segments: refuse a connection still
/// in SYN_SENT, surface the notification otherwise.
pub fn error(stack: &NetStack, kind: IcmpErrorKind, orig_hdr: &Ipv4Header, orig_l4: &[u8], _now: u64) {
    if orig_l4.len() < 4 {
        return;
    }
    let local_port = u16::from_be_bytes([orig_l4[0], orig_l4[1]]);
    let remote_port = u16::from_be_bytes([orig_l4[2], orig_l4[3]]);
    let key = TcpConnKey::new(orig_hdr.src, local_port, orig_hdr.dst, remote_port);

    let hard = matches!(
        kind,
        IcmpErrorKind::PortUnreachable | IcmpErrorKind::ProtoUnreachable
    );

    let mut conns = stack.tcp.conns.lock();
    if let Some(conn) = conns.get(&key) {
        if conn.tcb.state == TcpState::SynSent || hard {
            stack.tcp.record_error(key, TcpError::ConnectionReset);
            stack.tcp.stats.connections_reset.fetch_add(1, Ordering::Relaxed);
            remove_conn(&mut conns, &key);
        }
    }
}

// ============================================================================
// Receive Path
// ============================================================================

/// Process an inbound TCP segment.
pub fn receive(
    stack: &NetStack,
    _iface: &Arc<NetIf>,
    ip_hdr: &Ipv4Header,
    payload: &[u8],
    is_broadcast_dst: bool,
    now: u64,
) -> RxVerdict {
    stack.tcp.stats.rx_segments.fetch_add(1, Ordering::Relaxed);

    // TCP over broadcast is never valid; answering would amplify.
    if is_broadcast_dst || ip_hdr.dst.is_multicast() {
        stack.tcp.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
        return RxVerdict::Dropped(DropReason::Tcp(TcpError::InvalidState));
    }

    let hdr = match parse_tcp_header(payload) {
        Ok(hdr) => hdr,
        Err(e) => {
            stack.tcp.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
            return RxVerdict::Dropped(DropReason::Tcp(e));
        }
    };
    if !verify_tcp_checksum(ip_hdr.src, ip_hdr.dst, payload) {
        stack.tcp.stats.checksum_errors.fetch_add(1, Ordering::Relaxed);
        return RxVerdict::Dropped(DropReason::Tcp(TcpError::BadChecksum));
    }

    let options = parse_tcp_options(payload, &hdr);
    let data = &payload[hdr.header_len()..];
    let key = TcpConnKey::new(ip_hdr.dst, hdr.dst_port, ip_hdr.src, hdr.src_port);

    let mut conns = stack.tcp.conns.lock();
    if conns.contains_key(&key) {
        process_segment(stack, &mut conns, key, &hdr, &options, data, now);
        return RxVerdict::Delivered;
    }
    drop(conns);

    // No connection: a SYN may open one via a listener; anything else
    // (except RST) earns a reset.
    if hdr.is_syn() && !hdr.is_ack() {
        return passive_open(stack, ip_hdr, &hdr, &options, now);
    }
    if !hdr.is_rst() {
        send_rst_for(stack, ip_hdr, &hdr, data.len(), now);
    }
    stack.tcp.stats.rx_dropped.fetch_add(1, Ordering::Relaxed);
    RxVerdict::Dropped(DropReason::Tcp(TcpError::NotConnected))
}

/// LISTEN + SYN: create the server-side connection and answer SYN-ACK.
fn passive_open(
    stack: &NetStack,
    ip_hdr: &Ipv4Header,
    hdr: &TcpHeader,
    options: &TcpOptions,
    now: u64,
) -> RxVerdict {
    {
        let listeners = stack.tcp.listeners.lock();
        let Some(listener) = listeners.get(&hdr.dst_port) else {
            drop(listeners);
            send_rst_for(stack, ip_hdr, hdr, 0, now);
            return RxVerdict::Dropped(DropReason::NoListener);
        };
        if listener.accept_queue.len() >= listener.backlog {
            // Backlog full: drop the SYN, the client will retransmit.
            return RxVerdict::Dropped(DropReason::InboxFull);
        }
    }

    let key = TcpConnKey::new(ip_hdr.dst, hdr.dst_port, ip_hdr.src, hdr.src_port);
    let iss = generate_isn(&key, now);
    let mut tcb = TcpControlBlock::new_server(key, iss, hdr.seq_num, now);
    tcb.snd_nxt = iss.wrapping_add(1);
    tcb.snd_wnd = hdr.window as u32;
    apply_syn_options(&mut tcb, options);

    let opts = syn_options(&tcb, now);
    let _ = send_segment(stack, &tcb, iss, TCP_FLAG_SYN | TCP_FLAG_ACK, &[], &opts, now);

    let mut conn = TcpConn::new(tcb);
    conn.listen_port = Some(hdr.dst_port);
    arm_retransmit(stack, &mut conn, now);
    stack.tcp.conns.lock().insert(key, conn);
    RxVerdict::Delivered
}

/// Adopt the peer's handshake options.
fn apply_syn_options(tcb: &mut TcpControlBlock, options: &TcpOptions) {
    if let Some(mss) = options.mss {
        tcb.snd_mss = mss.min(TCP_ETHERNET_MSS).max(64);
    }
    tcb.sack_enabled = options.sack_permitted;
    if let Some((ts_val, _)) = options.timestamps {
        tcb.ts_enabled = true;
        tcb.ts_recent = ts_val;
    }
}

/// Drive one segment through the automaton for an existing connection.
fn process_segment(
    stack: &NetStack,
    conns: &mut BTreeMap<TcpConnKey, TcpConn>,
    key: TcpConnKey,
    hdr: &TcpHeader,
    options: &TcpOptions,
    data: &[u8],
    now: u64,
) {
    let conn = conns.get_mut(&key).expect("caller checked presence");
    conn.tcb.last_activity = now;
    conn.tcb.keepalive_probes = 0;
    if let Some((ts_val, _)) = options.timestamps {
        if conn.tcb.ts_enabled {
            conn.tcb.ts_recent = ts_val;
        }
    }

    match conn.tcb.state {
        TcpState::SynSent => handle_syn_sent(stack, conns, key, hdr, options, now),
        _ => handle_synchronized(stack, conns, key, hdr, data, now),
    }
}

/// SYN_SENT: waiting for the SYN-ACK of our active open.
fn handle_syn_sent(
    stack: &NetStack,
    conns: &mut BTreeMap<TcpConnKey, TcpConn>,
    key: TcpConnKey,
    hdr: &TcpHeader,
    options: &TcpOptions,
    now: u64,
) {
    let conn = conns.get_mut(&key).expect("caller checked presence");
    let tcb = &mut conn.tcb;

    if hdr.is_ack() {
        // The ACK must cover our SYN exactly.
        if !(seq_gt(hdr.ack_num, tcb.iss) && seq_le(hdr.ack_num, tcb.snd_nxt)) {
            if !hdr.is_rst() {
                let seq = hdr.ack_num;
                let _ = send_segment(
                    stack,
                    tcb,
                    seq,
                    TCP_FLAG_RST,
                    &[],
                    &TcpOptionsOut::none(),
                    now,
                );
            }
            return;
        }
    }

    if hdr.is_rst() {
        if hdr.is_ack() {
            // Connection refused.
            stack.tcp.record_error(key, TcpError::ConnectionReset);
            stack.tcp.stats.connections_reset.fetch_add(1, Ordering::Relaxed);
            remove_conn(conns, &key);
        }
        return;
    }

    if !hdr.is_syn() {
        return;
    }

    tcb.irs = hdr.seq_num;
    tcb.rcv_nxt = hdr.seq_num.wrapping_add(1);
    tcb.snd_wnd = hdr.window as u32;
    tcb.snd_wl1 = hdr.seq_num;
    tcb.snd_wl2 = hdr.ack_num;
    apply_syn_options(tcb, options);

    if hdr.is_ack() {
        // Three-way handshake completes: SYN-ACK received, send the ACK.
        tcb.snd_una = hdr.ack_num;
        tcb.state = TcpState::Established;
        cancel_retransmit(conn);
        send_ack(stack, &mut conn.tcb, now);
        stack
            .tcp
            .stats
            .connections_established
            .fetch_add(1, Ordering::Relaxed);
        arm_keepalive(stack, conn, now, TCP_KEEPALIVE_IDLE_TICKS);
    } else {
        // Simultaneous open.
        tcb.state = TcpState::SynReceived;
        let opts = syn_options(tcb, now);
        let iss = tcb.iss;
        let _ = send_segment(
            stack,
            &conn.tcb,
            iss,
            TCP_FLAG_SYN | TCP_FLAG_ACK,
            &[],
            &opts,
            now,
        );
    }
}

/// All states past SYN_SENT share sequence validation, RST/ACK/data/FIN
/// handling (RFC 793 section 3.9, "SEGMENT ARRIVES").
fn handle_synchronized(
    stack: &NetStack,
    conns: &mut BTreeMap<TcpConnKey, TcpConn>,
    key: TcpConnKey,
    hdr: &TcpHeader,
    data: &[u8],
    now: u64,
) {
    let conn = conns.get_mut(&key).expect("caller checked presence");

    // --- Sequence acceptability (RFC 793 section 3.3) -----------------
    let seg_len = data.len() as u32
        + if hdr.is_syn() { 1 } else { 0 }
        + if hdr.is_fin() { 1 } else { 0 };
    let rcv_nxt = conn.tcb.rcv_nxt;
    let rcv_wnd = conn.tcb.advertised_window() as u32;
    let acceptable = if seg_len == 0 {
        if rcv_wnd == 0 {
            hdr.seq_num == rcv_nxt
        } else {
            seq_in_window(hdr.seq_num, rcv_nxt, rcv_wnd)
        }
    } else if rcv_wnd == 0 {
        false
    } else {
        // Segment start or end in window, or a retransmission straddling
        // the left edge.
        seq_in_window(hdr.seq_num, rcv_nxt, rcv_wnd)
            || seq_in_window(hdr.seq_num.wrapping_add(seg_len - 1), rcv_nxt, rcv_wnd)
            || (seq_lt(hdr.seq_num, rcv_nxt)
                && seq_gt(hdr.seq_num.wrapping_add(seg_len), rcv_nxt))
    };
    if !acceptable && !hdr.is_rst() {
        // Old or far-future segment: re-ACK our state and drop.
        send_ack(stack, &mut conn.tcb, now);
        return;
    }

    // --- RST ----------------------------------------------------------
    if hdr.is_rst() {
        stack.tcp.record_error(key, TcpError::ConnectionReset);
        stack.tcp.stats.connections_reset.fetch_add(1, Ordering::Relaxed);
        remove_conn(conns, &key);
        return;
    }

    // --- SYN in a synchronized state ----------------------------------
    if hdr.is_syn() && conn.tcb.state != TcpState::SynReceived {
        let seq = conn.tcb.snd_nxt;
        let _ = send_segment(
            stack,
            &conn.tcb,
            seq,
            TCP_FLAG_RST | TCP_FLAG_ACK,
            &[],
            &TcpOptionsOut::none(),
            now,
        );
        stack.tcp.record_error(key, TcpError::ConnectionReset);
        stack.tcp.stats.connections_reset.fetch_add(1, Ordering::Relaxed);
        remove_conn(conns, &key);
        return;
    }

    if !hdr.is_ack() {
        return;
    }

    // --- ACK processing -----------------------------------------------
    if conn.tcb.state == TcpState::SynReceived {
        if seq_gt(hdr.ack_num, conn.tcb.snd_una) && seq_le(hdr.ack_num, conn.tcb.snd_nxt) {
            conn.tcb.snd_una = hdr.ack_num;
            conn.tcb.snd_wnd = hdr.window as u32;
            conn.tcb.state = TcpState::Established;
            cancel_retransmit(conn);
            stack
                .tcp
                .stats
                .connections_established
                .fetch_add(1, Ordering::Relaxed);
            arm_keepalive(stack, conn, now, TCP_KEEPALIVE_IDLE_TICKS);

            // Passive opens become visible to accept() now.
            if let Some(port) = conn.listen_port {
                let mut listeners = stack.tcp.listeners.lock();
                if let Some(listener) = listeners.get_mut(&port) {
                    if listener.accept_queue.len() < listener.backlog {
                        listener.accept_queue.push_back(key);
                    }
                }
            }
        } else {
            send_rst_for_conn(stack, &conn.tcb, hdr.ack_num, now);
            return;
        }
    } else if seq_le(hdr.ack_num, conn.tcb.snd_nxt) {
        let update = handle_ack(&mut conn.tcb, hdr.ack_num, now);

        // Window update (RFC 793 SND.WL1/WL2 rules).
        if seq_lt(conn.tcb.snd_wl1, hdr.seq_num)
            || (conn.tcb.snd_wl1 == hdr.seq_num && seq_le(conn.tcb.snd_wl2, hdr.ack_num))
        {
            conn.tcb.snd_wnd = hdr.window as u32;
            conn.tcb.snd_wl1 = hdr.seq_num;
            conn.tcb.snd_wl2 = hdr.ack_num;
        }

        if update.newly_acked > 0 {
            if conn.tcb.snd_una == conn.tcb.snd_nxt {
                cancel_retransmit(conn);
            } else {
                arm_retransmit(stack, conn, now);
            }
        }
        if update_congestion(&mut conn.tcb, update) == CongestionAction::FastRetransmit {
            retransmit_front(stack, conn, now);
            stack.tcp.stats.retransmissions.fetch_add(1, Ordering::Relaxed);
        }

        // Close-side transitions once our FIN is acknowledged.
        let fin_acked = conn.tcb.fin_sent && conn.tcb.snd_una == conn.tcb.snd_nxt;
        match conn.tcb.state {
            TcpState::FinWait1 if fin_acked => {
                conn.tcb.state = TcpState::FinWait2;
            }
            TcpState::Closing if fin_acked => {
                enter_time_wait(stack, conn, now);
            }
            TcpState::LastAck if fin_acked => {
                remove_conn(conns, &key);
                return;
            }
            _ => {}
        }
    }

    let conn = conns.get_mut(&key).expect("still present");

    // --- Payload ------------------------------------------------------
    if !data.is_empty() && conn.tcb.state.can_receive() {
        accept_data(stack, conn, hdr, data, now);
    }

    // --- FIN ----------------------------------------------------------
    let fin_seq = hdr.seq_num.wrapping_add(data.len() as u32);
    if hdr.is_fin() && conn.tcb.rcv_nxt == fin_seq {
        conn.tcb.rcv_nxt = fin_seq.wrapping_add(1);
        conn.tcb.fin_received = true;
        send_ack(stack, &mut conn.tcb, now);

        match conn.tcb.state {
            TcpState::Established => conn.tcb.state = TcpState::CloseWait,
            TcpState::FinWait1 => {
                let fin_acked = conn.tcb.fin_sent && conn.tcb.snd_una == conn.tcb.snd_nxt;
                if fin_acked {
                    enter_time_wait(stack, conn, now);
                } else {
                    conn.tcb.state = TcpState::Closing;
                }
            }
            TcpState::FinWait2 => enter_time_wait(stack, conn, now),
            _ => {}
        }
    } else if conn.tcb.state == TcpState::TimeWait {
        // Any retransmitted peer segment in TIME_WAIT is re-ACKed and the
        // 2MSL clock restarts.
        send_ack(stack, &mut conn.tcb, now);
        enter_time_wait(stack, conn, now);
    }
}

/// RST with an explicit sequence number for a half-open mismatch.
fn send_rst_for_conn(stack: &NetStack, tcb: &TcpControlBlock, seq: u32, now: u64) {
    let _ = send_segment(stack, tcb, seq, TCP_FLAG_RST, &[], &TcpOptionsOut::none(), now);
}

/// In-order data goes to the receive buffer; out-of-order data to the
/// bounded reorder queue with a SACK block and an immediate duplicate ACK.
fn accept_data(stack: &NetStack, conn: &mut TcpConn, hdr: &TcpHeader, data: &[u8], now: u64) {
    let tcb = &mut conn.tcb;

    if hdr.seq_num == tcb.rcv_nxt {
        let room = TCP_RECV_BUFFER_CAP.saturating_sub(tcb.recv_buffer.len());
        let take = data.len().min(room);
        tcb.recv_buffer.extend(&data[..take]);
        tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(take as u32);

        if take == data.len() {
            merge_ooo(stack, tcb);
        }
        tcb.prune_sack_blocks();

        // Delayed ACK: every second in-order segment is ACKed at once,
        // the rest ride the short timer.
        tcb.segments_since_ack = tcb.segments_since_ack.saturating_add(1);
        if tcb.segments_since_ack >= 2 {
            send_ack(stack, tcb, now);
            if let Some(t) = conn.timers.delayed_ack.take() {
                t.cancel();
            }
        } else {
            tcb.ack_pending = true;
            arm_delayed_ack(stack, conn, now);
        }
    } else if seq_gt(hdr.seq_num, tcb.rcv_nxt) {
        // Out of order: hold it if the bounded queue has room.
        stack.tcp.stats.out_of_order.fetch_add(1, Ordering::Relaxed);
        if tcb.ooo_queue.len() < TCP_MAX_OOO_SEGMENTS {
            let overlaps = tcb.ooo_queue.iter().any(|seg| {
                seq_lt(hdr.seq_num, seg.end_seq()) && seq_lt(seg.seq, hdr.seq_num.wrapping_add(data.len() as u32))
            });
            if !overlaps {
                let insert_at = tcb
                    .ooo_queue
                    .iter()
                    .position(|seg| seq_gt(seg.seq, hdr.seq_num))
                    .unwrap_or(tcb.ooo_queue.len());
                tcb.ooo_queue.insert(
                    insert_at,
                    TcpSegment {
                        seq: hdr.seq_num,
                        data: data.to_vec(),
                        fin: false,
                        sent_at: now,
                        retrans_count: 0,
                    },
                );
                tcb.add_sack_block(hdr.seq_num, hdr.seq_num.wrapping_add(data.len() as u32));
            }
        }
        // Duplicate ACK tells the peer what we still expect (with SACK).
        send_ack(stack, tcb, now);
    } else {
        // Entirely old data: re-ACK.
        send_ack(stack, tcb, now);
    }
}

/// Pull now-contiguous segments out of the reorder queue.
fn merge_ooo(_stack: &NetStack, tcb: &mut TcpControlBlock) {
    loop {
        let Some(front) = tcb.ooo_queue.front() else { break };
        if seq_gt(front.seq, tcb.rcv_nxt) {
            break;
        }
        let seg = tcb.ooo_queue.pop_front().expect("front just checked");
        if seq_ge(tcb.rcv_nxt, seg.end_seq()) {
            continue; // fully duplicate
        }
        let skip = tcb.rcv_nxt.wrapping_sub(seg.seq) as usize;
        let fresh = &seg.data[skip..];
        let room = TCP_RECV_BUFFER_CAP.saturating_sub(tcb.recv_buffer.len());
        let take = fresh.len().min(room);
        tcb.recv_buffer.extend(&fresh[..take]);
        tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(take as u32);
        if take < fresh.len() {
            break;
        }
    }
    tcb.prune_sack_blocks();
}

// ============================================================================
// Maintenance
// ============================================================================

/// Periodic sweep: force-close connections stalled in a closing state
/// beyond the user-timeout ceiling. The retransmission and linger timers
/// handle everything faster than this backstop.
pub fn maintenance(stack: &NetStack, now: u64) {
    let mut conns = stack.tcp.conns.lock();
    let stalled: Vec<TcpConnKey> = conns
        .iter()
        .filter(|(_, conn)| {
            matches!(
                conn.tcb.state,
                TcpState::FinWait1
                    | TcpState::FinWait2
                    | TcpState::Closing
                    | TcpState::LastAck
                    | TcpState::TimeWait
            ) && now.saturating_sub(conn.tcb.last_activity) > TCP_USER_TIMEOUT_TICKS
        })
        .map(|(key, _)| *key)
        .collect();

    for key in stalled {
        stack.tcp.record_error(key, TcpError::Timeout);
        remove_conn(&mut conns, &key);
    }
}
