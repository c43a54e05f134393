//! Stack context and glue.
//!
//! [`NetStack`] owns every shared structure in the protocol engine — the
//! interface registry, routing table, ARP cache, fragment cache, timer
//! list, protocol dispatch tables, UDP port table, and TCP connection
//! table — each behind its own lock. Entry points take a `&NetStack`
//! handle rather than reaching for ambient globals; the one global
//! accessor, [`net_stack`], exists for timer handlers and drivers that
//! cannot carry the reference.
//!
//! `network_init` builds the singleton once at boot, registers the
//! loopback pseudo-device and its route, and populates the read-only
//! protocol tables. `tick` is the periodic maintenance entry the timer
//! task drives: timer scan, fragment expiry (with ICMP notification),
//! ARP cache expiry, and the TCP user-timeout sweep.

use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::arp::{ArpCache, ArpError, ArpStats};
use crate::fragment::{FragmentCache, FragmentDropReason};
use crate::icmp::{self, IcmpError, IcmpState};
use crate::ipv4::{Ipv4Addr, Ipv4Error};
use crate::netif::NetIfRegistry;
use crate::proto::ProtocolTable;
use crate::route::RouteTable;
use crate::tcp::TcpError;
use crate::tcp_conn::{self, TcpTable};
use crate::timer::TimerList;
use crate::udp::{UdpError, UdpPortTable, UdpStats};
use crate::{loopback, TICKS_PER_SEC};

/// Ticks between fragment/ARP/TCP maintenance sweeps (one second).
const MAINTENANCE_INTERVAL_TICKS: u64 = TICKS_PER_SEC;

// ============================================================================
// Receive Verdicts
// ============================================================================

/// Outcome of pushing one frame through the receive path.
#[derive(Debug)]
pub enum RxVerdict {
    /// The packet reached its consumer (or was legitimately absorbed).
    Delivered,
    /// The packet was dropped; the reason is recorded in statistics too.
    Dropped(DropReason),
}

impl RxVerdict {
    pub fn is_delivered(&self) -> bool {
        matches!(self, RxVerdict::Delivered)
    }
}

/// Why the receive path dropped a packet.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Frame arrived for an interface index that is not attached.
    NoSuchInterface,
    /// Frame shorter than the link header.
    ShortFrame,
    /// EtherType the stack does not handle.
    UnknownEtherType,
    /// Unicast destination that is not ours (not an error).
    NotForUs,
    /// IP protocol without a dispatch entry.
    UnsupportedProtocol,
    /// Response suppressed by the rate limiter.
    RateLimited,
    /// Buffer allocation failed.
    NoBuffer,
    /// No bound port / listener for the destination.
    NoListener,
    /// A bounded delivery queue was full.
    InboxFull,
    Ipv4(Ipv4Error),
    Icmp(IcmpError),
    Arp(ArpError),
    Udp(UdpError),
    Tcp(TcpError),
    Fragment(FragmentDropReason),
}

// ============================================================================
// Statistics
// ============================================================================

/// Stack-wide receive statistics (per-protocol counters live with their
/// protocols).
#[derive(Debug, Default)]
pub struct NetStats {
    pub ipv4_rx: AtomicU64,
    pub rx_errors: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub unknown_ethertype: AtomicU64,
    pub unsupported_proto: AtomicU64,
    pub fragments_rx: AtomicU64,
    pub fragments_reassembled: AtomicU64,
    pub fragments_dropped: AtomicU64,
}

impl NetStats {
    pub const fn new() -> Self {
        NetStats {
            ipv4_rx: AtomicU64::new(0),
            rx_errors: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            unknown_ethertype: AtomicU64::new(0),
            unsupported_proto: AtomicU64::new(0),
            fragments_rx: AtomicU64::new(0),
            fragments_reassembled: AtomicU64::new(0),
            fragments_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_ipv4_rx(&self) {
        self.ipv4_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rx_errors(&self) {
        self.rx_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unknown_ethertype(&self) {
        self.unknown_ethertype.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unsupported_proto(&self) {
        self.unsupported_proto.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fragments_rx(&self) {
        self.fragments_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fragments_reassembled(&self) {
        self.fragments_reassembled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_fragments_dropped(&self) {
        self.fragments_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// NetStack
// ============================================================================

/// The protocol engine's shared state, one lock per structure.
pub struct NetStack {
    pub interfaces: NetIfRegistry,
    pub routes: RouteTable,
    pub arp: Mutex<ArpCache>,
    pub arp_stats: ArpStats,
    pub fragments: FragmentCache,
    pub timers: TimerList,
    pub protocols: ProtocolTable,
    pub udp_ports: UdpPortTable,
    pub udp_stats: UdpStats,
    pub tcp: TcpTable,
    pub icmp: IcmpState,
    pub stats: NetStats,
    /// Monotonic tick counter, advanced by [`NetStack::tick`]; timer
    /// handlers read it for their notion of "now".
    ticks: AtomicU64,
    last_maintenance: AtomicU64,
    /// External address-configuration client (DHCP), invoked for the
    /// first Ethernet interface attached with an empty routing table.
    addr_config_hook: Once<fn(usize)>,
}

impl NetStack {
    /// A fresh stack with empty tables and the default protocol domains.
    /// Production code goes through [`network_init`]; tests build their
    /// own instances.
    pub fn new() -> Self {
        NetStack {
            interfaces: NetIfRegistry::new(),
            routes: RouteTable::new(),
            arp: Mutex::new(ArpCache::with_defaults()),
            arp_stats: ArpStats::new(),
            fragments: FragmentCache::new(),
            timers: TimerList::new(),
            protocols: ProtocolTable::inet_default(),
            udp_ports: UdpPortTable::new(),
            udp_stats: UdpStats::new(),
            tcp: TcpTable::new(),
            icmp: IcmpState::new(),
            stats: NetStats::new(),
            ticks: AtomicU64::new(0),
            last_maintenance: AtomicU64::new(0),
            addr_config_hook: Once::new(),
        }
    }

    /// Current tick count, as of the last `tick` call.
    #[inline]
    pub fn now(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Source address for a destination, per the routing table.
    pub fn source_for(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        let route = self.routes.lookup(dst)?;
        let iface = self.interfaces.get_by_index(route.ifindex)?;
        match iface.ipv4_addr() {
            Some(addr) => Some(addr),
            None if iface.is_loopback() => Some(Ipv4Addr::LOCALHOST),
            None => None,
        }
    }

    /// Register the external address-configuration client. First
    /// registration wins; later calls are ignored.
    pub fn set_addr_config_hook(&self, hook: fn(usize)) {
        self.addr_config_hook.call_once(|| hook);
    }

    /// Ask the external client to configure an interface.
    pub fn request_address_config(&self, ifindex: usize) {
        match self.addr_config_hook.get() {
            Some(hook) => hook(ifindex),
            None => log::debug!("stack: no address-configuration client for if {}", ifindex),
        }
    }

    /// Periodic maintenance, driven by the timer task: advance the clock,
    /// scan the timer list, and once a second expire fragments (notifying
    /// sources), purge the ARP cache, and sweep stalled TCP connections.
    pub fn tick(&self, now: u64) {
        self.ticks.store(now, Ordering::Relaxed);
        self.timers.tick(now);

        let last = self.last_maintenance.load(Ordering::Relaxed);
        if now.saturating_sub(last) < MAINTENANCE_INTERVAL_TICKS {
            return;
        }
        self.last_maintenance.store(now, Ordering::Relaxed);

        for expired in self.fragments.cleanup() {
            // Only a datagram whose first fragment arrived can be quoted
            // back at its source.
            if let Some(hdr) = expired.first_header {
                icmp::frag_expired(self, &hdr, &expired.payload_head, now);
            }
        }
        self.arp.lock().purge_expired(now);
        tcp_conn::maintenance(self, now);
    }
}

impl Default for NetStack {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Boot
// ============================================================================

static NET_STACK: Once<NetStack> = Once::new();

/// Build the global stack: protocol tables, loopback interface, loopback
/// route. Idempotent; returns the singleton.
pub fn network_init() -> &'static NetStack {
    NET_STACK.call_once(|| {
        let stack = NetStack::new();
        log::debug!("stack: network_init");
        stack
    });
    let stack = NET_STACK.get().expect("just initialized");

    // Loopback attaches outside call_once so the accessor already works
    // for anything attach touches; a second caller finds it attached.
    if stack.interfaces.get_by_name("lo").is_none() {
        let _ = loopback::attach(stack);
    }
    stack
}

/// The global stack, if `network_init` has run.
pub fn net_stack() -> Option<&'static NetStack> {
    NET_STACK.get()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use crate::buffer::{HeadroomClass, Packet};
    use crate::ethernet;
    use crate::icmp::{build_echo_request, parse_icmp, ICMP_TYPE_ECHO_REPLY};
    use crate::ipv4::{self, compute_checksum, Ipv4Proto};
    use crate::netif::{LinkDriver, NetIf, TxError};
    use crate::tcp::{TcpState, TCP_TIME_WAIT_TICKS};
    use crate::tcp_conn;
    use crate::{loopback, IPV4_HEADER_MIN_LEN};

    /// Every scenario test shares the boot-time singleton, as kernel
    /// tasks would; this lock keeps their loopback traffic from
    /// interleaving when the test harness runs them in parallel.
    static SCENARIO_LOCK: Mutex<()> = Mutex::new(());

    fn stack() -> &'static NetStack {
        network_init()
    }

    fn drain_loopback(stack: &NetStack, now: u64) {
        while loopback::poll(stack, now) > 0 {}
    }

    #[test]
    fn init_is_idempotent_and_registers_loopback() {
        let _guard = SCENARIO_LOCK.lock();
        let stack = stack();
        let again = network_init();
        assert_eq!(stack as *const _, again as *const _);

        let lo = stack.interfaces.get_by_name("lo").unwrap();
        assert!(lo.is_loopback());
        assert_eq!(lo.ipv4_addr(), Some(Ipv4Addr::LOCALHOST));
        assert!(stack.routes.lookup(Ipv4Addr::LOCALHOST).is_some());
    }

    #[test]
    fn loopback_echo_reflects_without_ethernet() {
        let _guard = SCENARIO_LOCK.lock();
        let stack = stack();
        let icmp_msg = build_echo_request(0x5151, 9, b"hello loopback");

        let mut pkt = Packet::alloc(icmp_msg.len(), HeadroomClass::Transport);
        pkt.append(&icmp_msg).unwrap();
        ipv4::send(stack, Ipv4Addr::LOCALHOST, Ipv4Proto::Icmp.to_raw(), pkt, 1).unwrap();

        // The reply sits on the loopback queue, already rewritten: no
        // physical interface was involved.
        let lo = stack.interfaces.get_by_name("lo").unwrap();
        let reply = lo.queue.dequeue().expect("echo reply queued");
        let (hdr, _, payload) = ipv4::parse_ipv4(reply.data()).unwrap();
        assert_eq!(hdr.src, Ipv4Addr::LOCALHOST);
        assert_eq!(hdr.dst, Ipv4Addr::LOCALHOST);
        assert_eq!(compute_checksum(payload, payload.len()), 0);

        let (icmp_hdr, body) = parse_icmp(payload).unwrap();
        assert_eq!(icmp_hdr.icmp_type, ICMP_TYPE_ECHO_REPLY);
        assert_eq!(icmp_hdr.id, 0x5151);
        assert_eq!(body, b"hello loopback");
    }

    #[test]
    fn udp_round_trip_over_loopback() {
        let _guard = SCENARIO_LOCK.lock();
        let stack = stack();
        let binding = stack.udp_ports.bind(4500).unwrap();

        crate::udp::send(stack, 4501, Ipv4Addr::LOCALHOST, 4500, b"datagram", 1).unwrap();
        drain_loopback(stack, 1);

        let datagram = binding.recv().expect("datagram delivered");
        assert_eq!(datagram.data, b"datagram");
        assert_eq!(datagram.src, Ipv4Addr::LOCALHOST);
        assert_eq!(datagram.src_port, 4501);
        stack.udp_ports.unbind(4500);
    }

    /// Captures transmitted frames instead of touching hardware.
    struct CaptureDriver {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl LinkDriver for CaptureDriver {
        fn transmit(&self, _iface: &NetIf, pkt: Packet) -> Result<(), TxError> {
            self.frames.lock().push(pkt.data().to_vec());
            Ok(())
        }
    }

    #[test]
    fn oversized_datagram_fragments_and_reassembles_in_any_order() {
        let _guard = SCENARIO_LOCK.lock();
        let stack = stack();

        // A small-MTU Ethernet device whose frames we capture.
        let frames = Arc::new(Mutex::new(Vec::new()));
        let iface = ethernet::attach(
            stack,
            Box::new(CaptureDriver { frames: frames.clone() }),
            [0x02, 0, 0, 0, 0, 0x10],
            600,
        )
        .unwrap();
        iface.set_ipv4_addr(Ipv4Addr::new(10, 9, 9, 1), Ipv4Addr::new(255, 255, 255, 0));
        stack.routes.add(
            Ipv4Addr::new(10, 9, 9, 0),
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(255, 255, 255, 0),
            crate::route::RouteFlags::UP,
            0,
            iface.index(),
        );
        stack
            .arp
            .lock()
            .add_static(Ipv4Addr::new(10, 9, 9, 5), ethernet::EthAddr([0x02, 0, 0, 0, 0, 0x20]), 0)
            .unwrap();

        // 4096 payload bytes exceed the 600-byte MTU several times over.
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        crate::udp::send(stack, 4601, Ipv4Addr::new(10, 9, 9, 5), 4600, &payload, 1).unwrap();

        let frames = frames.lock();
        assert!(frames.len() > 1, "datagram must have been fragmented");

        // Reassemble in reverse arrival order through a fresh cache.
        let cache = crate::fragment::FragmentCache::new();
        let mut reassembled = None;
        for frame in frames.iter().rev() {
            let (_eth, ip_bytes) = ethernet::parse_ethernet(frame).unwrap();
            let (hdr, _, frag_payload) = ipv4::parse_ipv4(ip_bytes).unwrap();
            assert!(hdr.is_fragment());
            if let Some(done) = cache.process(&hdr, frag_payload).unwrap() {
                reassembled = Some(done);
            }
        }

        let datagram = reassembled.expect("all fragments present");
        // The reassembled bytes are the UDP datagram we sent, intact.
        let udp = crate::udp::build_udp_datagram(
            Ipv4Addr::new(10, 9, 9, 1),
            Ipv4Addr::new(10, 9, 9, 5),
            4601,
            4600,
            &payload,
        );
        assert_eq!(datagram, udp);
        stack.routes.remove_all_for(iface.index());
    }

    #[test]
    fn tcp_handshake_establishes_both_ends() {
        let _guard = SCENARIO_LOCK.lock();
        let stack = stack();
        tcp_conn::listen(stack, 8080, 4).unwrap();

        // Active open: SYN goes out on loopback.
        let client = tcp_conn::connect(stack, Ipv4Addr::LOCALHOST, 8080, 10).unwrap();
        assert_eq!(stack.tcp.state_of(&client), Some(TcpState::SynSent));

        // SYN -> listener: server replies SYN-ACK.
        drain_loopback(stack, 11);
        // SYN-ACK -> client: client ACKs and establishes.
        // ACK -> server: server establishes.
        drain_loopback(stack, 12);
        drain_loopback(stack, 13);

        assert_eq!(stack.tcp.state_of(&client), Some(TcpState::Established));
        let server = tcp_conn::accept(stack, 8080).expect("accept queue filled");
        assert_eq!(stack.tcp.state_of(&server), Some(TcpState::Established));

        // Data flows client -> server.
        tcp_conn::send(stack, &client, b"request", 14).unwrap();
        drain_loopback(stack, 15);
        drain_loopback(stack, 16);
        let received = tcp_conn::recv(stack, &server, 64).unwrap();
        assert_eq!(received, b"request");

        // Cleanup.
        let _ = tcp_conn::abort(stack, &client, 17);
        drain_loopback(stack, 17);
        let _ = tcp_conn::abort(stack, &server, 18);
        tcp_conn::unlisten(stack, 8080);
    }

    #[test]
    fn tcp_close_walks_fin_wait_states_and_releases_after_2msl() {
        let _guard = SCENARIO_LOCK.lock();
        let stack = stack();
        tcp_conn::listen(stack, 8090, 4).unwrap();

        let client = tcp_conn::connect(stack, Ipv4Addr::LOCALHOST, 8090, 100).unwrap();
        drain_loopback(stack, 101);
        drain_loopback(stack, 102);
        drain_loopback(stack, 103);
        let server = tcp_conn::accept(stack, 8090).expect("established");

        // Local close: FIN_WAIT_1 until the FIN is ACKed.
        tcp_conn::close(stack, &client, 110).unwrap();
        assert_eq!(stack.tcp.state_of(&client), Some(TcpState::FinWait1));

        // Server ACKs the FIN and enters CLOSE_WAIT.
        drain_loopback(stack, 111);
        drain_loopback(stack, 112);
        assert_eq!(stack.tcp.state_of(&client), Some(TcpState::FinWait2));
        assert_eq!(stack.tcp.state_of(&server), Some(TcpState::CloseWait));

        // Server closes: LAST_ACK; its FIN moves the client to TIME_WAIT.
        tcp_conn::close(stack, &server, 113).unwrap();
        assert_eq!(stack.tcp.state_of(&server), Some(TcpState::LastAck));
        drain_loopback(stack, 114);
        drain_loopback(stack, 115);

        assert_eq!(stack.tcp.state_of(&client), Some(TcpState::TimeWait));
        // The final ACK released the server side entirely.
        assert_eq!(stack.tcp.state_of(&server), None);

        // The connection structure survives until the 2MSL linger fires.
        stack.tick(120);
        assert_eq!(stack.tcp.state_of(&client), Some(TcpState::TimeWait));

        stack.tick(115 + TCP_TIME_WAIT_TICKS + 1);
        assert_eq!(stack.tcp.state_of(&client), None);

        tcp_conn::unlisten(stack, 8090);
    }

    #[test]
    fn duplicate_echo_requests_get_one_reply() {
        let _guard = SCENARIO_LOCK.lock();
        let stack = stack();
        let lo = stack.interfaces.get_by_name("lo").unwrap();
        drain_loopback(stack, 1);

        let request = build_echo_request(0x6001, 1, b"dup");
        let ip_hdr = ipv4::Ipv4Header {
            version: 4,
            ihl: 5,
            dscp_ecn: 0,
            total_len: (IPV4_HEADER_MIN_LEN + request.len()) as u16,
            identification: 7,
            flags_fragment: 0,
            ttl: 64,
            protocol: Ipv4Proto::Icmp.to_raw(),
            checksum: 0,
            src: Ipv4Addr::LOCALHOST,
            dst: Ipv4Addr::LOCALHOST,
        };

        // The same request delivered twice (packet duplication) earns a
        // single reply.
        crate::icmp::receive(stack, &lo, &ip_hdr, &request, false, 2);
        crate::icmp::receive(stack, &lo, &ip_hdr, &request, false, 2);
        assert_eq!(lo.queue.len(), 1);

        // A new sequence number is answered again.
        let next = build_echo_request(0x6001, 2, b"dup");
        crate::icmp::receive(stack, &lo, &ip_hdr, &next, false, 3);
        assert_eq!(lo.queue.len(), 2);
        lo.queue.clear();
    }

    #[test]
    fn unknown_transport_is_counted() {
        let stack = stack();
        assert!(stack.protocols.find_input(89).is_none());
    }
}
