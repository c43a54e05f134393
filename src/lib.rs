//! In-kernel IPv4 network protocol stack.
//!
//! This crate provides the protocol engine of a kernel network subsystem:
//! - Packet buffers with per-layer headroom ([`buffer`])
//! - Cancellable network timers driven by a periodic tick ([`timer`])
//! - The network-interface abstraction with bounded queues ([`netif`])
//! - An ordered routing table with default-gateway fallback ([`route`])
//! - Protocol/domain dispatch tables ([`proto`])
//! - Ethernet framing and ARP resolution ([`ethernet`], [`arp`])
//! - IPv4 with fragmentation and reassembly ([`ipv4`], [`fragment`])
//! - ICMP control messages and error notifications ([`icmp`])
//! - UDP port demultiplexing ([`udp`])
//! - The TCP connection state machine with its four per-connection
//!   timers ([`tcp`], [`tcp_conn`])
//! - The loopback pseudo-device ([`loopback`])
//!
//! # Architecture
//!
//! ```text
//!   driver rx ---> ethernet ---> ipv4 ---> { icmp | udp | tcp }
//!                     |            ^            (socket layer above)
//!                    arp       fragment
//!                     |            |
//!   driver tx <--- netif <---- routing <--- { udp | tcp } send paths
//! ```
//!
//! The stack is driven from outside: device drivers call
//! [`ethernet::receive`], the socket layer calls the per-protocol send
//! entry points, and a timer task calls [`stack::NetStack::tick`] plus
//! [`loopback::poll`] on a short period. All shared state lives in the
//! [`stack::NetStack`] context built once by [`stack::network_init`].
//!
//! Time is a caller-supplied monotonic tick count; nothing in the crate
//! reads a clock.

#![no_std]

extern crate alloc;

pub mod arp;
pub mod buffer;
pub mod ethernet;
pub mod fragment;
pub mod icmp;
pub mod ipv4;
pub mod loopback;
pub mod netif;
pub mod proto;
pub mod route;
pub mod stack;
pub mod tcp;
pub mod tcp_conn;
pub mod timer;
pub mod udp;

pub use buffer::{HeadroomClass, Packet, PacketError};
pub use ethernet::{EthAddr, EthHeader};
pub use ipv4::{Ipv4Addr, Ipv4Proto};
pub use netif::{IfFlags, LinkDriver, MacAddress, NetIf, PacketQueue};
pub use route::{RouteEntry, RouteFlags, RouteTable};
pub use stack::{net_stack, network_init, NetStack, RxVerdict};
pub use tcp::{TcpConnKey, TcpState};
pub use timer::{NetTimer, TimerList};

// ============================================================================
// Shared Constants
// ============================================================================

/// Monotonic ticks per second; all timeouts in the crate are derived
/// from this rate.
pub const TICKS_PER_SEC: u64 = 100;

/// Ethernet II header size (6 dst + 6 src + 2 ethertype).
pub const ETH_HEADER_LEN: usize = 14;

/// Minimum IPv4 header length (IHL == 5).
pub const IPV4_HEADER_MIN_LEN: usize = 20;

/// Maximum TCP header length (with full options).
pub const TCP_HEADER_MAX_LEN: usize = 60;

/// Default Ethernet MTU.
pub const DEFAULT_MTU: usize = 1500;

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced to callers of the stack's send paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// No route matches the destination.
    NetworkUnreachable,
    /// The next hop's link address could not be resolved.
    HostUnreachable,
    /// Buffer space (headroom/tailroom) exhausted.
    NoBufferSpace,
    /// A bounded queue was full; the packet was dropped.
    QueueFull,
    /// The outbound interface is down.
    InterfaceDown,
    /// The device rejected the packet.
    IoError,
    /// The request cannot be satisfied as given.
    InvalidArgument,
    /// The local address/port tuple is taken.
    AddressInUse,
}
