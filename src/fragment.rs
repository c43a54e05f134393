//! IPv4 fragment reassembly.
//!
//! Fragments are accumulated per datagram, identified by
//! `(src, dst, protocol, identification)`, into a bounded reassembly queue
//! with RFC 815 hole tracking. Overlapping fragments discard the whole
//! datagram (RFC 5722). Each queue carries a time-to-live counter
//! decremented by the periodic cleanup pass; when it reaches zero the
//! partial reassembly is discarded and the source is notified.
//!
//! # References
//! - RFC 791: Internet Protocol (fragmentation)
//! - RFC 815: IP Datagram Reassembly Algorithms
//! - RFC 5722: Handling of Overlapping IPv4 Fragments

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::ipv4::Ipv4Header;

// ============================================================================
// Configuration Limits
// ============================================================================

/// Reassembly time-to-live in cleanup passes. The stack sweeps the cache
/// once per second of ticks, so a fresh datagram has about a minute to
/// complete.
pub const FRAG_TTL: u32 = 60;

/// Maximum reassembled packet size (IPv4 total-length ceiling).
pub const MAX_PACKET_SIZE: usize = 65_535;

/// Maximum fragments buffered for one datagram.
pub const MAX_FRAGS_PER_DATAGRAM: usize = 64;

/// Maximum concurrently reassembling datagrams. Bounds the memory an
/// attacker can pin with never-completed fragment sets.
pub const MAX_DATAGRAMS: usize = 256;

/// Bytes of the first fragment quoted back in an ICMP time-exceeded
/// notification (IP payload head, per the RFC 792 convention).
const QUOTED_PAYLOAD_BYTES: usize = 8;

// ============================================================================
// Drop Reasons
// ============================================================================

/// Reason a fragment was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentDropReason {
    /// Fragment end would exceed the maximum packet size.
    TooLarge,
    /// Datagram already holds the maximum fragment count.
    FragLimit,
    /// The datagram table is full.
    TableFull,
    /// Fragment overlaps buffered data (RFC 5722: datagram discarded).
    Overlap,
    /// Exact duplicate of a buffered fragment (datagram discarded).
    Duplicate,
    /// Zero-length fragment.
    ZeroLength,
}

// ============================================================================
// Statistics
// ============================================================================

/// Fragment reassembly statistics.
#[derive(Debug, Default)]
pub struct FragmentStats {
    pub received: AtomicU64,
    pub reassembled: AtomicU64,
    pub timeout_drops: AtomicU64,
    pub overlap_drops: AtomicU64,
    pub limit_drops: AtomicU64,
    pub active_datagrams: AtomicU32,
}

impl FragmentStats {
    pub const fn new() -> Self {
        FragmentStats {
            received: AtomicU64::new(0),
            reassembled: AtomicU64::new(0),
            timeout_drops: AtomicU64::new(0),
            overlap_drops: AtomicU64::new(0),
            limit_drops: AtomicU64::new(0),
            active_datagrams: AtomicU32::new(0),
        }
    }
}

// ============================================================================
// Fragment Key
// ============================================================================

/// Reassembly queue identity per RFC 791.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentKey {
    pub src: [u8; 4],
    pub dst: [u8; 4],
    pub protocol: u8,
    pub identification: u16,
}

impl FragmentKey {
    pub fn from_header(hdr: &Ipv4Header) -> Self {
        FragmentKey {
            src: hdr.src.octets(),
            dst: hdr.dst.octets(),
            protocol: hdr.protocol,
            identification: hdr.identification,
        }
    }
}

// ============================================================================
// Hole Tracking (RFC 815)
// ============================================================================

/// A gap `[start, end)` still to be filled.
#[derive(Debug, Clone, Copy)]
struct FragmentHole {
    start: u16,
    end: u16,
}

// ============================================================================
// Fragment Queue
// ============================================================================

/// A datagram discarded by the cleanup pass, with the material needed for
/// an ICMP reassembly-time-exceeded notification.
#[derive(Debug)]
pub struct ExpiredDatagram {
    /// Header of the first fragment seen, if it arrived.
    pub first_header: Option<Ipv4Header>,
    /// Head of the first fragment's payload (up to 8 bytes).
    pub payload_head: Vec<u8>,
}

/// One in-progress reassembly.
struct FragmentQueue {
    /// Remaining cleanup passes before the datagram is discarded.
    ttl: u32,
    /// Total length, known once the last fragment (MF=0) arrives.
    total_len: Option<u16>,
    received_frags: usize,
    holes: Vec<FragmentHole>,
    /// Fragment data keyed by byte offset.
    frags: BTreeMap<u16, Vec<u8>>,
    have_first: bool,
    have_last: bool,
    /// Header and payload head of the first fragment, for notifications.
    first_header: Option<Ipv4Header>,
    payload_head: Vec<u8>,
}

impl FragmentQueue {
    fn new() -> Self {
        FragmentQueue {
            ttl: FRAG_TTL,
            total_len: None,
            received_frags: 0,
            holes: alloc::vec![FragmentHole { start: 0, end: u16::MAX }],
            frags: BTreeMap::new(),
            have_first: false,
            have_last: false,
            first_header: None,
            payload_head: Vec::new(),
        }
    }

    /// Insert a fragment; `Ok(true)` means the datagram is now complete.
    fn insert(
        &mut self,
        hdr: &Ipv4Header,
        offset: u16,
        more_fragments: bool,
        data: &[u8],
    ) -> Result<bool, FragmentDropReason> {
        let len = data.len() as u16;
        if len == 0 {
            return Err(FragmentDropReason::ZeroLength);
        }
        if self.received_frags >= MAX_FRAGS_PER_DATAGRAM {
            return Err(FragmentDropReason::FragLimit);
        }

        let frag_start = offset;
        let frag_end = offset.checked_add(len).ok_or(FragmentDropReason::TooLarge)?;
        if frag_end as usize > MAX_PACKET_SIZE {
            return Err(FragmentDropReason::TooLarge);
        }

        let is_last = !more_fragments;
        if is_last {
            // A shrunk total length after data beyond it was buffered is an
            // inconsistent datagram; treat as overlap and discard.
            for (&stored_off, stored) in &self.frags {
                if stored_off.saturating_add(stored.len() as u16) > frag_end {
                    return Err(FragmentDropReason::Overlap);
                }
            }
        }
        let max_end = if is_last {
            frag_end
        } else {
            self.total_len.unwrap_or(u16::MAX)
        };

        // Overlap check against neighbours (RFC 5722: reject, caller
        // discards the datagram).
        if let Some((&prev_off, prev)) = self.frags.range(..=frag_start).next_back() {
            if prev_off.saturating_add(prev.len() as u16) > frag_start {
                return Err(FragmentDropReason::Overlap);
            }
        }
        if let Some((&next_off, _)) = self.frags.range(frag_start..).next() {
            if next_off < frag_end {
                return Err(FragmentDropReason::Overlap);
            }
        }

        // RFC 815 hole bookkeeping: the fragment must land inside a hole.
        let mut new_holes = Vec::with_capacity(self.holes.len() + 1);
        let mut covered = false;
        for hole in self.holes.drain(..) {
            if hole.start >= max_end {
                continue;
            }
            let hole_end = hole.end.min(max_end);

            if frag_end <= hole.start || frag_start >= hole_end {
                new_holes.push(FragmentHole { start: hole.start, end: hole_end });
                continue;
            }
            if frag_start < hole.start || frag_end > hole_end {
                return Err(FragmentDropReason::Overlap);
            }
            covered = true;
            if hole.start < frag_start {
                new_holes.push(FragmentHole { start: hole.start, end: frag_start });
            }
            if frag_end < hole_end {
                new_holes.push(FragmentHole { start: frag_end, end: hole_end });
            }
        }
        if !covered {
            return Err(FragmentDropReason::Duplicate);
        }

        // Validation passed; commit.
        if offset == 0 {
            self.have_first = true;
            self.first_header = Some(*hdr);
            let head = core::cmp::min(data.len(), QUOTED_PAYLOAD_BYTES);
            self.payload_head = data[..head].to_vec();
        }
        if is_last {
            self.have_last = true;
            self.total_len = Some(frag_end);
        }

        new_holes.sort_by_key(|h| h.start);
        self.holes = new_holes;
        self.frags.insert(offset, data.to_vec());
        self.received_frags += 1;

        // The TTL is not refreshed on arrival: trickled fragments cannot
        // keep a queue alive indefinitely.
        Ok(self.is_complete())
    }

    fn is_complete(&self) -> bool {
        self.have_first && self.have_last && self.holes.is_empty()
    }

    fn reassemble(&self) -> Option<Vec<u8>> {
        if !self.is_complete() {
            return None;
        }
        let total = self.total_len? as usize;
        let mut buf = alloc::vec![0u8; total];
        for (&off, frag) in &self.frags {
            let start = off as usize;
            let end = start + frag.len();
            if end > total {
                return None;
            }
            buf[start..end].copy_from_slice(frag);
        }
        Some(buf)
    }
}

// ============================================================================
// Fragment Cache
// ============================================================================

/// The reassembly cache: all in-progress datagrams.
pub struct FragmentCache {
    queues: Mutex<BTreeMap<FragmentKey, FragmentQueue>>,
    pub stats: FragmentStats,
}

impl FragmentCache {
    pub const fn new() -> Self {
        FragmentCache {
            queues: Mutex::new(BTreeMap::new()),
            stats: FragmentStats::new(),
        }
    }

    /// Feed one fragment into the cache.
    ///
    /// Returns `Ok(Some(payload))` when the datagram completed,
    /// `Ok(None)` while more fragments are needed, and the drop reason
    /// otherwise.
    pub fn process(
        &self,
        hdr: &Ipv4Header,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, FragmentDropReason> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        let key = FragmentKey::from_header(hdr);
        let offset = hdr.fragment_offset() * 8;
        let more = hdr.more_fragments();

        let mut queues = self.queues.lock();

        let created = !queues.contains_key(&key);
        if created {
            if queues.len() >= MAX_DATAGRAMS {
                self.stats.limit_drops.fetch_add(1, Ordering::Relaxed);
                return Err(FragmentDropReason::TableFull);
            }
            queues.insert(key, FragmentQueue::new());
            self.stats.active_datagrams.fetch_add(1, Ordering::Relaxed);
        }

        let queue = queues.get_mut(&key).expect("queue just inserted");
        match queue.insert(hdr, offset, more, payload) {
            Ok(true) => {
                let result = queue.reassemble();
                queues.remove(&key);
                self.stats.active_datagrams.fetch_sub(1, Ordering::Relaxed);
                self.stats.reassembled.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Ok(false) => Ok(None),
            Err(reason) => {
                // Overlap and duplicate discard the whole datagram; an
                // empty just-created queue is likewise not kept around.
                let discard = matches!(
                    reason,
                    FragmentDropReason::Overlap | FragmentDropReason::Duplicate
                ) || (created && queue.received_frags == 0);
                if discard {
                    queues.remove(&key);
                    self.stats.active_datagrams.fetch_sub(1, Ordering::Relaxed);
                }
                match reason {
                    FragmentDropReason::Overlap | FragmentDropReason::Duplicate => {
                        self.stats.overlap_drops.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {
                        self.stats.limit_drops.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(reason)
            }
        }
    }

    /// Decrement every queue's TTL and discard the expired ones.
    ///
    /// Returns the discarded datagrams so the caller can send ICMP
    /// reassembly-time-exceeded notifications (only possible when the
    /// first fragment was seen).
    pub fn cleanup(&self) -> Vec<ExpiredDatagram> {
        let mut queues = self.queues.lock();
        let mut expired = Vec::new();

        let expired_keys: Vec<FragmentKey> = queues
            .iter_mut()
            .filter_map(|(key, queue)| {
                queue.ttl = queue.ttl.saturating_sub(1);
                (queue.ttl == 0).then_some(*key)
            })
            .collect();

        for key in expired_keys {
            if let Some(queue) = queues.remove(&key) {
                self.stats.timeout_drops.fetch_add(1, Ordering::Relaxed);
                self.stats.active_datagrams.fetch_sub(1, Ordering::Relaxed);
                expired.push(ExpiredDatagram {
                    first_header: queue.first_header,
                    payload_head: queue.payload_head,
                });
            }
        }
        expired
    }

    /// Number of datagrams currently reassembling.
    pub fn active(&self) -> usize {
        self.queues.lock().len()
    }
}

impl Default for FragmentCache {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipv4::Ipv4Addr;

    fn frag_header(id: u16, offset_units: u16, mf: bool) -> Ipv4Header {
        Ipv4Header {
            version: 4,
            ihl: 5,
            dscp_ecn: 0,
            total_len: 0,
            identification: id,
            flags_fragment: if mf { 0x2000 | offset_units } else { offset_units },
            ttl: 64,
            protocol: 17,
            checksum: 0,
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
        }
    }

    #[test]
    fn in_order_reassembly() {
        let cache = FragmentCache::new();

        let first = cache.process(&frag_header(7, 0, true), &[1u8; 16]).unwrap();
        assert!(first.is_none());

        let done = cache.process(&frag_header(7, 2, false), &[2u8; 16]).unwrap();
        let payload = done.unwrap();
        assert_eq!(payload.len(), 32);
        assert_eq!(&payload[..16], &[1u8; 16]);
        assert_eq!(&payload[16..], &[2u8; 16]);
        assert_eq!(cache.active(), 0);
    }

    #[test]
    fn out_of_order_reassembly_is_byte_identical() {
        let cache = FragmentCache::new();
        let original: Vec<u8> = (0u8..48).collect();

        // Arrival order: last, first, middle.
        assert!(cache
            .process(&frag_header(9, 4, false), &original[32..])
            .unwrap()
            .is_none());
        assert!(cache
            .process(&frag_header(9, 0, true), &original[..16])
            .unwrap()
            .is_none());
        let done = cache.process(&frag_header(9, 2, true), &original[16..32]).unwrap();

        assert_eq!(done.unwrap(), original);
    }

    #[test]
    fn overlap_discards_whole_datagram() {
        let cache = FragmentCache::new();
        cache.process(&frag_header(3, 0, true), &[1u8; 16]).unwrap();

        // Offset 8 overlaps [0, 16).
        let err = cache.process(&frag_header(3, 1, true), &[2u8; 16]).unwrap_err();
        assert_eq!(err, FragmentDropReason::Overlap);
        assert_eq!(cache.active(), 0);
    }

    #[test]
    fn ttl_expiry_discards_and_reports() {
        let cache = FragmentCache::new();
        cache.process(&frag_header(5, 0, true), &[7u8; 16]).unwrap();
        assert_eq!(cache.active(), 1);

        let mut expired = Vec::new();
        for _ in 0..FRAG_TTL {
            expired = cache.cleanup();
        }
        assert_eq!(expired.len(), 1);
        assert_eq!(cache.active(), 0);

        let gone = &expired[0];
        assert!(gone.first_header.is_some());
        assert_eq!(gone.payload_head, &[7u8; 8]);
        assert_eq!(cache.stats.timeout_drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn datagram_table_is_bounded() {
        let cache = FragmentCache::new();
        for id in 0..MAX_DATAGRAMS as u16 {
            cache.process(&frag_header(id, 0, true), &[0u8; 8]).unwrap();
        }
        let err = cache
            .process(&frag_header(MAX_DATAGRAMS as u16, 0, true), &[0u8; 8])
            .unwrap_err();
        assert_eq!(err, FragmentDropReason::TableFull);
        assert_eq!(cache.active(), MAX_DATAGRAMS);
    }

    #[test]
    fn per_datagram_fragment_cap() {
        let cache = FragmentCache::new();
        // 8-byte fragments at consecutive offsets, never finishing.
        for i in 0..MAX_FRAGS_PER_DATAGRAM as u16 {
            cache.process(&frag_header(1, i, true), &[0u8; 8]).unwrap();
        }
        let err = cache
            .process(&frag_header(1, MAX_FRAGS_PER_DATAGRAM as u16, true), &[0u8; 8])
            .unwrap_err();
        assert_eq!(err, FragmentDropReason::FragLimit);
    }
}
