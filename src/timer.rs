//! Network timer subsystem.
//!
//! Timers are cancellable deferred callbacks held on a global list and
//! driven by a periodic tick from a dedicated background task. The scan
//! releases the list lock before invoking a handler, so handlers may
//! themselves arm or cancel timers without lock-ordering hazards.
//!
//! # Lifecycle
//!
//! A timer is **active** until its expiry passes or it is cancelled. Firing
//! marks it cancelled and consumes the handler; the handler runs at most
//! once, enforced by taking it out of an `Option`. A timer becomes
//! **reclaimable** once it is cancelled and no caller holds a handle, and
//! only the tick scan removes it from the list — a path still holding an
//! `Arc` can never observe a freed timer.
//!
//! Re-arming a fired or cancelled timer is not possible; callers allocate a
//! new one (connection code does exactly this when rescheduling).

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Deferred callback invoked by the timer task after expiry.
pub type TimerHandler = Box<dyn FnOnce() + Send>;

// ============================================================================
// NetTimer
// ============================================================================

/// A single cancellable timer.
///
/// Shared via `Arc`: the global [`TimerList`] holds one reference and the
/// owning subsystem usually holds another for cancellation.
pub struct NetTimer {
    /// Absolute expiry in monotonic ticks.
    expires_at: u64,
    /// Set when the timer fires or is cancelled; a set flag means the
    /// handler will never run (again).
    cancelled: AtomicBool,
    /// The handler, consumed on first fire.
    handler: Mutex<Option<TimerHandler>>,
}

impl NetTimer {
    fn new(expires_at: u64, handler: TimerHandler) -> Self {
        NetTimer {
            expires_at,
            cancelled: AtomicBool::new(false),
            handler: Mutex::new(Some(handler)),
        }
    }

    /// Absolute expiry tick.
    #[inline]
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// True once the timer fired or was cancelled.
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Cancel the timer. Idempotent, never blocks, and safe to call from
    /// any task holding a reference; a racing scan that has not yet claimed
    /// the handler will find nothing to run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.handler.lock().take();
    }

    /// Atomically claim the right to fire. Returns the handler only to the
    /// single caller that wins the race against `cancel` and other scans.
    fn claim(&self) -> Option<TimerHandler> {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        self.handler.lock().take()
    }
}

impl core::fmt::Debug for NetTimer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetTimer")
            .field("expires_at", &self.expires_at)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// TimerList
// ============================================================================

/// The global timer list, scanned by the timer task on every tick period.
pub struct TimerList {
    timers: Mutex<Vec<Arc<NetTimer>>>,
}

impl TimerList {
    pub const fn new() -> Self {
        TimerList {
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Arm a timer expiring `delay` ticks after `now` and return a handle
    /// for cancellation.
    pub fn insert(&self, now: u64, delay: u64, handler: TimerHandler) -> Arc<NetTimer> {
        let timer = Arc::new(NetTimer::new(now.saturating_add(delay), handler));
        self.timers.lock().push(timer.clone());
        timer
    }

    /// Fire-and-forget variant: arm a timer without returning a handle.
    /// The list reclaims it after it fires.
    pub fn insert_oneshot(&self, now: u64, delay: u64, handler: TimerHandler) {
        let timer = Arc::new(NetTimer::new(now.saturating_add(delay), handler));
        self.timers.lock().push(timer);
    }

    /// Number of timers currently on the list (including reclaimable ones
    /// awaiting the next scan).
    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    /// True if no timers are on the list.
    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }

    /// Scan the list: run every due, uncancelled handler (with the list
    /// lock released), then reclaim entries that are cancelled and
    /// externally unreferenced. Returns the number of handlers invoked.
    ///
    /// Firing order across distinct timers follows scan order, not expiry
    /// order; callers must not rely on relative ordering of unrelated
    /// timers that expire in the same period.
    pub fn tick(&self, now: u64) -> usize {
        let due: Vec<Arc<NetTimer>> = {
            let timers = self.timers.lock();
            timers
                .iter()
                .filter(|t| !t.is_cancelled() && t.expires_at <= now)
                .cloned()
                .collect()
        };

        let mut fired = 0;
        for timer in due {
            if let Some(handler) = timer.claim() {
                handler();
                fired += 1;
            }
        }

        // Reclamation pass: only the scan frees list entries, and only once
        // no other path can still be holding the timer.
        self.timers
            .lock()
            .retain(|t| !(t.is_cancelled() && Arc::strong_count(t) == 1));

        fired
    }
}

impl Default for TimerList {
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
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn timer_fires_once_after_expiry() {
        let list = TimerList::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        list.insert(0, 10, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(list.tick(5), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert_eq!(list.tick(10), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Already fired: later scans must not invoke it again.
        assert_eq!(list.tick(20), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let list = TimerList::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        let timer = list.insert(0, 10, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        timer.cancel();
        timer.cancel(); // idempotent

        assert_eq!(list.tick(100), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn referenced_timer_is_not_reclaimed() {
        let list = TimerList::new();
        let timer = list.insert(0, 1, Box::new(|| {}));

        list.tick(5);
        // The external handle keeps it alive on the list.
        assert_eq!(list.len(), 1);
        assert!(timer.is_cancelled());

        drop(timer);
        list.tick(6);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn oneshot_is_reclaimed_after_firing() {
        let list = TimerList::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        list.insert_oneshot(0, 2, Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(list.tick(2), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn handler_may_arm_another_timer() {
        // The scan drops the list lock before invoking handlers, so a
        // handler can insert into the same list without deadlock.
        static LIST: TimerList = TimerList::new();
        let hits = Arc::new(AtomicU32::new(0));

        let h = hits.clone();
        LIST.insert_oneshot(0, 1, Box::new(move || {
            let h2 = h.clone();
            LIST.insert_oneshot(1, 1, Box::new(move || {
                h2.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        LIST.tick(1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        LIST.tick(2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn claim_wins_over_exactly_one_caller() {
        let list = TimerList::new();
        let timer = list.insert(0, 0, Box::new(|| {}));

        // Simulate the cancel-vs-scan race: whichever side claims first,
        // the handler runs at most once.
        let first = timer.claim();
        timer.cancel();
        let second = timer.claim();

        assert!(first.is_some());
        assert!(second.is_none());
    }
}
