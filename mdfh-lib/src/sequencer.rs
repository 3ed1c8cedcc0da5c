//! Sliding-window sequence classification.
//!
//! Every decoded record's sequence number is classified as in-order,
//! duplicate, or out-of-order against a window of recently seen numbers. A
//! hole in front of the retirement cursor is a gap; late arrivals drain it,
//! and the gap timer retires it when it stays open past the timeout.
//!
//! Single-writer discipline: only the ingress thread calls [`Sequencer::observe`]
//! and mutates the window. The timer thread writes exactly one flag
//! ([`Sequencer::trigger_timeout`]); observers take relaxed [`Stats`]
//! snapshots.

use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicU8,
    Ordering::{Acquire, Relaxed, Release},
};
use std::time::Instant;

use serde::Serialize;
use tracing::debug;

use crate::{Error, Result};

/// Default window capacity, in sequence numbers. Must be a power of two.
pub const DEFAULT_WINDOW: usize = 1 << 23;

/// How [`Sequencer::observe`] classified a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    InOrder,
    Duplicate,
    OutOfOrder,
}

/// Best-effort counter snapshot; see [`Sequencer::stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub parsed: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub lost: u64,
    pub next_seq: u32,
    pub highest_seq: u32,
}

/// Window state and counters, cache-line aligned so the hot fields never
/// false-share with neighboring allocations.
#[repr(align(64))]
pub struct Sequencer {
    /// Smallest sequence number not yet retired. 0 doubles as the pristine
    /// marker; the first observation seeds the window origin.
    next_seq: AtomicU32,
    /// Largest sequence number ever observed.
    highest_seq: AtomicU32,
    gap_exists: AtomicBool,
    /// Raised by the timer thread, consumed by the ingress thread at the
    /// next observation.
    gap_timeout: AtomicBool,
    /// Nanoseconds since `epoch` at which the open gap appeared.
    gap_opened_ns: AtomicU64,

    parsed: AtomicU64,
    duplicates: AtomicU64,
    out_of_order: AtomicU64,
    lost: AtomicU64,

    mask: u32,
    /// Seen bitmap, indexed by `seq & mask`. Set bits mark observed but not
    /// yet retired numbers; bits are always cleared on retirement so a slot
    /// can never alias a number from a previous window turn.
    seen: Box<[AtomicU8]>,
    epoch: Instant,
}

impl Sequencer {
    /// Create a sequencer with a window of `capacity` sequence numbers.
    ///
    /// # Errors
    /// [`Error::Config`] unless `capacity` is a power of two greater than 1.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity < 2 || !capacity.is_power_of_two() || capacity > u32::MAX as usize {
            return Err(Error::Config(format!(
                "window capacity must be a power of two in [2, 2^32), got {capacity}"
            )));
        }
        let seen = (0..capacity)
            .map(|_| AtomicU8::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Sequencer {
            next_seq: AtomicU32::new(0),
            highest_seq: AtomicU32::new(0),
            gap_exists: AtomicBool::new(false),
            gap_timeout: AtomicBool::new(false),
            gap_opened_ns: AtomicU64::new(0),
            parsed: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            lost: AtomicU64::new(0),
            mask: (capacity - 1) as u32,
            seen,
            epoch: Instant::now(),
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.seen.len()
    }

    #[inline]
    fn slot(&self, seq: u32) -> &AtomicU8 {
        &self.seen[(seq & self.mask) as usize]
    }

    /// Classify one sequence number. Ingress thread only.
    ///
    /// # Errors
    /// [`Error::WindowExceeded`] once the spread between the retirement
    /// cursor and the highest observation no longer fits the window; the
    /// feed can not be classified past this point.
    pub fn observe(&self, seq: u32) -> Result<Disposition> {
        // A pending timeout is reconciled before this number can move
        // highest_seq, otherwise the record triggering reconciliation would
        // count its own gap as lost.
        if self.gap_timeout.load(Acquire) {
            self.retire();
        }

        if self.next_seq.load(Relaxed) == 0 {
            self.next_seq.store(seq, Relaxed);
        }

        let next = self.next_seq.load(Relaxed);
        let highest = self.highest_seq.load(Relaxed).max(seq);
        self.highest_seq.store(highest, Relaxed);

        if highest >= next && (highest - next) as usize >= self.capacity() {
            return Err(Error::WindowExceeded {
                next,
                highest,
                capacity: self.capacity(),
            });
        }

        if seq < next {
            // Already retired, whether parsed or written off as lost.
            self.duplicates.fetch_add(1, Relaxed);
            return Ok(Disposition::Duplicate);
        }

        if seq == next {
            self.parsed.fetch_add(1, Relaxed);
            self.next_seq.store(next.wrapping_add(1), Release);
            self.drain();
            return Ok(Disposition::InOrder);
        }

        // seq > next: strictly forward.
        let slot = self.slot(seq);
        if slot.load(Acquire) != 0 {
            self.duplicates.fetch_add(1, Relaxed);
            return Ok(Disposition::Duplicate);
        }
        slot.store(1, Release);
        self.out_of_order.fetch_add(1, Relaxed);
        if !self.gap_exists.load(Acquire) {
            self.gap_opened_ns
                .store(self.epoch.elapsed().as_nanos() as u64, Relaxed);
            self.gap_exists.store(true, Release);
        }
        Ok(Disposition::OutOfOrder)
    }

    /// Advance the retirement cursor through contiguous early arrivals,
    /// clearing each bit as the number retires.
    fn drain(&self) {
        loop {
            let next = self.next_seq.load(Relaxed);
            let slot = self.slot(next);
            if slot.load(Acquire) == 0 {
                break;
            }
            slot.store(0, Release);
            self.parsed.fetch_add(1, Relaxed);
            self.next_seq.store(next.wrapping_add(1), Release);
        }
        if self.gap_exists.load(Acquire)
            && self.next_seq.load(Relaxed) > self.highest_seq.load(Relaxed)
        {
            self.gap_exists.store(false, Release);
        }
    }

    /// Write off the open gap: every unobserved number up to the highest
    /// observation counts as lost, the window empties, and the cursor jumps
    /// past the gap. Ingress thread only.
    fn retire(&self) {
        let next = self.next_seq.load(Relaxed);
        let highest = self.highest_seq.load(Relaxed);

        let mut lost = 0u64;
        if next <= highest {
            for seq in next..=highest {
                let slot = self.slot(seq);
                if slot.load(Acquire) == 0 {
                    lost += 1;
                } else {
                    slot.store(0, Release);
                }
            }
        }
        if lost > 0 {
            self.lost.fetch_add(lost, Relaxed);
        }

        self.next_seq.store(highest.wrapping_add(1), Release);
        self.gap_exists.store(false, Release);
        self.gap_timeout.store(false, Release);

        let open_ns = self
            .epoch
            .elapsed()
            .as_nanos()
            .saturating_sub(u128::from(self.gap_opened_ns.load(Relaxed)));
        debug!(from = next, to = highest, lost, open_ns = open_ns as u64, "gap retired");
    }

    /// True while a hole sits in front of the retirement cursor. Read by the
    /// timer thread.
    #[must_use]
    pub fn gap_exists(&self) -> bool {
        self.gap_exists.load(Acquire)
    }

    /// Request retirement at the ingress thread's next observation. Called
    /// by the timer thread; the only window mutation it is allowed.
    pub fn trigger_timeout(&self) {
        self.gap_timeout.store(true, Release);
    }

    /// True once a timeout has been raised and not yet reconciled.
    #[must_use]
    pub fn timeout_pending(&self) -> bool {
        self.gap_timeout.load(Acquire)
    }

    /// Relaxed snapshot of the counters. Reads may tear against a
    /// concurrent observation; the counters are statistics, not ledger
    /// entries.
    #[must_use]
    pub fn stats(&self) -> Stats {
        Stats {
            parsed: self.parsed.load(Relaxed),
            duplicates: self.duplicates.load(Relaxed),
            out_of_order: self.out_of_order.load(Relaxed),
            lost: self.lost.load(Relaxed),
            next_seq: self.next_seq.load(Relaxed),
            highest_seq: self.highest_seq.load(Relaxed),
        }
    }
}
