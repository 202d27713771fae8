//! Per-(source, epoch) duplicate suppression and gap detection.
//!
//! A sliding window over the last [`SequenceWindow::SIZE`] sequence numbers,
//! anchored at the highest one accepted. Bit `i` of the bitmap records
//! whether `highest - i` has been seen.
//!
//! ```text
//!            stale          |<-------- SIZE -------->|   ahead
//!   ... ────────────────────┼────────────────────────┼──────────> seq
//!                      highest - SIZE             highest
//! ```
//!
//! - Below the window: too old to tell apart from a replay, discarded
//! - Inside, bit set: duplicate
//! - Inside, bit clear: late arrival, accepted
//! - Above: accepted, window slides forward, skipped numbers become a gap

use scatterlog_proto::Sequence;

/// Outcome of checking one sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    /// Not seen before. `gap` counts sequence numbers skipped between the
    /// previous highest and this one (0 for in-order and late arrivals).
    Accepted {
        /// Sequence numbers jumped over
        gap: u32,
    },
    /// Already seen
    Duplicate,
    /// Too far behind the window to track
    Stale,
}

/// Sliding replay window for one (source, epoch).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceWindow {
    highest: Option<Sequence>,
    seen: u128,
    accepted: u64,
    missed: u64,
}

impl SequenceWindow {
    /// Window width in sequence numbers.
    pub const SIZE: u32 = 128;

    /// Empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify `sequence` without recording it.
    pub fn check(&self, sequence: Sequence) -> WindowVerdict {
        let Some(highest) = self.highest else {
            return WindowVerdict::Accepted { gap: 0 };
        };

        if sequence > highest {
            return WindowVerdict::Accepted { gap: sequence - highest - 1 };
        }

        let behind = highest - sequence;
        if behind >= Self::SIZE {
            WindowVerdict::Stale
        } else if self.seen & (1u128 << behind) != 0 {
            WindowVerdict::Duplicate
        } else {
            WindowVerdict::Accepted { gap: 0 }
        }
    }

    /// Classify `sequence` and record it if accepted.
    pub fn accept(&mut self, sequence: Sequence) -> WindowVerdict {
        let verdict = self.check(sequence);
        let WindowVerdict::Accepted { gap } = verdict else {
            return verdict;
        };

        match self.highest {
            Some(highest) if sequence <= highest => {
                self.seen |= 1u128 << (highest - sequence);
                // A late arrival fills a hole counted as missed earlier.
                self.missed = self.missed.saturating_sub(1);
            },
            Some(highest) => {
                let shift = sequence - highest;
                self.seen = if shift >= Self::SIZE { 1 } else { (self.seen << shift) | 1 };
                self.highest = Some(sequence);
            },
            None => {
                self.seen = 1;
                self.highest = Some(sequence);
            },
        }

        self.accepted += 1;
        self.missed += u64::from(gap);
        verdict
    }

    /// Highest sequence accepted so far.
    pub fn highest(&self) -> Option<Sequence> {
        self.highest
    }

    /// Number of sequence numbers accepted.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Sequence numbers skipped and not (yet) filled in by late arrivals.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}
