// seqnum.rs - 64-bit packet numbers on a 16-bit wire
// Numan Thabit 2025

use bitvec::prelude::*;
use thiserror::Error;

/// How far behind the high watermark a sequence may fall before it is
/// considered unrecoverably old.  Must be a power of two.
const WINDOW: u64 = 2048;

/// Expands a 16-bit wire sequence number into the full 64-bit value by
/// snapping to the multiple of 2^16 nearest the receiver's high watermark.
///
/// For any peer sequence within 2^15 of the watermark this recovers the
/// exact value, including across the 0xFFFF -> 0x0000 wrap.
pub fn expand_wire_seq(watermark: u64, wire: u16) -> u64 {
    let base = watermark & !0xffff;
    let candidate = base | u64::from(wire);

    let distance = |value: u64| watermark.abs_diff(value);

    let mut best = candidate;
    if let Some(lower) = candidate.checked_sub(1 << 16) {
        if distance(lower) < distance(best) {
            best = lower;
        }
    }
    let upper = candidate + (1 << 16);
    if distance(upper) < distance(best) {
        best = upper;
    }
    best
}

/// Why an inbound sequence number was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    /// Already seen this exact sequence number.
    #[error("duplicate sequence number {0}")]
    Duplicate(u64),
    /// Too far behind the high watermark to track.
    #[error("sequence number {0} too old")]
    TooOld(u64),
}

/// Receive-side tracker for full sequence numbers.
///
/// `check` classifies a sequence without mutating state so the caller can
/// decrypt first; `commit` marks it seen only after the packet
/// authenticated.  A forged wire sequence therefore cannot burn a slot.
#[derive(Debug)]
pub struct RecvSequencer {
    high: u64,
    seen: BitVec<u64, Lsb0>,
}

impl RecvSequencer {
    pub fn new() -> Self {
        let mut seen = BitVec::with_capacity(WINDOW as usize);
        seen.resize(WINDOW as usize, false);
        Self { high: 0, seen }
    }

    /// Highest sequence number committed so far.
    pub fn high_watermark(&self) -> u64 {
        self.high
    }

    /// Expands a wire sequence against the current watermark.
    pub fn expand(&self, wire: u16) -> u64 {
        expand_wire_seq(self.high, wire)
    }

    /// Classifies `seq` without recording it.
    pub fn check(&self, seq: u64) -> Result<(), SequenceError> {
        if seq > self.high {
            return Ok(());
        }
        if self.high - seq >= WINDOW {
            return Err(SequenceError::TooOld(seq));
        }
        if self.seen[(seq % WINDOW) as usize] {
            return Err(SequenceError::Duplicate(seq));
        }
        Ok(())
    }

    /// Records `seq` as seen.  Call only after [`check`](Self::check)
    /// succeeded and the packet decrypted.
    pub fn commit(&mut self, seq: u64) {
        if seq > self.high {
            // Clear the slots for every skipped number so stale bits from a
            // window ago are not mistaken for this range.
            let start = self.high + 1;
            let clear_from = if seq - start >= WINDOW {
                seq - WINDOW + 1
            } else {
                start
            };
            for s in clear_from..=seq {
                self.seen.set((s % WINDOW) as usize, false);
            }
            self.high = seq;
        }
        self.seen.set((seq % WINDOW) as usize, true);
    }
}

impl Default for RecvSequencer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn expands_forward() {
        assert_eq!(expand_wire_seq(0, 0), 0);
        assert_eq!(expand_wire_seq(5, 6), 6);
        assert_eq!(expand_wire_seq(0xffff, 0x0000), 0x1_0000);
    }

    #[test]
    fn wrap_does_not_decrement() {
        // Watermark just below a wire wrap; next packet wraps to 0x0000.
        let watermark = 0x2_fffe;
        let full = expand_wire_seq(watermark, 0x0000);
        assert_eq!(full, 0x3_0000);
        assert!(full > watermark);
    }

    #[test]
    fn expands_slightly_behind() {
        // A late packet from just before the watermark keeps its old value.
        assert_eq!(expand_wire_seq(0x1_0002, 0xfffe), 0xfffe);
    }

    #[test]
    fn snap_is_exact_within_half_range() {
        let watermark: u64 = 0x12_3456;
        for delta in [-0x7fffi64, -100, -1, 0, 1, 100, 0x7fff] {
            let full = watermark.wrapping_add_signed(delta);
            let wire = full as u16;
            assert_eq!(expand_wire_seq(watermark, wire), full, "delta {delta}");
        }
    }

    #[test]
    fn duplicate_detected() {
        let mut seq = RecvSequencer::new();
        assert_eq!(seq.check(7), Ok(()));
        seq.commit(7);
        assert_eq!(seq.check(7), Err(SequenceError::Duplicate(7)));
        assert_eq!(seq.check(8), Ok(()));
    }

    #[test]
    fn out_of_order_within_window_accepted_once() {
        let mut seq = RecvSequencer::new();
        seq.commit(10);
        assert_eq!(seq.check(5), Ok(()));
        seq.commit(5);
        assert_eq!(seq.check(5), Err(SequenceError::Duplicate(5)));
    }

    #[test]
    fn too_old_rejected() {
        let mut seq = RecvSequencer::new();
        seq.commit(WINDOW + 100);
        assert_eq!(seq.check(100), Err(SequenceError::TooOld(100)));
        assert_eq!(seq.check(101), Ok(()));
    }

    #[test]
    fn check_does_not_mutate() {
        let seq = RecvSequencer::new();
        assert_eq!(seq.check(3), Ok(()));
        assert_eq!(seq.check(3), Ok(()));
        assert_eq!(seq.high_watermark(), 0);
    }

    #[test]
    fn large_jump_clears_stale_bits() {
        let mut seq = RecvSequencer::new();
        seq.commit(1);
        seq.commit(1 + WINDOW * 3);
        // The slot for 1 was recycled by the jump; 1 is now simply too old,
        // and the nearby in-window number is fresh.
        assert_eq!(seq.check(1), Err(SequenceError::TooOld(1)));
        assert_eq!(seq.check(WINDOW * 3), Ok(()));
    }

    proptest! {
        #[test]
        fn reconstruction_round_trip(watermark in 0x1_0000u64..0x1_0000_0000,
                                     delta in -(1i64 << 15) + 1..(1i64 << 15)) {
            let full = watermark.wrapping_add_signed(delta);
            prop_assert_eq!(expand_wire_seq(watermark, full as u16), full);
        }

        #[test]
        fn exactly_once_commit(numbers in prop::collection::vec(1u64..5000, 1..200)) {
            let mut seq = RecvSequencer::new();
            let mut delivered = std::collections::HashSet::new();
            for n in numbers {
                if seq.check(n).is_ok() {
                    seq.commit(n);
                    prop_assert!(delivered.insert(n), "double delivery of {}", n);
                }
            }
        }
    }
}
