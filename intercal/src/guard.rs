use crate::code::TuningWord;
use crate::config::{Guard, Offset};
use serde::{Deserialize, Serialize};
#[cfg(test)] use proptest::prelude::*;

// Bounds the relocation loop; two shifts are enough away from the word limits
const MAX_SHIFTS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub primary: TuningWord,
    pub alternate: TuningWord,
}

/// Keeps a candidate pair's fine fields inside the safe band.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EdgeGuard {
    fine_low: u8,
    fine_high: u8,
    offset: i32,
}

impl EdgeGuard {
    pub fn new(guard: &Guard, offset: Offset) -> Self {
        Self {
            fine_low: guard.fine_low,
            fine_high: guard.fine_high,
            offset: offset.raw(),
        }
    }

    /// Build a pair around `primary`, the alternate sitting one offset away
    /// on the side with more fine headroom.
    pub fn derive(&self, primary: TuningWord) -> CandidatePair {
        let alternate = if primary.fine() >= 16 {
            primary.offset(self.offset)
        } else {
            primary.offset(-self.offset)
        };
        CandidatePair { primary, alternate }
    }

    pub fn in_band(&self, word: TuningWord) -> bool {
        (self.fine_low..=self.fine_high).contains(&word.fine())
    }

    fn excursion(&self, pair: &CandidatePair) -> Option<i32> {
        [pair.primary, pair.alternate].into_iter().find_map(|word| {
            if word.fine() > self.fine_high {
                Some(1)
            } else if word.fine() < self.fine_low {
                Some(-1)
            } else {
                None
            }
        })
    }

    /// Relocate the pair if either fine field left the band. Stable: a second
    /// call on the result returns it unchanged.
    pub fn apply(&self, mut pair: CandidatePair) -> CandidatePair {
        for _ in 0..MAX_SHIFTS {
            let Some(direction) = self.excursion(&pair) else {
                break;
            };
            let primary = pair.primary.offset(direction * self.offset);
            if primary == pair.primary {
                // Pinned at the end of the code space
                break;
            }
            pair = self.derive(primary);
        }
        pair
    }
}

#[cfg(test)]
fn scm3c() -> EdgeGuard {
    let guard = crate::config::board::SCM3C_INITIATOR.guard;
    EdgeGuard::new(&guard, guard.rx_offset)
}

#[test]
fn derive_alternate_side() {
    let guard = scm3c();
    let high = guard.derive(TuningWord::clamped(23, 13, 20));
    assert_eq!(high.alternate.unpack(), (23, 14, 14));
    let low = guard.derive(TuningWord::clamped(23, 13, 8));
    assert_eq!(low.alternate.unpack(), (23, 12, 14));
}

#[test]
fn band_is_inclusive() {
    let guard = scm3c();
    let pair = guard.derive(TuningWord::clamped(23, 13, 30));
    assert_eq!(guard.apply(pair), pair);
    let pair = guard.derive(TuningWord::clamped(23, 13, 2));
    assert_eq!(guard.apply(pair), pair);
}

#[test]
fn relocates_high_fine() {
    let guard = scm3c();
    let pair = guard.derive(TuningWord::clamped(23, 13, 31));
    let moved = guard.apply(pair);
    assert_eq!(moved.primary.unpack(), (23, 14, 25));
    assert_eq!(moved.alternate.unpack(), (23, 15, 19));
}

#[test]
fn relocates_low_fine() {
    let guard = scm3c();
    let pair = guard.derive(TuningWord::clamped(23, 13, 1));
    let moved = guard.apply(pair);
    assert_eq!(moved.primary.unpack(), (23, 12, 7));
    assert_eq!(moved.alternate.unpack(), (23, 11, 13));
}

#[test]
fn stale_alternate_triggers_relocation() {
    let guard = scm3c();
    let pair = CandidatePair {
        primary: TuningWord::clamped(23, 13, 20),
        alternate: TuningWord::clamped(23, 14, 31),
    };
    let moved = guard.apply(pair);
    assert_eq!(moved.primary.unpack(), (23, 14, 14));
    assert!(guard.in_band(moved.primary) && guard.in_band(moved.alternate));
}

#[test]
fn pinned_at_word_limits() {
    let guard = scm3c();
    let top = guard.apply(guard.derive(TuningWord::MAX));
    assert_eq!(top.primary, TuningWord::MAX);
    let bottom = guard.apply(guard.derive(TuningWord::from_raw(0)));
    assert_eq!(bottom.primary.raw(), 0);
}

#[cfg(test)]
proptest! {
    #[test]
    fn guard_is_idempotent(primary in 0..0x8000_u16, alternate in 0..0x8000_u16) {
        let guard = scm3c();
        let pair = CandidatePair {
            primary: TuningWord::from_raw(primary),
            alternate: TuningWord::from_raw(alternate),
        };
        let once = guard.apply(pair);
        assert_eq!(once, guard.apply(once));
    }

    #[test]
    fn guard_lands_in_band(primary in 0x0100..0x7F00_u16) {
        let guard = scm3c();
        let pair = guard.apply(guard.derive(TuningWord::from_raw(primary)));
        assert!(guard.in_band(pair.primary) && guard.in_band(pair.alternate));
    }
}
