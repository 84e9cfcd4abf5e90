/* Tuning codes for the two tunable oscillators.
 *
 * The LC tank takes a 15 bit word of three 5 bit fields (coarse, mid, fine),
 * the RC 2MHz reference takes coarse/fine/superfine. Field steps overlap
 * heavily: one mid step is a bit under 7 fine steps and one coarse step is
 * about 17 mid steps, so adjustments are carried in frequency space rather
 * than positionally.
 * */
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
#[cfg(test)] use proptest::prelude::*;
#[cfg(test)] use proptest_derive::Arbitrary;

pub const FIELD_MAX: u8 = 31;
const FIELD_BITS: u16 = 5;
const FIELD_MASK: u16 = (1 << FIELD_BITS) - 1;
const WORD_MAX: u16 = 0x7FFF;

/// Round to nearest, halves toward positive infinity.
pub(crate) fn div_nearest(dividend: i64, divisor: i64) -> i64 {
    let (dividend, divisor) = if divisor < 0 { (-dividend, -divisor) } else { (dividend, divisor) };
    (2 * dividend + divisor).div_euclid(2 * divisor)
}

fn div_floor(dividend: i64, divisor: i64) -> i64 {
    dividend.div_euclid(divisor)
}

fn div_ceil(dividend: i64, divisor: i64) -> i64 {
    -(-dividend).div_euclid(divisor)
}

#[cfg(test)]
proptest! {
    #[test]
    fn div_even(n: i32) {
        let v = i64::from(n);
        assert_eq!(v, div_nearest(v*2, 2));
    }

    #[test]
    fn div_odd(n: i32) {
        let v = i64::from(n);
        assert_eq!(v+1, div_nearest(v*2 + 1, 2));
    }

    #[test]
    fn div_sign(n: i32, d in 1..1_000_000_i64) {
        let v = i64::from(n);
        assert!((div_nearest(v, d) * d - v).abs() * 2 <= d);
        assert_eq!(div_nearest(v, d), div_nearest(-v, -d));
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(Arbitrary))]
pub enum Oscillator {
    Lc,
    Rc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(Arbitrary))]
pub enum Field {
    Coarse,
    Mid,
    Fine,
}

/// Hz per LC code step. Measured per board, see `config::board`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LcSensitivity {
    pub coarse: i64,
    pub mid: i64,
    pub fine: i64,
}

/// Hz per RC code step. Negative: the RC bank slows down as its code grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcSensitivity {
    pub coarse: i64,
    pub fine: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensitivity {
    pub lc: LcSensitivity,
    pub rc: RcSensitivity,
}

impl Sensitivity {
    /// None for fields the oscillator doesn't have.
    #[rustfmt::skip]
    pub fn hz_per_step(&self, osc: Oscillator, field: Field) -> Option<i64> {
        match (osc, field) {
            (Oscillator::Lc, Field::Coarse) => Some(self.lc.coarse),
            (Oscillator::Lc, Field::Mid)    => Some(self.lc.mid),
            (Oscillator::Lc, Field::Fine)   => Some(self.lc.fine),
            (Oscillator::Rc, Field::Coarse) => Some(self.rc.coarse),
            (Oscillator::Rc, Field::Mid)    => None,
            (Oscillator::Rc, Field::Fine)   => Some(self.rc.fine),
        }
    }
}

/// Signed step counts requested per LC field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FieldDeltas {
    pub coarse: i32,
    pub mid: i32,
    pub fine: i32,
}

impl FieldDeltas {
    pub fn fine(fine: i32) -> Self {
        Self { fine, ..Self::default() }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Signed step counts requested per RC field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RcDeltas {
    pub coarse: i32,
    pub fine: i32,
}

impl RcDeltas {
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of an adjustment; `clamped` is set when the top field hit its
/// hardware limit and the request could not be fully represented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Adjusted<T> {
    pub value: T,
    pub clamped: bool,
}

/* Carry a multi-field adjustment.
 *
 * The target is expressed in code-space Hz (fields weighted by the magnitude
 * of their step). Walking from the top field down, each field stays as close
 * as possible to its requested value while leaving a residual the lower
 * fields can still represent. The last field rounds, so an unclamped result
 * lands within half a bottom step of the target.
 * */
fn carry<const N: usize>(fields: [u8; N], deltas: [i32; N], steps: [i64; N]) -> ([u8; N], bool) {
    let max = i64::from(FIELD_MAX);
    let mut residual: i64 = (0..N)
        .map(|i| (i64::from(fields[i]) + i64::from(deltas[i])) * steps[i])
        .sum();
    let mut out = [0; N];
    let mut clamped = false;

    for i in 0..N {
        let step = steps[i];
        let wanted = i64::from(fields[i]) + i64::from(deltas[i]);
        let value = if i + 1 == N {
            div_nearest(residual, step)
        } else {
            let span: i64 = steps[i + 1..].iter().map(|s| s * max).sum();
            let lo = div_ceil(residual - span, step);
            let hi = div_floor(residual, step);
            if lo.max(0) <= hi.min(max) {
                wanted.clamp(lo.max(0), hi.min(max))
            } else if lo <= hi {
                // Out of reach for this field, saturate
                clamped |= i == 0;
                wanted.clamp(lo, hi)
            } else {
                // Lower fields can't bridge a step, take the closest below
                div_floor(residual, step)
            }
        };
        let field = value.clamp(0, max);
        out[i] = field as u8;
        residual -= field * step;
    }
    (out, clamped)
}

/// LC tank tuning word: coarse in bits 14..10, mid in 9..5, fine in 4..0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "[u8; 3]", into = "[u8; 3]")]
pub struct TuningWord(u16);

impl TuningWord {
    pub const MAX: Self = Self(WORD_MAX);

    pub fn pack(coarse: u8, mid: u8, fine: u8) -> Result<Self> {
        for field in [coarse, mid, fine] {
            if field > FIELD_MAX {
                return Err(Error::FieldRange(field));
            }
        }
        Ok(Self::clamped(coarse, mid, fine))
    }

    /// Saturates each field at 31 instead of failing.
    pub const fn clamped(coarse: u8, mid: u8, fine: u8) -> Self {
        const fn sat(v: u8) -> u16 {
            (if v > FIELD_MAX { FIELD_MAX } else { v }) as u16
        }
        Self(sat(coarse) << (2 * FIELD_BITS) | sat(mid) << FIELD_BITS | sat(fine))
    }

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw & WORD_MAX)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn coarse(self) -> u8 {
        (self.0 >> (2 * FIELD_BITS) & FIELD_MASK) as u8
    }

    pub const fn mid(self) -> u8 {
        (self.0 >> FIELD_BITS & FIELD_MASK) as u8
    }

    pub const fn fine(self) -> u8 {
        (self.0 & FIELD_MASK) as u8
    }

    pub const fn unpack(self) -> (u8, u8, u8) {
        (self.coarse(), self.mid(), self.fine())
    }

    pub fn apply_signed_adjustment(self, deltas: FieldDeltas, sens: &LcSensitivity) -> Adjusted<Self> {
        let (coarse, mid, fine) = self.unpack();
        let ([coarse, mid, fine], clamped) = carry(
            [coarse, mid, fine],
            [deltas.coarse, deltas.mid, deltas.fine],
            [sens.coarse.abs(), sens.mid.abs(), sens.fine.abs()],
        );
        Adjusted { value: Self::clamped(coarse, mid, fine), clamped }
    }

    /// Positional offset on the raw word: fine spills into mid at 32 and mid
    /// into coarse. Saturates at both ends of the 15 bit range.
    pub fn offset(self, delta: i32) -> Self {
        Self((i32::from(self.0) + delta).clamp(0, i32::from(WORD_MAX)) as u16)
    }
}

impl TryFrom<[u8; 3]> for TuningWord {
    type Error = Error;
    fn try_from(fields: [u8; 3]) -> Result<Self> {
        Self::pack(fields[0], fields[1], fields[2])
    }
}

impl From<TuningWord> for [u8; 3] {
    fn from(word: TuningWord) -> Self {
        let (coarse, mid, fine) = word.unpack();
        [coarse, mid, fine]
    }
}

/// RC 2MHz reference code. `superfine` is programmed once at boot and left alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RcCode {
    pub coarse: u8,
    pub fine: u8,
    pub superfine: u8,
}

impl RcCode {
    pub fn new(coarse: u8, fine: u8, superfine: u8) -> Result<Self> {
        for field in [coarse, fine, superfine] {
            if field > FIELD_MAX {
                return Err(Error::FieldRange(field));
            }
        }
        Ok(Self { coarse, fine, superfine })
    }

    pub fn apply_signed_adjustment(self, deltas: RcDeltas, sens: &RcSensitivity) -> Adjusted<Self> {
        let ([coarse, fine], clamped) = carry(
            [self.coarse.min(FIELD_MAX), self.fine.min(FIELD_MAX)],
            [deltas.coarse, deltas.fine],
            [sens.coarse.abs(), sens.fine.abs()],
        );
        Adjusted { value: Self { coarse, fine, ..self }, clamped }
    }
}

#[cfg(test)]
const SCM3C: Sensitivity = crate::config::board::SCM3C_SENSITIVITY;

#[cfg(test)]
fn lc_position(word: TuningWord) -> i64 {
    let s = SCM3C.lc;
    i64::from(word.coarse()) * s.coarse.abs()
        + i64::from(word.mid()) * s.mid.abs()
        + i64::from(word.fine()) * s.fine.abs()
}

#[test]
fn pack_rejects_wide_fields() {
    assert!(matches!(TuningWord::pack(32, 0, 0), Err(Error::FieldRange(32))));
    assert!(matches!(TuningWord::pack(0, 0, 40), Err(Error::FieldRange(40))));
    assert_eq!(TuningWord::pack(23, 6, 4).unwrap().unpack(), (23, 6, 4));
    assert_eq!(TuningWord::pack(23, 6, 4).unwrap().raw(), 23 << 10 | 6 << 5 | 4);
}

#[test]
fn clamped_saturates() {
    assert_eq!(TuningWord::clamped(40, 2, 99).unpack(), (31, 2, 31));
}

#[test]
fn raw_offset_spills_fine_into_mid() {
    let word = TuningWord::clamped(23, 6, 30);
    assert_eq!(word.offset(26).unpack(), (23, 7, 24));
    assert_eq!(TuningWord::clamped(23, 6, 2).offset(-26).unpack(), (23, 5, 8));
    assert_eq!(TuningWord::clamped(23, 31, 31).offset(26).unpack(), (24, 0, 25));
    assert_eq!(TuningWord::MAX.offset(26), TuningWord::MAX);
    assert_eq!(TuningWord::from_raw(3).offset(-26).raw(), 0);
}

#[test]
fn carry_into_mid() {
    // 43 fine steps from (23, 6, 4) overflow fine; mid takes the minimum carry
    let seed = TuningWord::clamped(23, 6, 4);
    let adjusted = seed.apply_signed_adjustment(FieldDeltas::fine(43), &SCM3C.lc);
    assert!(!adjusted.clamped);
    assert_eq!(adjusted.value.unpack(), (23, 9, 27));
}

#[test]
fn sensitivity_table() {
    assert_eq!(SCM3C.hz_per_step(Oscillator::Lc, Field::Fine), Some(130_902));
    assert_eq!(SCM3C.hz_per_step(Oscillator::Rc, Field::Mid), None);
    assert!(SCM3C.hz_per_step(Oscillator::Rc, Field::Fine).unwrap() < 0);
}

#[test]
fn rc_keeps_superfine() {
    let code = RcCode::new(20, 30, 15).unwrap();
    let adjusted = code.apply_signed_adjustment(RcDeltas { coarse: 0, fine: 5 }, &SCM3C.rc);
    assert_eq!(adjusted.value.superfine, 15);
    assert!(adjusted.value.fine <= FIELD_MAX);
    assert!(adjusted.value.coarse > 20);
}

#[cfg(test)]
proptest! {
    #[test]
    fn word_field_roundtrip(coarse in 0..32_u8, mid in 0..32_u8, fine in 0..32_u8) {
        let word = TuningWord::pack(coarse, mid, fine).unwrap();
        assert_eq!((coarse, mid, fine), word.unpack());
        assert_eq!(word, TuningWord::try_from(<[u8; 3]>::from(word)).unwrap());
    }

    #[test]
    fn sensitivity_lookup(osc: Oscillator, field: Field) {
        let hz = SCM3C.hz_per_step(osc, field);
        assert_eq!(hz.is_none(), osc == Oscillator::Rc && field == Field::Mid);
    }

    // Hardware-specific: depends on the SCM3C LC sensitivities
    #[test]
    fn lc_carry_within_one_fine_step(
        coarse in 0..32_u8, mid in 0..32_u8, fine in 0..32_u8,
        dc in -3..4_i32, dm in -40..41_i32, df in -200..201_i32,
    ) {
        let word = TuningWord::pack(coarse, mid, fine).unwrap();
        let deltas = FieldDeltas { coarse: dc, mid: dm, fine: df };
        let adjusted = word.apply_signed_adjustment(deltas, &SCM3C.lc);
        let (c, m, f) = adjusted.value.unpack();
        assert!(c <= FIELD_MAX && m <= FIELD_MAX && f <= FIELD_MAX);
        if !adjusted.clamped {
            let s = SCM3C.lc;
            let requested = i64::from(dc) * s.coarse + i64::from(dm) * s.mid + i64::from(df) * s.fine;
            let achieved = lc_position(adjusted.value) - lc_position(word);
            assert!((achieved - requested).abs() <= s.fine, "{achieved} vs {requested}");
        }
    }

    #[test]
    fn lc_in_range_deltas_are_exact(
        coarse in 0..32_u8, mid in 0..32_u8, fine in 0..32_u8,
        nc in 0..32_u8, nm in 0..32_u8, nf in 0..32_u8,
    ) {
        let word = TuningWord::pack(coarse, mid, fine).unwrap();
        let deltas = FieldDeltas {
            coarse: i32::from(nc) - i32::from(coarse),
            mid: i32::from(nm) - i32::from(mid),
            fine: i32::from(nf) - i32::from(fine),
        };
        let adjusted = word.apply_signed_adjustment(deltas, &SCM3C.lc);
        assert!(!adjusted.clamped);
        assert_eq!(adjusted.value.unpack(), (nc, nm, nf));
    }

    #[test]
    fn lc_coarse_clamps_at_bounds(coarse in 0..32_u8, mid in 0..32_u8, fine in 0..32_u8, dc in 1..64_i32) {
        let word = TuningWord::pack(coarse, mid, fine).unwrap();
        let up = word.apply_signed_adjustment(FieldDeltas { coarse: 32 - i32::from(coarse) + dc - 1, ..Default::default() }, &SCM3C.lc);
        assert_eq!(up.value.coarse(), FIELD_MAX);
        let down = word.apply_signed_adjustment(FieldDeltas { coarse: -i32::from(coarse) - dc, ..Default::default() }, &SCM3C.lc);
        assert_eq!(down.value.coarse(), 0);
    }

    // Hardware-specific: depends on the SCM3C RC sensitivities
    #[test]
    fn rc_carry_within_one_fine_step(coarse in 0..32_u8, fine in 0..32_u8, dc in -3..4_i32, df in -300..301_i32) {
        let code = RcCode::new(coarse, fine, 0).unwrap();
        let adjusted = code.apply_signed_adjustment(RcDeltas { coarse: dc, fine: df }, &SCM3C.rc);
        let value = adjusted.value;
        assert!(value.coarse <= FIELD_MAX && value.fine <= FIELD_MAX);
        if !adjusted.clamped {
            let s = SCM3C.rc;
            let requested = i64::from(dc) * s.coarse.abs() + i64::from(df) * s.fine.abs();
            let achieved = (i64::from(value.coarse) - i64::from(coarse)) * s.coarse.abs()
                + (i64::from(value.fine) - i64::from(fine)) * s.fine.abs();
            assert!((achieved - requested).abs() <= s.fine.abs());
        }
    }
}
