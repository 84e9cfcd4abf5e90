/* Tick counts -> frequency estimates -> code deltas.
 *
 * Everything is fixed point in Hz (i64). The RC estimate leans on the RX LC
 * estimate: the RX tank is held on the peer's carrier by the IF loop, so
 * its smoothed frequency is the best reference available, and the RC rate
 * follows from the ratio of the two counts over the same window. The
 * measured LC count is the divisor there, not the nominal window.
 * */
use crate::code::{div_nearest, FieldDeltas, RcDeltas, Sensitivity};
use crate::config::{Config, Intermediate, Smoothing, Timing, MAX_HISTORY_DEPTH};
use crate::mote::Counters;
use crate::{Error, Result};
#[cfg(test)] use itertools::Itertools;
#[cfg(test)] use proptest::prelude::*;

/// Counts accumulated over one measurement window of `ticks` timer ticks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    pub reference: u32,
    pub lc: u32,
    pub ticks: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeasurementWindow {
    pub start: Counters,
    pub end: Counters,
    /// Timer ticks between the two snapshots.
    pub nominal_ticks: u32,
}

fn plausible(count: u32, expected: u32, tolerance_pct: u32) -> bool {
    let count = u64::from(count) * 100;
    let expected = u64::from(expected.max(1));
    let tolerance = u64::from(tolerance_pct.min(99));
    count >= expected * (100 - tolerance) && count <= expected * (100 + tolerance)
}

impl MeasurementWindow {
    /// Counts over the window. A counter that stalled, reset or ran backwards
    /// mid-window lands outside `tolerance_pct` of `expected` and is rejected.
    pub fn sample(&self, expected: &Sample, tolerance_pct: u32) -> Result<Sample> {
        let reference = self.end.reference.wrapping_sub(self.start.reference);
        let lc = self.end.lc.wrapping_sub(self.start.lc);
        if !plausible(reference, expected.reference, tolerance_pct) || !plausible(lc, expected.lc, tolerance_pct) {
            return Err(Error::DegenerateCount { reference, lc });
        }
        Ok(Sample { reference, lc, ticks: self.nominal_ticks })
    }
}

pub trait Average: Copy + Default {
    fn average(samples: &[Self]) -> Self;
}

impl Average for u16 {
    fn average(samples: &[Self]) -> Self {
        let sum: u32 = samples.iter().map(|&s| u32::from(s)).sum();
        (sum / samples.len().max(1) as u32) as u16
    }
}

impl Average for Sample {
    fn average(samples: &[Self]) -> Self {
        let n = samples.len().max(1) as u64;
        let reference: u64 = samples.iter().map(|s| u64::from(s.reference)).sum();
        let lc: u64 = samples.iter().map(|s| u64::from(s.lc)).sum();
        let ticks: u64 = samples.iter().map(|s| u64::from(s.ticks)).sum();
        Sample {
            reference: (reference / n) as u32,
            lc: (lc / n) as u32,
            ticks: (ticks / n) as u32,
        }
    }
}

/// Averages measurements in blocks. The block starts at one sample and grows
/// by one per completed block up to `depth`, so the first corrections come
/// quickly and later ones are quieter. Samples from before a correction are
/// never mixed with samples after it.
#[derive(Clone, Debug)]
pub struct HistoryBuffer<T, const N: usize> {
    slots: [T; N],
    len: usize,
    window: usize,
    depth: usize,
}

impl<T: Average, const N: usize> HistoryBuffer<T, N> {
    pub fn new(depth: usize) -> Self {
        Self {
            slots: [T::default(); N],
            len: 0,
            window: 1,
            depth: depth.clamp(1, N),
        }
    }

    /// Current block size.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Returns the block average once a block completes.
    pub fn push(&mut self, value: T) -> Option<T> {
        self.slots[self.len] = value;
        self.len += 1;
        if self.len < self.window {
            return None;
        }
        let average = T::average(&self.slots[..self.len]);
        self.len = 0;
        self.window = (self.window + 1).min(self.depth);
        Some(average)
    }
}

/// Exponential smoothing, `(new * w + old * (total - w)) / total`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Smoother {
    weight_new: i64,
    weight_total: i64,
    estimate: i64,
}

impl Smoother {
    pub fn new(smoothing: &Smoothing, initial: i64) -> Self {
        Self {
            weight_new: i64::from(smoothing.weight_new),
            weight_total: i64::from(smoothing.weight_total.max(1)),
            estimate: initial,
        }
    }

    pub fn estimate(&self) -> i64 {
        self.estimate
    }

    pub fn update(&mut self, raw: i64) -> i64 {
        let old = self.weight_total - self.weight_new;
        self.estimate = div_nearest(raw * self.weight_new + self.estimate * old, self.weight_total);
        self.estimate
    }
}

/// LC tank frequency from its divided count over a window of `window_ticks`.
pub fn lc_frequency(lc_ticks: u32, window_ticks: u32, timing: &Timing) -> i64 {
    div_nearest(
        i64::from(lc_ticks) * i64::from(timing.lc_divider) * i64::from(timing.timer_hz),
        i64::from(window_ticks.max(1)),
    )
}

/// Counts a healthy window of `ticks` shows with the RC on target and the
/// tank near `lc_hz`.
pub fn expected_counts(lc_hz: i64, ticks: u32, timing: &Timing) -> Sample {
    let timer_hz = i64::from(timing.timer_hz.max(1));
    let reference = div_nearest(i64::from(timing.rc_target_hz) * i64::from(ticks), timer_hz);
    let lc = div_nearest(lc_hz * i64::from(ticks), timer_hz * i64::from(timing.lc_divider.max(1)));
    let saturate = |count: i64| count.clamp(0, i64::from(u32::MAX)) as u32;
    Sample {
        reference: saturate(reference),
        lc: saturate(lc),
        ticks,
    }
}

/// RC frequency from the reference/LC count ratio and an LC frequency.
pub fn rc_frequency(sample: &Sample, lc_hz: i64, timing: &Timing) -> Result<i64> {
    let divisor = i64::from(sample.lc) * i64::from(timing.lc_divider);
    if divisor == 0 {
        return Err(Error::DegenerateCount { reference: sample.reference, lc: sample.lc });
    }
    Ok(div_nearest(i64::from(sample.reference) * lc_hz, divisor))
}

/// Whole code steps cancelling `error_hz`, truncated toward zero.
pub fn correction_steps(error_hz: i64, hz_per_step: i64) -> i32 {
    if hz_per_step == 0 {
        return 0;
    }
    (-(error_hz / hz_per_step)).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}

/// Per-path history and smoothing for the closed loop.
#[derive(Clone, Debug)]
pub struct Calibrator {
    timing: Timing,
    sensitivity: Sensitivity,
    intermediate: Intermediate,
    tx_offset_hz: i64,
    if_history: HistoryBuffer<u16, MAX_HISTORY_DEPTH>,
    rx_history: HistoryBuffer<Sample, MAX_HISTORY_DEPTH>,
    tx_history: HistoryBuffer<Sample, MAX_HISTORY_DEPTH>,
    rx_lc: Smoother,
    tx_lc: Smoother,
    rc: Smoother,
}

impl Calibrator {
    pub fn new(config: &Config) -> Self {
        let s = &config.smoothing;
        Self {
            timing: config.timing,
            sensitivity: config.sensitivity,
            intermediate: config.intermediate,
            tx_offset_hz: config.tx.offset_hz,
            if_history: HistoryBuffer::new(s.depth),
            rx_history: HistoryBuffer::new(s.depth),
            tx_history: HistoryBuffer::new(s.depth),
            rx_lc: Smoother::new(s, s.initial_rx_hz),
            tx_lc: Smoother::new(s, s.initial_rx_hz + config.tx.offset_hz),
            rc: Smoother::new(s, i64::from(config.timing.rc_target_hz)),
        }
    }

    pub fn rx_estimate(&self) -> i64 {
        self.rx_lc.estimate()
    }

    pub fn tx_estimate(&self) -> i64 {
        self.tx_lc.estimate()
    }

    pub fn rc_estimate(&self) -> i64 {
        self.rc.estimate()
    }

    pub fn tx_target(&self) -> i64 {
        self.rx_lc.estimate() + self.tx_offset_hz
    }

    /// RX tank correction from the demodulator's IF estimate. The first block
    /// holds a single sample, so the very first estimate moves the word alone.
    pub fn intermediate(&mut self, estimate: u16) -> Result<Option<FieldDeltas>> {
        if estimate == 0 {
            return Err(Error::IfEstimate);
        }
        Ok(self.if_history.push(estimate).map(|average| {
            let error = i32::from(average) - i32::from(self.intermediate.target);
            FieldDeltas::fine(error / self.intermediate.counts_per_fine)
        }))
    }

    fn sample(&self, window: &MeasurementWindow, lc_hz: i64) -> Result<Sample> {
        let expected = expected_counts(lc_hz, window.nominal_ticks, &self.timing);
        window.sample(&expected, self.timing.count_tolerance_pct)
    }

    /// RC correction from a window with the RX tank running.
    pub fn rx_window(&mut self, window: &MeasurementWindow) -> Result<Option<RcDeltas>> {
        let sample = self.sample(window, self.rx_lc.estimate())?;
        let Some(average) = self.rx_history.push(sample) else {
            return Ok(None);
        };
        let rx_hz = self.rx_lc.update(lc_frequency(average.lc, average.ticks, &self.timing));
        let rc_hz = self.rc.update(rc_frequency(&average, rx_hz, &self.timing)?);
        let error = rc_hz - i64::from(self.timing.rc_target_hz);
        Ok(Some(RcDeltas {
            coarse: 0,
            fine: correction_steps(error, self.sensitivity.rc.fine),
        }))
    }

    /// TX tank correction from a window with the TX tank running.
    pub fn tx_window(&mut self, window: &MeasurementWindow) -> Result<Option<FieldDeltas>> {
        let sample = self.sample(window, self.tx_lc.estimate())?;
        let Some(average) = self.tx_history.push(sample) else {
            return Ok(None);
        };
        let tx_hz = self.tx_lc.update(lc_frequency(average.lc, average.ticks, &self.timing));
        let error = tx_hz - self.tx_target();
        Ok(Some(FieldDeltas::fine(correction_steps(error, self.sensitivity.lc.fine))))
    }
}

#[cfg(test)]
const SCM3C: Config = crate::config::board::SCM3C_INITIATOR;

#[cfg(test)]
fn window(reference: u32, lc: u32) -> MeasurementWindow {
    MeasurementWindow {
        start: Counters::default(),
        end: Counters { reference, lc, adc: 0 },
        nominal_ticks: SCM3C.timing.measurement_ticks,
    }
}

// Fixed-point regression vector: ref 100000, lc 124000 over 25000 ticks
#[test]
fn regression_vector() {
    assert_eq!(lc_frequency(124_000, 25_000, &SCM3C.timing), 2_380_800_000);
    assert_eq!(lc_frequency(62_000, 12_500, &SCM3C.timing), 2_380_800_000);

    // TX: target is the initial RX estimate plus 7 MHz
    let mut cal = Calibrator::new(&SCM3C);
    assert_eq!(cal.tx_target(), 2_409_500_000);
    let delta = cal.tx_window(&window(100_000, 124_000)).unwrap();
    assert_eq!(cal.tx_estimate(), 2_403_760_000);
    assert_eq!(delta, Some(FieldDeltas::fine(43)));

    // RC: reference over the smoothed RX estimate
    let mut cal = Calibrator::new(&SCM3C);
    let delta = cal.rx_window(&window(100_000, 124_000)).unwrap();
    assert_eq!(cal.rx_estimate(), 2_398_160_000);
    assert_eq!(cal.rc_estimate(), 2_002_917);
    assert_eq!(delta, Some(RcDeltas { coarse: 0, fine: 1 }));
}

#[test]
fn rc_frequency_uses_measured_lc_count() {
    let sample = Sample { reference: 10_000, lc: 124_000, ticks: 25_000 };
    assert_eq!(rc_frequency(&sample, 2_398_160_000, &SCM3C.timing).unwrap(), 201_458);
    let halved = Sample { lc: 62_000, ..sample };
    assert_eq!(rc_frequency(&halved, 2_398_160_000, &SCM3C.timing).unwrap(), 402_917);
    let dead = Sample { lc: 0, ..sample };
    assert!(matches!(rc_frequency(&dead, 1, &SCM3C.timing), Err(Error::DegenerateCount { .. })));
}

#[test]
fn degenerate_windows_are_skipped() {
    let mut cal = Calibrator::new(&SCM3C);
    assert!(matches!(cal.rx_window(&window(0, 124_000)), Err(Error::DegenerateCount { .. })));
    assert!(matches!(cal.tx_window(&window(100_000, 3)), Err(Error::DegenerateCount { .. })));
    assert_eq!(cal.rx_estimate(), SCM3C.smoothing.initial_rx_hz);
    // The skipped sample didn't consume the first (single sample) block
    assert!(cal.rx_window(&window(100_000, 124_000)).unwrap().is_some());
}

#[test]
fn counter_running_backwards_is_rejected() {
    let mut cal = Calibrator::new(&SCM3C);
    let reset = MeasurementWindow {
        start: Counters { reference: 0, lc: 124_000, adc: 0 },
        end: Counters { reference: 100_000, lc: 100, adc: 0 },
        nominal_ticks: SCM3C.timing.measurement_ticks,
    };
    assert!(matches!(cal.tx_window(&reset), Err(Error::DegenerateCount { .. })));
    assert!(matches!(cal.rx_window(&reset), Err(Error::DegenerateCount { .. })));
    // Jumping forward is no better than jumping back
    assert!(matches!(cal.rx_window(&window(100_000, 375_000)), Err(Error::DegenerateCount { .. })));
    assert!(matches!(cal.rx_window(&window(400_000, 124_000)), Err(Error::DegenerateCount { .. })));
    assert_eq!(cal.rx_estimate(), SCM3C.smoothing.initial_rx_hz);
    assert_eq!(cal.rc_estimate(), i64::from(SCM3C.timing.rc_target_hz));

    // The next healthy window is handled as if the glitches never happened
    assert_eq!(cal.tx_window(&window(100_000, 124_000)).unwrap(), Some(FieldDeltas::fine(43)));
    assert_eq!(cal.tx_estimate(), 2_403_760_000);
}

#[test]
fn expected_counts_follow_the_window() {
    let full = expected_counts(2_402_500_000, 25_000, &SCM3C.timing);
    assert_eq!(full, Sample { reference: 100_000, lc: 125_130, ticks: 25_000 });
    let half = expected_counts(2_402_500_000, 12_500, &SCM3C.timing);
    assert_eq!((half.reference, half.lc), (50_000, 62_565));
}

#[test]
fn counters_wrap() {
    let w = MeasurementWindow {
        start: Counters { reference: u32::MAX - 9, lc: u32::MAX, adc: 0 },
        end: Counters { reference: 99_990, lc: 123_999, adc: 0 },
        nominal_ticks: 25_000,
    };
    let expected = expected_counts(2_402_500_000, 25_000, &SCM3C.timing);
    assert_eq!(w.sample(&expected, 50).unwrap(), Sample { reference: 100_000, lc: 124_000, ticks: 25_000 });
    assert!(w.sample(&expected, 0).is_err());
}

#[test]
fn history_ramps_to_depth() {
    let mut history = HistoryBuffer::<u16, 16>::new(5);
    let blocks = (0..40).filter(|&i| history.push(500 + i).is_some()).collect_vec();
    // Blocks of 1, 2, 3, 4, then 5 forever
    assert_eq!(blocks, [0, 2, 5, 9, 14, 19, 24, 29, 34, 39]);
    assert_eq!(history.window(), 5);
}

#[test]
fn history_averages_block() {
    let mut history = HistoryBuffer::<Sample, 4>::new(2);
    assert!(history.push(Sample { reference: 7, lc: 9, ticks: 5 }).is_some());
    assert_eq!(history.push(Sample { reference: 10, lc: 20, ticks: 5 }), None);
    assert_eq!(
        history.push(Sample { reference: 20, lc: 41, ticks: 5 }),
        Some(Sample { reference: 15, lc: 30, ticks: 5 })
    );
}

#[test]
fn intermediate_drops_missing_estimate() {
    let mut cal = Calibrator::new(&SCM3C);
    assert!(matches!(cal.intermediate(0), Err(Error::IfEstimate)));
    assert_eq!(cal.intermediate(548).unwrap(), Some(FieldDeltas::fine(3)));
    // Second block holds two samples
    assert_eq!(cal.intermediate(436).unwrap(), None);
    assert_eq!(cal.intermediate(436).unwrap(), Some(FieldDeltas::fine(-4)));
}

#[test]
fn correction_sign_follows_sensitivity() {
    // LC speeds up with code, RC slows down
    assert_eq!(correction_steps(1_000_000, 130_902), -7);
    assert_eq!(correction_steps(-1_000_000, 130_902), 7);
    assert_eq!(correction_steps(16_000, -1_597), 10);
    assert_eq!(correction_steps(5, 0), 0);
}

#[cfg(test)]
proptest! {
    #[test]
    fn smoothing_converges(truth in 2_300_000_000_i64..2_500_000_000, start in -50_000_000_i64..50_000_000) {
        let mut smoother = Smoother::new(&SCM3C.smoothing, truth + start);
        for _ in 0..60 {
            smoother.update(truth);
        }
        assert!((smoother.estimate() - truth).abs() <= 100);
    }

    #[test]
    fn smoothing_stays_between(old in -1_000_000_i64..1_000_000, new in -1_000_000_i64..1_000_000) {
        let mut smoother = Smoother::new(&SCM3C.smoothing, old);
        let next = smoother.update(new);
        assert!(next >= old.min(new) && next <= old.max(new));
    }

    #[test]
    fn history_average_is_bounded(values in proptest::collection::vec(1..u16::MAX, 1..16)) {
        let avg = u16::average(&values);
        assert!(avg >= *values.iter().min().unwrap() && avg <= *values.iter().max().unwrap());
    }
}
