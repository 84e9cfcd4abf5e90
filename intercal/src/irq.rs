/* State shared with interrupt handlers.
 *
 * Each field has one writer. Handlers write snapshots and then publish a
 * pending bit with Release; the main loop takes the bits with Acquire and
 * only then reads the snapshots. A listen window is claimed by whichever of
 * frame-start or timer-expiry gets there first, the other one is dropped.
 * */
use crate::mote::Counters;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Pending: u8 {
        const FRAME_START = 0x01;
        const FRAME_END   = 0x02;
        const TIMER       = 0x04;
        const TX_DONE     = 0x08;
    }
}

const IDLE: u8 = 0;
const OPEN: u8 = 1;
const FRAME: u8 = 2;
const TIMEOUT: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameStart {
    pub timestamp: u32,
    pub counters: Counters,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameEnd {
    pub timestamp: u32,
    pub len: u8,
    pub crc_ok: bool,
}

#[derive(Debug)]
pub struct Irq {
    pending: AtomicU8,
    window: AtomicU8,
    start_ticks: AtomicU32,
    start_reference: AtomicU32,
    start_lc: AtomicU32,
    start_adc: AtomicU32,
    end_ticks: AtomicU32,
    end_len: AtomicU8,
    end_crc_ok: AtomicBool,
}

impl Default for Irq {
    fn default() -> Self {
        Self::new()
    }
}

impl Irq {
    pub const fn new() -> Self {
        Self {
            pending: AtomicU8::new(0),
            window: AtomicU8::new(IDLE),
            start_ticks: AtomicU32::new(0),
            start_reference: AtomicU32::new(0),
            start_lc: AtomicU32::new(0),
            start_adc: AtomicU32::new(0),
            end_ticks: AtomicU32::new(0),
            end_len: AtomicU8::new(0),
            end_crc_ok: AtomicBool::new(false),
        }
    }

    fn raise(&self, bits: Pending) {
        self.pending.fetch_or(bits.bits(), Ordering::Release);
    }

    // Main loop side

    /// Start a listen window; stale frame and timer events are discarded.
    pub fn open_window(&self) {
        self.clear(Pending::FRAME_START | Pending::FRAME_END | Pending::TIMER);
        self.window.store(OPEN, Ordering::Release);
    }

    pub fn close_window(&self) {
        self.window.store(IDLE, Ordering::Release);
    }

    pub fn clear(&self, bits: Pending) {
        self.pending.fetch_and(!bits.bits(), Ordering::AcqRel);
    }

    /// Take every pending event.
    pub fn take(&self) -> Pending {
        Pending::from_bits_truncate(self.pending.swap(0, Ordering::Acquire))
    }

    pub fn frame_start(&self) -> FrameStart {
        FrameStart {
            timestamp: self.start_ticks.load(Ordering::Relaxed),
            counters: Counters {
                reference: self.start_reference.load(Ordering::Relaxed),
                lc: self.start_lc.load(Ordering::Relaxed),
                adc: self.start_adc.load(Ordering::Relaxed),
            },
        }
    }

    pub fn frame_end(&self) -> FrameEnd {
        FrameEnd {
            timestamp: self.end_ticks.load(Ordering::Relaxed),
            len: self.end_len.load(Ordering::Relaxed),
            crc_ok: self.end_crc_ok.load(Ordering::Relaxed),
        }
    }

    // Interrupt side

    pub fn on_frame_start(&self, timestamp: u32, counters: Counters) {
        if self
            .window
            .compare_exchange(OPEN, FRAME, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.start_ticks.store(timestamp, Ordering::Relaxed);
        self.start_reference.store(counters.reference, Ordering::Relaxed);
        self.start_lc.store(counters.lc, Ordering::Relaxed);
        self.start_adc.store(counters.adc, Ordering::Relaxed);
        self.raise(Pending::FRAME_START);
    }

    pub fn on_frame_end(&self, timestamp: u32, len: u8, crc_ok: bool) {
        if self.window.load(Ordering::Acquire) != FRAME {
            return;
        }
        self.end_ticks.store(timestamp, Ordering::Relaxed);
        self.end_len.store(len, Ordering::Relaxed);
        self.end_crc_ok.store(crc_ok, Ordering::Relaxed);
        self.raise(Pending::FRAME_END);
    }

    pub fn on_timer_expire(&self) {
        match self.window.load(Ordering::Acquire) {
            FRAME => return,
            OPEN => {
                if self
                    .window
                    .compare_exchange(OPEN, TIMEOUT, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
            }
            _ => {}
        }
        self.raise(Pending::TIMER);
    }

    pub fn on_tx_end(&self, _timestamp: u32) {
        self.raise(Pending::TX_DONE);
    }
}

#[cfg(test)]
const SNAPSHOT: Counters = Counters { reference: 100, lc: 200, adc: 300 };

#[test]
fn frame_claims_window() {
    let irq = Irq::new();
    irq.open_window();
    irq.on_frame_start(42, SNAPSHOT);
    irq.on_timer_expire();
    irq.on_frame_end(50, 5, true);
    assert_eq!(irq.take(), Pending::FRAME_START | Pending::FRAME_END);
    assert_eq!(irq.frame_start(), FrameStart { timestamp: 42, counters: SNAPSHOT });
    assert_eq!(irq.frame_end(), FrameEnd { timestamp: 50, len: 5, crc_ok: true });
}

#[test]
fn timer_claims_window() {
    let irq = Irq::new();
    irq.open_window();
    irq.on_timer_expire();
    irq.on_frame_start(42, SNAPSHOT);
    irq.on_frame_end(50, 5, true);
    assert_eq!(irq.take(), Pending::TIMER);
    assert_eq!(irq.take(), Pending::empty());
}

#[test]
fn frames_outside_window_are_ignored() {
    let irq = Irq::new();
    irq.on_frame_start(42, SNAPSHOT);
    irq.on_frame_end(50, 5, true);
    irq.on_timer_expire();
    irq.on_tx_end(60);
    assert_eq!(irq.take(), Pending::TIMER | Pending::TX_DONE);
}

#[test]
fn open_window_drops_stale_events() {
    let irq = Irq::new();
    irq.on_timer_expire();
    irq.on_tx_end(1);
    irq.open_window();
    assert_eq!(irq.take(), Pending::TX_DONE);
    irq.close_window();
    irq.on_frame_start(42, SNAPSHOT);
    assert_eq!(irq.take(), Pending::empty());
}
