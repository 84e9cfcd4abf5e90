/* Listen scheduling against the peer's period.
 *
 * Every wake time derives from the start-of-frame tick of the last good
 * receive, never from the time the exchange finished, so processing latency
 * doesn't accumulate into the schedule. Tick arithmetic wraps at 2^32.
 * */
use crate::config::Schedule;
#[cfg(test)] use proptest::prelude::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// Open a short listen window at this tick.
    Listen(u32),
    /// Retry budget exhausted; stay dark until the next anchored boundary.
    LongSleep(u32),
}

impl Wake {
    pub fn at(self) -> u32 {
        match self {
            Wake::Listen(at) | Wake::LongSleep(at) => at,
        }
    }
}

/// True if `a` comes strictly after `b` on the wrapping timeline.
pub fn after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DutyCycle {
    period: u32,
    lead: u32,
    spacing: u32,
    max_retries: u8,
    anchor: Option<u32>,
    retries: u8,
}

impl DutyCycle {
    pub fn new(schedule: &Schedule) -> Self {
        Self {
            period: schedule.period_ticks,
            lead: schedule.lead_ticks,
            spacing: schedule.retry_spacing_ticks,
            max_retries: schedule.max_retries,
            anchor: None,
            retries: 0,
        }
    }

    pub fn anchor(&self) -> Option<u32> {
        self.anchor
    }

    pub fn retries(&self) -> u8 {
        self.retries
    }

    /// When the peer's next frame is due.
    pub fn expected(&self) -> Option<u32> {
        self.anchor.map(|anchor| anchor.wrapping_add(self.period))
    }

    /// A frame started at `sfd`.
    pub fn on_receive(&mut self, sfd: u32) -> Wake {
        self.anchor = Some(sfd);
        self.retries = 0;
        Wake::Listen(sfd.wrapping_add(self.period).wrapping_sub(self.lead))
    }

    /// The listen window opened at `opened` closed empty; `now` is after it.
    pub fn on_timeout(&mut self, opened: u32, now: u32) -> Wake {
        self.retries = self.retries.saturating_add(1);
        if self.retries <= self.max_retries {
            return Wake::Listen(opened.wrapping_add(self.spacing));
        }
        self.retries = 0;
        Wake::LongSleep(self.next_boundary(now))
    }

    fn next_boundary(&self, now: u32) -> u32 {
        let Some(anchor) = self.anchor else {
            return now.wrapping_add(self.period);
        };
        let period = u64::from(self.period.max(1));
        let periods = u64::from(now.wrapping_sub(anchor)) / period + 1;
        let mut at = anchor
            .wrapping_add((periods * period) as u32)
            .wrapping_sub(self.lead);
        if !after(at, now) {
            at = at.wrapping_add(self.period);
        }
        at
    }
}

#[cfg(test)]
const SCM3C: Schedule = crate::config::board::SCM3C_INITIATOR.schedule;

#[test]
fn anchors_to_frame_start_not_now() {
    let mut duty = DutyCycle::new(&SCM3C);
    let p = SCM3C.period_ticks;
    let t0 = 1_000_000;
    for t in [t0, t0 + p, t0 + 2 * p] {
        // The exchange finishes long after the frame started
        let wake = duty.on_receive(t);
        assert_eq!(duty.expected(), Some(t + p));
        assert_eq!(wake, Wake::Listen(t + p - SCM3C.lead_ticks));
    }
}

#[test]
fn six_misses_then_success_stays_in_budget() {
    let mut duty = DutyCycle::new(&SCM3C);
    let mut opened = match duty.on_receive(0) {
        Wake::Listen(at) => at,
        wake => panic!("{wake:?}"),
    };
    for attempt in 1..=6 {
        let wake = duty.on_timeout(opened, opened + SCM3C.listen_ticks);
        assert_eq!(wake, Wake::Listen(opened + SCM3C.retry_spacing_ticks));
        assert_eq!(duty.retries(), attempt);
        opened = wake.at();
    }
    let sfd = opened + 100;
    assert_eq!(duty.on_receive(sfd), Wake::Listen(sfd + SCM3C.period_ticks - SCM3C.lead_ticks));
    assert_eq!(duty.retries(), 0);
}

#[test]
fn seventh_miss_sleeps_to_boundary() {
    let mut duty = DutyCycle::new(&SCM3C);
    let p = SCM3C.period_ticks;
    let mut opened = duty.on_receive(0).at();
    for _ in 0..6 {
        opened = duty.on_timeout(opened, opened + SCM3C.listen_ticks).at();
    }
    let wake = duty.on_timeout(opened, opened + SCM3C.listen_ticks);
    // Next boundary after the missed period, same phase as the anchor
    assert_eq!(wake, Wake::LongSleep(2 * p - SCM3C.lead_ticks));
    assert_eq!(duty.retries(), 0);
    assert_eq!(duty.anchor(), Some(0));
}

#[test]
fn boundary_wraps() {
    let mut duty = DutyCycle::new(&Schedule { max_retries: 0, ..SCM3C });
    let anchor = u32::MAX - 10;
    duty.on_receive(anchor);
    let now = anchor.wrapping_add(SCM3C.period_ticks + 3_000);
    let wake = duty.on_timeout(now - 3_000, now);
    assert_eq!(wake, Wake::LongSleep(anchor.wrapping_add(2 * SCM3C.period_ticks - SCM3C.lead_ticks)));
    assert!(after(wake.at(), now));
}

#[test]
fn unanchored_sleep_is_one_period() {
    let mut duty = DutyCycle::new(&Schedule { max_retries: 0, ..SCM3C });
    assert_eq!(duty.on_timeout(0, 10), Wake::LongSleep(10 + SCM3C.period_ticks));
}

#[cfg(test)]
proptest! {
    #[test]
    fn wake_ignores_processing_delay(t0: u32, count in 1..20_u32) {
        let mut duty = DutyCycle::new(&SCM3C);
        let p = SCM3C.period_ticks;
        let mut last = t0;
        for k in 0..count {
            last = t0.wrapping_add(k.wrapping_mul(p));
            duty.on_receive(last);
        }
        assert_eq!(duty.expected(), Some(last.wrapping_add(p)));
    }

    #[test]
    fn long_sleep_is_always_ahead(anchor: u32, elapsed in 0..50_000_000_u32) {
        let mut duty = DutyCycle::new(&Schedule { max_retries: 0, ..SCM3C });
        duty.on_receive(anchor);
        let now = anchor.wrapping_add(elapsed);
        let at = duty.on_timeout(now, now).at();
        assert!(after(at, now));
        assert!(at.wrapping_sub(now) <= SCM3C.period_ticks);
        // Same phase as the anchor
        let phase = at.wrapping_add(SCM3C.lead_ticks).wrapping_sub(anchor) % SCM3C.period_ticks;
        assert_eq!(phase, 0);
    }
}
