/* A mote and its peer on one simulated timeline.
 *
 * Time is u64 ticks of an ideal timer at `timing.timer_hz`. The LC tank is
 * linear in its code position plus a TX pulling offset and drift, the RC
 * reference is linear in its coarse/fine code. Counters integrate those
 * rates while time advances. The peer is scripted: beacons back to back
 * while the mote sweeps, then one exchange frame per period and a
 * follow-up frame later in the period. Everything random comes from one
 * seeded StdRng so runs repeat exactly.
 * */
use crate::code::{RcCode, TuningWord};
use crate::config::{Config, Role};
use crate::frame::{Frame, FRAME_LEN};
use crate::integrity;
use crate::irq::Irq;
use crate::mote::{Counters, Mote};
use crate::{Error, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};

const IMAGE_LEN: usize = 4096;
const IF_MAX: i64 = 1023;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SimConfig {
    pub seed: u64,
    /// Chance any frame is lost, in either direction.
    pub loss: f64,
    /// Chance a frame that got through fails its CRC.
    pub corruption: f64,
    /// Drop every nth periodic peer frame.
    pub drop_every: Option<u64>,
    /// Replace every nth periodic peer frame with one the mote must reject:
    /// our own role's tag, an unknown tag, then a short frame, in turn.
    pub stray_every: Option<u64>,
    /// Report no IF estimate (zero) with every nth periodic peer frame.
    pub zero_if_every: Option<u64>,
    /// Reset the LC counter on every nth counter read.
    pub counter_reset_every: Option<u64>,
    pub carrier_hz: i64,
    /// RX word that sits exactly on the carrier at t=0.
    pub rx_lock: TuningWord,
    /// TX error of the seed word at t=0.
    pub tx_seed_error_hz: i64,
    pub rc_code: RcCode,
    /// RC error of `rc_code` at t=0.
    pub rc_error_hz: i64,
    pub lc_drift_hz_per_s: f64,
    pub rc_drift_hz_per_s: f64,
    /// Largest LO error that still demodulates.
    pub capture_band_hz: i64,
    pub beacon_interval_ticks: u64,
    /// How long the peer beacons before starting its period.
    pub beacon_ticks: u64,
    pub airtime_ticks: u64,
    /// Peer's second frame, after its periodic one.
    pub follow_up_ticks: u64,
    pub horizon_ticks: u64,
    pub corrupt_image: bool,
}

impl SimConfig {
    /// Scenario sized to `config`: beaconing outlasts one full sweep.
    pub fn new(config: &Config) -> Self {
        let settings = config.sweep.settings().count() as u64;
        let per_setting = u64::from(config.timing.settle_ticks) + u64::from(config.sweep.rx_timeout_ticks);
        let beacon_ticks = settings * per_setting + u64::from(config.timing.timer_hz);
        Self {
            seed: 1,
            loss: 0.0,
            corruption: 0.0,
            drop_every: None,
            stray_every: None,
            zero_if_every: None,
            counter_reset_every: None,
            carrier_hz: config.smoothing.initial_rx_hz,
            rx_lock: TuningWord::clamped(config.sweep.coarse, 13, 8),
            tx_seed_error_hz: 400_000,
            rc_code: RcCode { coarse: 20, fine: 15, superfine: 15 },
            rc_error_hz: 8_000,
            lc_drift_hz_per_s: 0.0,
            rc_drift_hz_per_s: 0.0,
            capture_band_hz: 600_000,
            beacon_interval_ticks: 250,
            beacon_ticks,
            airtime_ticks: 200,
            follow_up_ticks: 70_000,
            horizon_ticks: beacon_ticks + 100 * u64::from(config.schedule.period_ticks),
            corrupt_image: false,
        }
    }

    /// Tick of the peer's first periodic frame.
    pub fn first_exchange(&self, config: &Config) -> u64 {
        self.beacon_ticks + u64::from(config.schedule.period_ticks)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SimStats {
    pub rf_enables: u32,
    pub frames_delivered: u32,
    pub replies_sent: u32,
    pub replies_heard: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Radio {
    Off,
    Rx,
    Tx,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Beacon,
    Periodic(u64),
    FollowUp(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Incoming {
    end: u64,
    payload: [u8; FRAME_LEN],
    len: usize,
    crc_ok: bool,
    if_estimate: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reception {
    Idle,
    /// Catching the first frame starting at or after `from`.
    Listening { from: u64 },
    Receiving(Incoming),
}

/// Whether `k` (counting from zero) is one of every `n`th.
fn every(n: Option<u64>, k: u64) -> bool {
    n.is_some_and(|n| n > 0 && k % n == n - 1)
}

fn next_index(from: u64, origin: u64, step: u64) -> u64 {
    if from <= origin {
        0
    } else {
        (from - origin).div_ceil(step.max(1))
    }
}

pub struct SimMote<'a> {
    irq: &'a Irq,
    config: Config,
    sim: SimConfig,
    rng: StdRng,
    now: u64,
    radio: Radio,
    word: TuningWord,
    rc: RcCode,
    lc_base: i64,
    tx_shift: i64,
    rc_base: i64,
    reference: f64,
    lc: f64,
    timer: Option<u64>,
    tx_end: Option<u64>,
    reception: Reception,
    packet: [u8; FRAME_LEN],
    last_frame: [u8; FRAME_LEN],
    last_len: usize,
    last_if: u16,
    reads: u64,
    reply_heard: Option<u64>,
    image: Vec<u8>,
    crc: u32,
    stats: SimStats,
}

impl<'a> SimMote<'a> {
    pub fn new(irq: &'a Irq, config: &Config, sim: SimConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(sim.seed);
        let mut image = vec![0; IMAGE_LEN];
        rng.fill(&mut image[..]);
        let crc = integrity::checksum(&image) ^ u32::from(sim.corrupt_image);

        let lc_base = sim.carrier_hz - position(config, sim.rx_lock);
        let tx_target = sim.carrier_hz + config.tx.offset_hz + sim.tx_seed_error_hz;
        let tx_shift = tx_target - (lc_base + position(config, config.tx.seed));
        let rc = config.sensitivity.rc;
        let rc_base = i64::from(config.timing.rc_target_hz) + sim.rc_error_hz
            - i64::from(sim.rc_code.coarse) * rc.coarse
            - i64::from(sim.rc_code.fine) * rc.fine;

        Self {
            irq,
            config: *config,
            sim,
            rng,
            now: 0,
            radio: Radio::Off,
            word: sim.rx_lock,
            rc: sim.rc_code,
            lc_base,
            tx_shift,
            rc_base,
            reference: 0.0,
            lc: 0.0,
            timer: None,
            tx_end: None,
            reception: Reception::Idle,
            packet: [0; FRAME_LEN],
            last_frame: [0; FRAME_LEN],
            last_len: 0,
            last_if: 0,
            reads: 0,
            reply_heard: None,
            image,
            crc,
            stats: SimStats::default(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    fn seconds(&self) -> f64 {
        self.now as f64 / f64::from(self.config.timing.timer_hz)
    }

    fn lc_hz(&self, word: TuningWord, radio: Radio) -> i64 {
        let shift = if radio == Radio::Tx { self.tx_shift } else { 0 };
        let drift = (self.sim.lc_drift_hz_per_s * self.seconds()) as i64;
        self.lc_base + position(&self.config, word) + shift + drift
    }

    fn rc_hz(&self) -> f64 {
        let rc = self.config.sensitivity.rc;
        let code = i64::from(self.rc.coarse) * rc.coarse + i64::from(self.rc.fine) * rc.fine;
        (self.rc_base + code) as f64 + self.sim.rc_drift_hz_per_s * self.seconds()
    }

    /// RX LO error against the peer's carrier with `word` programmed.
    pub fn rx_error_hz(&self, word: TuningWord) -> i64 {
        self.lc_hz(word, Radio::Rx) - self.sim.carrier_hz
    }

    /// TX error against where the peer listens for our replies.
    pub fn tx_error_hz(&self, word: TuningWord) -> i64 {
        self.lc_hz(word, Radio::Tx) - (self.sim.carrier_hz + self.config.tx.offset_hz)
    }

    pub fn rc_error_hz(&self) -> i64 {
        self.rc_hz() as i64 - i64::from(self.config.timing.rc_target_hz)
    }

    fn counters(&self) -> Counters {
        Counters {
            reference: self.reference as u64 as u32,
            lc: self.lc as u64 as u32,
            // ADC clock isn't modelled, it just follows the timer
            adc: self.now as u32,
        }
    }

    fn advance(&mut self, to: u64) {
        if to <= self.now {
            return;
        }
        let dt = (to - self.now) as f64 / f64::from(self.config.timing.timer_hz);
        self.reference += self.rc_hz() * dt;
        if self.radio != Radio::Off {
            let lc_hz = self.lc_hz(self.word, self.radio) as f64;
            self.lc += lc_hz * dt / f64::from(self.config.timing.lc_divider);
        }
        self.now = to;
    }

    fn peer_role(&self) -> Role {
        self.config.role.peer()
    }

    /// The peer's next transmission starting at or after `from`.
    fn next_frame(&self, from: u64) -> Option<(u64, Kind)> {
        let sim = &self.sim;
        let period = u64::from(self.config.schedule.period_ticks);
        let first = sim.first_exchange(&self.config);

        let beacon = Some(next_index(from, 0, sim.beacon_interval_ticks) * sim.beacon_interval_ticks)
            .filter(|&at| at < sim.beacon_ticks)
            .map(|at| (at, Kind::Beacon));
        let k = next_index(from, first, period);
        let periodic = Some((first + k * period, Kind::Periodic(k)));
        let k = next_index(from, first + sim.follow_up_ticks, period);
        let at = first + sim.follow_up_ticks + k * period;
        // An initiator's peer only follows up on a reply it heard this period
        let answered = self
            .reply_heard
            .is_some_and(|heard| heard + sim.follow_up_ticks >= at && heard < at);
        let follow_up = (self.config.role == Role::Responder || answered).then_some((at, Kind::FollowUp(k)));

        [beacon, periodic, follow_up].into_iter().flatten().min_by_key(|&(at, _)| at)
    }

    fn payload(&self, at: u64, kind: Kind) -> [u8; FRAME_LEN] {
        let frame = match kind {
            Kind::Beacon => {
                let seconds = (self.sim.beacon_ticks - at) / u64::from(self.config.timing.timer_hz);
                Frame::Beacon { countdown: seconds.min(255) as u8 }
            }
            Kind::Periodic(k) | Kind::FollowUp(k) => Frame::Exchange {
                role: self.peer_role(),
                sequence: k as u32,
            },
        };
        frame.encode()
    }

    /// A periodic frame that has to be thrown away on arrival.
    fn stray(&self, k: u64) -> ([u8; FRAME_LEN], usize) {
        let n = self.sim.stray_every.unwrap_or(1).max(1);
        let mut payload = self.payload(self.now, Kind::Periodic(k));
        match (k / n) % 3 {
            0 => {
                let ours = Frame::Exchange { role: self.config.role, sequence: k as u32 };
                (ours.encode(), FRAME_LEN)
            }
            1 => {
                payload[0] = b'X';
                (payload, FRAME_LEN)
            }
            _ => (payload, 3),
        }
    }

    /// Whether the frame starting now gets through to us.
    fn catch(&mut self, kind: Kind) -> Option<Incoming> {
        if self.radio != Radio::Rx {
            return None;
        }
        if matches!(kind, Kind::Periodic(k) if every(self.sim.drop_every, k)) {
            return None;
        }
        let error = self.rx_error_hz(self.word);
        if error.abs() > self.sim.capture_band_hz || self.rng.gen::<f64>() < self.sim.loss {
            return None;
        }
        let crc_ok = self.rng.gen::<f64>() >= self.sim.corruption;
        let intermediate = self.config.intermediate;
        let counts = error * i64::from(intermediate.counts_per_fine) / self.config.sensitivity.lc.fine.abs();
        let if_estimate = match kind {
            Kind::Periodic(k) if every(self.sim.zero_if_every, k) => 0,
            _ => (i64::from(intermediate.target) - counts).clamp(1, IF_MAX) as u16,
        };
        let (payload, len) = match kind {
            Kind::Periodic(k) if every(self.sim.stray_every, k) => self.stray(k),
            _ => (self.payload(self.now, kind), FRAME_LEN),
        };
        Some(Incoming {
            end: self.now + self.sim.airtime_ticks,
            payload,
            len,
            crc_ok,
            if_estimate,
        })
    }
}

fn position(config: &Config, word: TuningWord) -> i64 {
    let lc = config.sensitivity.lc;
    i64::from(word.coarse()) * lc.coarse.abs()
        + i64::from(word.mid()) * lc.mid.abs()
        + i64::from(word.fine()) * lc.fine.abs()
}

impl Mote for SimMote<'_> {
    fn enable_rx(&mut self) {
        self.radio = Radio::Rx;
        self.reception = Reception::Idle;
        self.stats.rf_enables += 1;
    }

    fn enable_tx(&mut self) {
        self.radio = Radio::Tx;
        self.reception = Reception::Idle;
        self.stats.rf_enables += 1;
    }

    fn rf_off(&mut self) {
        self.radio = Radio::Off;
        self.reception = Reception::Idle;
    }

    fn receive_now(&mut self) {
        if self.radio == Radio::Rx {
            self.reception = Reception::Listening { from: self.now };
        }
    }

    fn transmit_now(&mut self) {
        if self.radio != Radio::Tx {
            return;
        }
        self.tx_end = Some(self.now + self.sim.airtime_ticks);
        self.stats.replies_sent += 1;
        let ours = matches!(
            Frame::decode(&self.packet),
            Ok(Frame::Exchange { role, .. }) if role == self.config.role
        );
        let error = self.tx_error_hz(self.word);
        if ours && error.abs() <= self.sim.capture_band_hz && self.rng.gen::<f64>() >= self.sim.loss {
            self.stats.replies_heard += 1;
            self.reply_heard = Some(self.now);
        }
    }

    fn load_packet(&mut self, payload: &[u8]) {
        let len = payload.len().min(FRAME_LEN);
        self.packet = [0; FRAME_LEN];
        self.packet[..len].copy_from_slice(&payload[..len]);
    }

    fn set_tuning(&mut self, word: TuningWord) {
        self.word = word;
    }

    fn read_tick_counters(&mut self) -> Counters {
        if every(self.sim.counter_reset_every, self.reads) {
            self.lc = 0.0;
        }
        self.reads += 1;
        self.counters()
    }

    fn arm_timeout(&mut self, deadline: u32) {
        let delta = deadline.wrapping_sub(self.now as u32) as i32;
        self.timer = Some(self.now + delta.max(0) as u64);
    }

    fn cancel_timeout(&mut self) {
        self.timer = None;
    }

    fn now_ticks(&self) -> u32 {
        self.now as u32
    }

    fn rc_code(&self) -> RcCode {
        self.rc
    }

    fn set_rc_code(&mut self, code: RcCode) {
        self.rc = code;
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len().min(self.last_len);
        buf[..len].copy_from_slice(&self.last_frame[..len]);
        len
    }

    fn if_estimate(&self) -> u16 {
        self.last_if
    }

    fn program_image(&self) -> &[u8] {
        &self.image
    }

    fn program_crc(&self) -> u32 {
        self.crc
    }

    fn wait_for_interrupt(&mut self) -> Result<()> {
        loop {
            let frame = match self.reception {
                Reception::Idle => None,
                Reception::Listening { from } => self.next_frame(from).map(|(at, kind)| (at, Some(kind))),
                Reception::Receiving(incoming) => Some((incoming.end, None)),
            };
            let Some(at) = [self.timer, frame.map(|(at, _)| at), self.tx_end].into_iter().flatten().min() else {
                // Nothing armed, nothing could ever wake us
                return Err(Error::Halted);
            };
            if at > self.sim.horizon_ticks {
                self.advance(self.sim.horizon_ticks);
                return Err(Error::Halted);
            }
            self.advance(at);

            let mut fired = false;
            if self.timer == Some(at) {
                self.timer = None;
                self.irq.on_timer_expire();
                fired = true;
            }
            if self.tx_end == Some(at) {
                self.tx_end = None;
                self.irq.on_tx_end(at as u32);
                fired = true;
            }
            match (self.reception, frame) {
                (Reception::Receiving(incoming), _) if incoming.end == at => {
                    self.reception = Reception::Idle;
                    self.last_frame = incoming.payload;
                    self.last_len = incoming.len;
                    self.last_if = incoming.if_estimate;
                    self.stats.frames_delivered += 1;
                    self.irq.on_frame_end(at as u32, incoming.len as u8, incoming.crc_ok);
                    fired = true;
                }
                (Reception::Listening { .. }, Some((start, Some(kind)))) if start == at => match self.catch(kind) {
                    Some(incoming) => {
                        self.reception = Reception::Receiving(incoming);
                        self.irq.on_frame_start(at as u32, self.counters());
                        fired = true;
                    }
                    None => self.reception = Reception::Listening { from: at + 1 },
                },
                _ => {}
            }
            if fired {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
fn scenario() -> (Config, SimConfig) {
    let config = crate::config::board::SCM3C_INITIATOR;
    (config, SimConfig::new(&config))
}

#[test]
fn lock_word_sits_on_carrier() {
    let (config, sim) = scenario();
    let irq = Irq::new();
    let mote = SimMote::new(&irq, &config, sim);
    assert_eq!(mote.rx_error_hz(sim.rx_lock), 0);
    assert_eq!(mote.tx_error_hz(config.tx.seed), sim.tx_seed_error_hz);
    assert_eq!(mote.rc_error_hz(), sim.rc_error_hz);
    // One fine step up moves the LO by exactly the fine sensitivity
    let up = TuningWord::clamped(23, 13, 9);
    assert_eq!(mote.rx_error_hz(up), config.sensitivity.lc.fine);
}

#[test]
fn counters_follow_the_oscillators() {
    let (config, sim) = scenario();
    let irq = Irq::new();
    let mut mote = SimMote::new(&irq, &config, SimConfig { rc_error_hz: 0, ..sim });
    mote.set_tuning(sim.rx_lock);
    mote.enable_rx();
    let start = mote.read_tick_counters();
    mote.arm_timeout(config.timing.measurement_ticks);
    mote.wait_for_interrupt().unwrap();
    let end = mote.read_tick_counters();
    // 50 ms of a 2 MHz reference and a 2.4025 GHz tank divided by 960
    assert_eq!(end.reference - start.reference, 100_000);
    let lc = end.lc - start.lc;
    assert!((125_130..=125_131).contains(&lc), "{lc}");
}

#[test]
fn timer_in_the_past_fires_now() {
    let (config, sim) = scenario();
    let irq = Irq::new();
    let mut mote = SimMote::new(&irq, &config, sim);
    mote.arm_timeout(100);
    mote.wait_for_interrupt().unwrap();
    assert_eq!(mote.now_ticks(), 100);
    mote.arm_timeout(50);
    mote.wait_for_interrupt().unwrap();
    assert_eq!(mote.now_ticks(), 100);
}

#[test]
fn idle_mote_halts() {
    let (config, sim) = scenario();
    let irq = Irq::new();
    let mut mote = SimMote::new(&irq, &config, sim);
    assert!(matches!(mote.wait_for_interrupt(), Err(Error::Halted)));
    let mut mote = SimMote::new(&irq, &config, SimConfig { horizon_ticks: 5, ..sim });
    mote.arm_timeout(10);
    assert!(matches!(mote.wait_for_interrupt(), Err(Error::Halted)));
    assert_eq!(mote.now(), 5);
}

#[test]
fn beacons_reach_a_tuned_listener() {
    let (config, sim) = scenario();
    let irq = Irq::new();
    let mut mote = SimMote::new(&irq, &config, sim);
    mote.set_tuning(sim.rx_lock);
    mote.enable_rx();
    irq.open_window();
    mote.receive_now();
    mote.arm_timeout(1_000);
    mote.wait_for_interrupt().unwrap();
    assert_eq!(irq.take(), crate::irq::Pending::FRAME_START);
    assert_eq!(irq.frame_start().timestamp, 0);
    mote.cancel_timeout();
    mote.wait_for_interrupt().unwrap();
    let end = irq.frame_end();
    assert!(end.crc_ok);
    assert_eq!(end.timestamp, sim.airtime_ticks as u32);
    let mut buf = [0; FRAME_LEN];
    assert_eq!(mote.read_frame(&mut buf), FRAME_LEN);
    let expected = (sim.beacon_ticks / u64::from(config.timing.timer_hz)) as u8;
    assert_eq!(Frame::decode(&buf).unwrap(), Frame::Beacon { countdown: expected });
    assert_eq!(mote.if_estimate(), config.intermediate.target);
}

#[test]
fn detuned_listener_hears_nothing() {
    let (config, sim) = scenario();
    let irq = Irq::new();
    let mut mote = SimMote::new(&irq, &config, sim);
    mote.set_tuning(TuningWord::clamped(23, 20, 8));
    mote.enable_rx();
    irq.open_window();
    mote.receive_now();
    mote.arm_timeout(1_000);
    mote.wait_for_interrupt().unwrap();
    assert_eq!(irq.take(), crate::irq::Pending::TIMER);
}

#[test]
fn counter_resets_on_schedule() {
    let (config, sim) = scenario();
    let irq = Irq::new();
    let mut mote = SimMote::new(&irq, &config, SimConfig { counter_reset_every: Some(2), ..sim });
    mote.enable_rx();
    mote.arm_timeout(config.timing.measurement_ticks);
    mote.wait_for_interrupt().unwrap();
    let first = mote.read_tick_counters();
    assert!(first.lc > 100_000);
    // Second read is the reset one, the counter starts over from zero
    assert_eq!(mote.read_tick_counters().lc, 0);
    let third = mote.read_tick_counters();
    assert_eq!((third.reference, third.lc), (first.reference, 0));
}

#[test]
fn stray_frames_cycle_through_rejects() {
    let (config, sim) = scenario();
    let irq = Irq::new();
    let mote = SimMote::new(&irq, &config, SimConfig { stray_every: Some(1), ..sim });
    let decoded = (0..3)
        .map(|k| {
            let (payload, len) = mote.stray(k);
            Frame::decode(&payload[..len])
        })
        .collect::<Vec<_>>();
    assert!(matches!(decoded[0], Ok(Frame::Exchange { role: Role::Initiator, sequence: 0 })));
    assert!(matches!(decoded[1], Err(Error::FrameTag(b'X'))));
    assert!(matches!(decoded[2], Err(Error::FrameLength(3))));
}
