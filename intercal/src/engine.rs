/* Boot to steady state: RX sweep, TX seed, sync to the peer, then one
 * listen/calibrate/reply cycle per period for as long as we have power.
 *
 * Every wait is a wait on bits raised by the interrupt handlers in `Irq`;
 * the mote's `wait_for_interrupt` is the only place the loop suspends.
 * */
use crate::arith::{Calibrator, MeasurementWindow};
use crate::code::{FieldDeltas, RcDeltas, TuningWord};
use crate::config::{Config, Role, SWEEP_CAPACITY};
use crate::frame::{Frame, FRAME_LEN};
use crate::guard::{CandidatePair, EdgeGuard};
use crate::integrity;
use crate::irq::{FrameStart, Irq, Pending};
use crate::mote::{Counters, Mote};
use crate::schedule::{DutyCycle, Wake};
use crate::telemetry::{Session, Telemetry};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    SweepRx,
    SweepTx,
    SyncTimer,
    ContinuousCal,
    MutualCommunication,
}

/// A frame that passed CRC, length and tag checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    pub start: FrameStart,
    pub frame: Frame,
    pub if_estimate: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Heard {
    Frame(Received),
    Rejected,
    Timeout,
}

const WINDOW_EVENTS: Pending = Pending::FRAME_START.union(Pending::FRAME_END).union(Pending::TIMER);

pub struct Engine<'a, M: Mote> {
    mote: M,
    irq: &'a Irq,
    config: Config,
    phase: Phase,
    rx: CandidatePair,
    tx: CandidatePair,
    rx_guard: EdgeGuard,
    tx_guard: EdgeGuard,
    calibrator: Calibrator,
    duty: DutyCycle,
    wake: Wake,
    sequence: u32,
    peer_sequence: Option<u32>,
    telemetry: Telemetry,
    // Bits taken from `irq` but not yet consumed
    pending: Pending,
}

impl<'a, M: Mote> Engine<'a, M> {
    pub fn new(mote: M, irq: &'a Irq, config: Config) -> Self {
        let rx_guard = EdgeGuard::new(&config.guard, config.guard.rx_offset);
        let tx_guard = EdgeGuard::new(&config.guard, config.guard.tx_offset);
        let sweep_start = TuningWord::clamped(config.sweep.coarse, config.sweep.mid[0], config.sweep.fine[0]);
        Self {
            mote,
            irq,
            phase: Phase::SweepRx,
            rx: rx_guard.derive(sweep_start),
            tx: tx_guard.derive(config.tx.seed),
            rx_guard,
            tx_guard,
            calibrator: Calibrator::new(&config),
            duty: DutyCycle::new(&config.schedule),
            wake: Wake::Listen(0),
            sequence: 0,
            peer_sequence: None,
            telemetry: Telemetry::default(),
            pending: Pending::empty(),
            config,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub fn mote(&self) -> &M {
        &self.mote
    }

    pub fn session(&self) -> Session {
        Session {
            phase: self.phase,
            rx: self.rx,
            tx: self.tx,
            rc: self.mote.rc_code(),
            anchor: self.duty.anchor(),
            sequence: self.sequence,
            rx_hz: self.calibrator.rx_estimate(),
            tx_hz: self.calibrator.tx_estimate(),
            rc_hz: self.calibrator.rc_estimate(),
        }
    }

    /// Only returns on error. `Error::Integrity` means the core must halt.
    pub fn run(&mut self) -> Result<()> {
        self.boot()?;
        loop {
            self.step()?;
        }
    }

    /// Program check, must pass before anything touches the radio.
    pub fn boot(&mut self) -> Result<()> {
        if let Err(e) = integrity::verify(self.mote.program_image(), self.mote.program_crc()) {
            error!("{e}, halting");
            return Err(e);
        }
        self.mote.rf_off();
        info!("Program image verified, role {:?}", self.config.role);
        Ok(())
    }

    /// Advance the state machine by one phase, or by one cycle once synced.
    pub fn step(&mut self) -> Result<()> {
        match self.phase {
            Phase::SweepRx => self.sweep_rx(),
            Phase::SweepTx => self.sweep_tx(),
            Phase::SyncTimer => self.sync_timer(),
            Phase::ContinuousCal | Phase::MutualCommunication => self.cycle(),
        }
    }

    fn enter(&mut self, phase: Phase) {
        if phase != self.phase {
            debug!("{:?} -> {:?}", self.phase, phase);
        }
        self.phase = phase;
    }

    // Waiting

    fn wait(&mut self, want: Pending) -> Result<Pending> {
        loop {
            self.pending |= self.irq.take();
            let got = self.pending & want;
            if !got.is_empty() {
                self.pending.remove(got);
                return Ok(got);
            }
            self.mote.wait_for_interrupt()?;
        }
    }

    fn clear(&mut self, bits: Pending) {
        self.irq.clear(bits);
        self.pending.remove(bits);
    }

    fn sleep_until(&mut self, deadline: u32) -> Result<()> {
        self.clear(Pending::TIMER);
        self.mote.arm_timeout(deadline);
        self.wait(Pending::TIMER)?;
        Ok(())
    }

    fn delay(&mut self, ticks: u32) -> Result<()> {
        let deadline = self.mote.now_ticks().wrapping_add(ticks);
        self.sleep_until(deadline)
    }

    /// Listen on the current tuning until a frame or the timeout. No timeout
    /// blocks until something arrives.
    fn listen(&mut self, timeout: Option<u32>) -> Result<Heard> {
        self.mote.enable_rx();
        self.pending.remove(WINDOW_EVENTS);
        self.irq.open_window();
        self.mote.receive_now();
        if let Some(ticks) = timeout {
            self.mote.arm_timeout(self.mote.now_ticks().wrapping_add(ticks));
        }

        let event = self.wait(Pending::FRAME_START | Pending::TIMER)?;
        if !event.contains(Pending::FRAME_START) {
            self.irq.close_window();
            self.mote.rf_off();
            self.telemetry.timeouts += 1;
            return Ok(Heard::Timeout);
        }
        self.mote.cancel_timeout();
        let start = self.irq.frame_start();
        self.wait(Pending::FRAME_END)?;
        let end = self.irq.frame_end();
        self.irq.close_window();

        if !end.crc_ok {
            self.telemetry.crc_failures += 1;
            warn!("CRC failure on frame at {}", start.timestamp);
            return Ok(Heard::Rejected);
        }
        let mut buf = [0; 2 * FRAME_LEN];
        let len = self.mote.read_frame(&mut buf).min(buf.len());
        let frame = match Frame::decode(&buf[..len]) {
            Ok(frame) => frame,
            Err(e) => {
                self.telemetry.rejected += 1;
                warn!("Dropping frame: {e}");
                return Ok(Heard::Rejected);
            }
        };
        if let Frame::Exchange { role, .. } = frame {
            if role == self.config.role {
                self.telemetry.rejected += 1;
                debug!("Ignoring frame tagged with our own role");
                return Ok(Heard::Rejected);
            }
        }
        self.telemetry.received += 1;
        Ok(Heard::Frame(Received {
            start,
            frame,
            if_estimate: self.mote.if_estimate(),
        }))
    }

    fn measure(&mut self) -> Result<MeasurementWindow> {
        let opened = self.mote.now_ticks();
        let start = self.mote.read_tick_counters();
        self.sleep_until(opened.wrapping_add(self.config.timing.measurement_ticks))?;
        Ok(self.window_since(opened, start))
    }

    /// Close a window opened at `opened` with `start` on the counters.
    fn window_since(&mut self, opened: u32, start: Counters) -> MeasurementWindow {
        let end = self.mote.read_tick_counters();
        MeasurementWindow {
            start,
            end,
            nominal_ticks: self.mote.now_ticks().wrapping_sub(opened),
        }
    }

    // Phases

    fn sweep_rx(&mut self) -> Result<()> {
        let sweep = self.config.sweep;
        info!("RX sweep at coarse {}, mid {:?}, fine {:?}", sweep.coarse, sweep.mid, sweep.fine);
        let mut pool = heapless::Vec::<TuningWord, SWEEP_CAPACITY>::new();
        let mut last_beacon = None;
        for word in sweep.settings() {
            self.mote.rf_off();
            self.mote.set_tuning(word);
            self.delay(self.config.timing.settle_ticks)?;
            let Heard::Frame(rx) = self.listen(Some(sweep.rx_timeout_ticks))? else {
                continue;
            };
            let Frame::Beacon { countdown } = rx.frame else {
                continue;
            };
            debug!("Beacon at {:?}, IF {}", word.unpack(), rx.if_estimate);
            last_beacon = Some((rx.start.timestamp, countdown));
            if pool.push(word).is_err() {
                debug!("Sweep pool full, not keeping {:?}", word.unpack());
            }
        }
        self.mote.rf_off();

        // Settings go in ascending, so the middle entry is the median
        let Some(&median) = pool.get(pool.len() / 2) else {
            warn!("RX sweep heard no beacons, sweeping again");
            return Ok(());
        };
        self.rx = self.guarded_rx(median);
        info!(
            "RX sweep: {} hits, primary {:?}, alternate {:?}",
            pool.len(),
            self.rx.primary.unpack(),
            self.rx.alternate.unpack()
        );

        if let Some((sfd, countdown)) = last_beacon {
            let remaining = u32::from(countdown).saturating_mul(self.config.timing.timer_hz);
            debug!("Peer stops beaconing in {countdown} s");
            self.sleep_until(sfd.wrapping_add(remaining))?;
        }
        self.enter(Phase::SweepTx);
        Ok(())
    }

    fn sweep_tx(&mut self) -> Result<()> {
        self.tx = self.guarded_tx(self.config.tx.seed);
        info!(
            "TX seeded at {:?}, alternate {:?}",
            self.tx.primary.unpack(),
            self.tx.alternate.unpack()
        );
        self.enter(Phase::SyncTimer);
        Ok(())
    }

    fn sync_timer(&mut self) -> Result<()> {
        self.mote.set_tuning(self.rx.primary);
        loop {
            let Heard::Frame(rx) = self.listen(None)? else {
                continue;
            };
            let Frame::Exchange { sequence, .. } = rx.frame else {
                continue;
            };
            self.wake = self.duty.on_receive(rx.start.timestamp);
            self.peer_sequence = Some(sequence);
            info!("Synced to peer at tick {}, sequence {sequence}", rx.start.timestamp);
            self.enter(Phase::ContinuousCal);
            return Ok(());
        }
    }

    fn cycle(&mut self) -> Result<()> {
        self.enter(Phase::ContinuousCal);
        let opened = self.wake.at();
        self.sleep_until(opened)?;
        self.mote.set_tuning(self.rx.primary);
        match self.listen(Some(self.config.schedule.listen_ticks))? {
            Heard::Frame(Received { frame: Frame::Exchange { sequence, .. }, start, if_estimate }) => {
                self.wake = self.duty.on_receive(start.timestamp);
                self.track_peer(sequence);
                self.exchange(start, if_estimate)
            }
            _ => {
                self.miss(opened);
                Ok(())
            }
        }
    }

    fn miss(&mut self, opened: u32) {
        self.wake = self.duty.on_timeout(opened, self.mote.now_ticks());
        match self.wake {
            Wake::Listen(at) => {
                self.telemetry.retries += 1;
                debug!("Missed peer, retry {} at {at}", self.duty.retries());
            }
            Wake::LongSleep(until) => {
                self.telemetry.long_sleeps += 1;
                warn!("Peer silent for {} retries, sleeping until {until}", self.config.schedule.max_retries);
            }
        }
    }

    fn track_peer(&mut self, sequence: u32) {
        if let Some(last) = self.peer_sequence {
            let step = sequence.wrapping_sub(last);
            if step > 1 && step < 1 << 31 {
                self.telemetry.peer_gaps = self.telemetry.peer_gaps.saturating_add(step - 1);
                warn!("Peer sequence jumped {last} -> {sequence}");
            }
        }
        self.peer_sequence = Some(sequence);
    }

    /// Calibrate RX, then RC, then TX, then reply. RC has to be settled
    /// before the TX window since both windows count against it.
    fn exchange(&mut self, start: FrameStart, if_estimate: u16) -> Result<()> {
        self.enter(Phase::MutualCommunication);
        let anchor = start.timestamp;

        // The RX word has been counting since start-of-frame
        self.sleep_until(anchor.wrapping_add(self.config.timing.measurement_ticks))?;
        let rx_window = self.window_since(anchor, start.counters);

        match self.calibrator.intermediate(if_estimate) {
            Ok(Some(deltas)) => self.adjust_rx(deltas),
            Ok(None) => {}
            Err(e) => {
                self.telemetry.dropped_if += 1;
                warn!("Dropping IF sample: {e}");
            }
        }

        match self.calibrator.rx_window(&rx_window) {
            Ok(Some(deltas)) => self.adjust_rc(deltas),
            Ok(None) => {}
            Err(e) => self.degenerate(e),
        }

        self.mote.set_tuning(self.tx.primary);
        self.mote.enable_tx();
        self.delay(self.config.timing.tx_settle_ticks)?;
        let window = self.measure()?;
        match self.calibrator.tx_window(&window) {
            Ok(Some(deltas)) => self.adjust_tx(deltas),
            Ok(None) => {}
            Err(e) => self.degenerate(e),
        }
        self.mote.rf_off();

        let reply_at = anchor.wrapping_add(self.config.exchange.reply_delay_ticks);
        match self.config.role {
            Role::Initiator => {
                self.reply(reply_at)?;
                self.follow_up()?;
            }
            Role::Responder => {
                let at = self.follow_up()?.unwrap_or(reply_at);
                self.reply(at)?;
            }
        }

        // RX idle until the next window
        self.mote.set_tuning(self.rx.primary);
        self.mote.enable_rx();
        self.enter(Phase::ContinuousCal);
        Ok(())
    }

    /// Listen for the peer's second frame of the period. Returns when it
    /// ended, which is when a responder sends its reply.
    fn follow_up(&mut self) -> Result<Option<u32>> {
        self.mote.set_tuning(self.rx.primary);
        match self.listen(Some(self.config.exchange.reply_listen_ticks))? {
            Heard::Frame(Received { frame: Frame::Exchange { .. }, .. }) => {
                self.telemetry.follow_ups += 1;
                Ok(Some(self.irq.frame_end().timestamp))
            }
            _ => Ok(None),
        }
    }

    fn reply(&mut self, at: u32) -> Result<()> {
        let frame = Frame::Exchange {
            role: self.config.role,
            sequence: self.sequence,
        };
        self.mote.load_packet(&frame.encode());
        self.sleep_until(at)?;
        self.mote.set_tuning(self.tx.primary);
        self.mote.enable_tx();
        self.delay(self.config.timing.tx_settle_ticks)?;
        self.clear(Pending::TX_DONE);
        self.mote.transmit_now();
        self.wait(Pending::TX_DONE)?;
        self.mote.rf_off();
        debug!("Reply {} sent on {:?}", self.sequence, self.tx.primary.unpack());
        self.sequence = self.sequence.wrapping_add(1);
        self.telemetry.replies_sent += 1;
        Ok(())
    }

    // Adjustments

    fn degenerate(&mut self, e: Error) {
        self.telemetry.degenerate_samples += 1;
        warn!("Skipping calibration: {e}");
    }

    fn guarded(guard: &EdgeGuard, primary: TuningWord, telemetry: &mut Telemetry) -> CandidatePair {
        let pair = guard.apply(guard.derive(primary));
        if pair.primary != primary {
            telemetry.guard_shifts += 1;
            debug!("Guard moved {:?} -> {:?}", primary.unpack(), pair.primary.unpack());
        }
        pair
    }

    fn guarded_rx(&mut self, primary: TuningWord) -> CandidatePair {
        Self::guarded(&self.rx_guard, primary, &mut self.telemetry)
    }

    fn guarded_tx(&mut self, primary: TuningWord) -> CandidatePair {
        Self::guarded(&self.tx_guard, primary, &mut self.telemetry)
    }

    fn shifted(&mut self, word: TuningWord, deltas: FieldDeltas, path: &str) -> TuningWord {
        let adjusted = word.apply_signed_adjustment(deltas, &self.config.sensitivity.lc);
        if adjusted.clamped {
            self.telemetry.boundary_clamps += 1;
            warn!("{path} tuning clamped at {:?}", adjusted.value.unpack());
        }
        debug!("{path} {:?} {:+} fine -> {:?}", word.unpack(), deltas.fine, adjusted.value.unpack());
        adjusted.value
    }

    fn adjust_rx(&mut self, deltas: FieldDeltas) {
        if deltas.is_zero() {
            return;
        }
        let primary = self.shifted(self.rx.primary, deltas, "RX");
        self.rx = self.guarded_rx(primary);
    }

    fn adjust_tx(&mut self, deltas: FieldDeltas) {
        if deltas.is_zero() {
            return;
        }
        let primary = self.shifted(self.tx.primary, deltas, "TX");
        self.tx = self.guarded_tx(primary);
    }

    fn adjust_rc(&mut self, deltas: RcDeltas) {
        if deltas.is_zero() {
            return;
        }
        let code = self.mote.rc_code();
        let adjusted = code.apply_signed_adjustment(deltas, &self.config.sensitivity.rc);
        if adjusted.clamped {
            self.telemetry.boundary_clamps += 1;
            warn!("RC code clamped at {:?}", adjusted.value);
        }
        debug!("RC {:?} -> {:?}", code, adjusted.value);
        self.mote.set_rc_code(adjusted.value);
    }
}

#[cfg(test)]
use crate::sim::{SimConfig, SimMote};

/// Initiator preset with the sweep narrowed around the simulated lock word.
#[cfg(test)]
fn narrowed(preset: Config) -> Config {
    let sweep = crate::config::Sweep { mid: [9, 15], ..preset.sweep };
    Config { sweep, ..preset }
}

#[cfg(test)]
fn simulate(config: Config, sim: SimConfig) -> Engine<'static, SimMote<'static>> {
    let irq: &'static Irq = Box::leak(Box::new(Irq::new()));
    let mut engine = Engine::new(SimMote::new(irq, &config, sim), irq, config);
    assert!(matches!(engine.run(), Err(Error::Halted)));
    engine
}

#[test]
fn corrupt_image_halts_before_radio() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    let irq = Irq::new();
    let sim = SimConfig { corrupt_image: true, ..SimConfig::new(&config) };
    let mut engine = Engine::new(SimMote::new(&irq, &config, sim), &irq, config);
    assert!(matches!(engine.run(), Err(Error::Integrity { .. })));
    assert_eq!(engine.mote().stats().rf_enables, 0);
    assert_eq!(engine.mote().now(), 0);
    assert_eq!(engine.phase(), Phase::SweepRx);
}

#[test]
fn initiator_converges() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    let sim = SimConfig::new(&config);
    let engine = simulate(config, sim);
    let t = engine.telemetry();
    let session = engine.session();
    let mote = engine.mote();

    assert!(matches!(engine.phase(), Phase::ContinuousCal | Phase::MutualCommunication));
    assert_eq!((t.retries, t.long_sleeps, t.peer_gaps), (0, 0, 0));
    assert!(t.replies_sent >= 90, "{t:?}");
    assert!(t.follow_ups >= 90, "{t:?}");
    assert!(mote.stats().replies_heard >= 90, "{:?}", mote.stats());
    assert_eq!(t.crc_failures, 0);

    let fine = config.sensitivity.lc.fine;
    assert!(mote.rx_error_hz(session.rx.primary).abs() <= fine, "{session:?}");
    assert!(mote.tx_error_hz(session.tx.primary).abs() < 3 * fine, "{session:?}");
    assert!(mote.rc_error_hz().abs() < 5_000, "{}", mote.rc_error_hz());
    assert_ne!(session.rc, sim.rc_code);
    assert_eq!(session.rc.superfine, sim.rc_code.superfine);
    assert!(session.anchor.is_some());
}

#[test]
fn responder_replies_after_follow_up() {
    let config = narrowed(crate::config::board::SCM3C_RESPONDER);
    let engine = simulate(config, SimConfig::new(&config));
    let t = engine.telemetry();
    assert!(t.follow_ups >= 90, "{t:?}");
    assert!(t.replies_sent >= 90, "{t:?}");
    assert!(engine.mote().stats().replies_heard >= 90, "{:?}", engine.mote().stats());
    assert_eq!(t.long_sleeps, 0);
}

#[test]
fn dropped_frames_fall_back_to_long_sleep() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    let sim = SimConfig { drop_every: Some(5), ..SimConfig::new(&config) };
    let engine = simulate(config, sim);
    let t = engine.telemetry();
    assert!(t.long_sleeps >= 15, "{t:?}");
    // Each drop burns the whole retry budget and costs exactly one frame
    assert!(t.retries >= 6 * t.long_sleeps, "{t:?}");
    assert!(t.peer_gaps <= t.long_sleeps && t.peer_gaps + 1 >= t.long_sleeps, "{t:?}");
    assert!(t.replies_sent >= 70, "{t:?}");
}

#[test]
fn survives_loss_and_corruption() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    let sim = SimConfig { seed: 7, loss: 0.05, corruption: 0.05, ..SimConfig::new(&config) };
    let engine = simulate(config, sim);
    let t = engine.telemetry();
    assert!(matches!(engine.phase(), Phase::ContinuousCal | Phase::MutualCommunication));
    assert!(t.crc_failures > 0, "{t:?}");
    assert!(t.replies_sent >= 50, "{t:?}");
}

#[test]
fn tracks_lc_drift() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    let sim = SimConfig { lc_drift_hz_per_s: 20_000.0, ..SimConfig::new(&config) };
    let engine = simulate(config, sim);
    let t = engine.telemetry();
    let session = engine.session();
    // Roughly 700 kHz of drift over the run, more than the capture band
    assert_eq!(t.retries, 0, "{t:?}");
    assert!(t.replies_sent >= 90, "{t:?}");
    assert!(engine.mote().rx_error_hz(session.rx.primary).abs() < 2 * config.sensitivity.lc.fine);
}

#[test]
fn counter_glitches_skip_calibration() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    let sim = SimConfig { counter_reset_every: Some(4), ..SimConfig::new(&config) };
    let engine = simulate(config, sim);
    let t = engine.telemetry();
    let session = engine.session();
    let mote = engine.mote();

    assert!(t.degenerate_samples >= 20, "{t:?}");
    assert_eq!((t.retries, t.boundary_clamps), (0, 0), "{t:?}");
    assert!(t.replies_sent >= 90, "{t:?}");
    // None of the reset windows reached the loops
    let fine = config.sensitivity.lc.fine;
    assert!(mote.rx_error_hz(session.rx.primary).abs() <= fine, "{session:?}");
    assert!(mote.tx_error_hz(session.tx.primary).abs() < 5 * fine, "{session:?}");
    assert_eq!(session.tx.primary.coarse(), config.tx.seed.coarse());
    assert!(mote.rc_error_hz().abs() < 5_000, "{}", mote.rc_error_hz());
    assert!((session.rx_hz - sim.carrier_hz).abs() < 1_000_000, "{session:?}");
}

#[test]
fn stray_frames_are_rejected() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    let sim = SimConfig { stray_every: Some(6), ..SimConfig::new(&config) };
    let engine = simulate(config, sim);
    let t = engine.telemetry();

    // Own role, unknown tag and short frames all show up
    assert!(t.rejected >= 12, "{t:?}");
    assert_eq!(t.crc_failures, 0);
    // A rejected frame is a miss; the peer stays silent until next period
    assert!(t.long_sleeps >= 12, "{t:?}");
    assert!(t.peer_gaps >= 12, "{t:?}");
    assert!(t.replies_sent >= 70, "{t:?}");
    assert!(matches!(engine.phase(), Phase::ContinuousCal | Phase::MutualCommunication));
}

#[test]
fn missing_if_estimates_are_dropped() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    let sim = SimConfig { zero_if_every: Some(4), ..SimConfig::new(&config) };
    let engine = simulate(config, sim);
    let t = engine.telemetry();
    let session = engine.session();

    assert!(t.dropped_if >= 20, "{t:?}");
    assert_eq!(t.retries, 0, "{t:?}");
    // The rest of the exchange still runs on those cycles
    assert!(t.replies_sent >= 90, "{t:?}");
    let error = engine.mote().rx_error_hz(session.rx.primary);
    assert!(error.abs() < 2 * config.sensitivity.lc.fine, "{error}");
}

#[test]
fn rc_out_of_reach_clamps_and_keeps_running() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    // Faster than the whole RC code range can pull back
    let sim = SimConfig { rc_error_hz: 200_000, ..SimConfig::new(&config) };
    let engine = simulate(config, sim);
    let t = engine.telemetry();
    let rc = engine.session().rc;

    assert!(t.boundary_clamps > 0, "{t:?}");
    assert_eq!((rc.coarse, rc.fine), (31, 31));
    assert_eq!(rc.superfine, sim.rc_code.superfine);
    assert!(engine.mote().rc_error_hz() > 0);
    assert_eq!(t.retries, 0, "{t:?}");
    assert!(t.replies_sent >= 90, "{t:?}");
}

#[test]
fn guard_follows_drift_in_steady_state() {
    let config = narrowed(crate::config::board::SCM3C_INITIATOR);
    // About 2 MHz over the run, fine alone can't absorb it
    let sim = SimConfig { lc_drift_hz_per_s: 60_000.0, ..SimConfig::new(&config) };
    let irq: &'static Irq = Box::leak(Box::new(Irq::new()));
    let mut engine = Engine::new(SimMote::new(irq, &config, sim), irq, config);
    engine.boot().unwrap();
    while engine.phase() != Phase::ContinuousCal {
        engine.step().unwrap();
    }
    let synced = *engine.telemetry();
    let stopped = loop {
        if let Err(e) = engine.step() {
            break e;
        }
    };
    assert!(matches!(stopped, Error::Halted));

    let t = engine.telemetry();
    let session = engine.session();
    assert!(t.guard_shifts > synced.guard_shifts, "{synced:?} -> {t:?}");
    let band = config.guard.fine_low..=config.guard.fine_high;
    assert!(band.contains(&session.rx.primary.fine()), "{session:?}");
    assert!(band.contains(&session.tx.primary.fine()), "{session:?}");
    assert!(session.rx.primary.mid() < 12, "{session:?}");
    let error = engine.mote().rx_error_hz(session.rx.primary);
    assert!(error.abs() < sim.capture_band_hz, "{error}");
    assert!(t.replies_sent >= 80, "{t:?}");
}
