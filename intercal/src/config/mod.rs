use crate::code::{Sensitivity, TuningWord, FIELD_MAX};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
#[cfg(test)] use proptest::prelude::*;
#[cfg(test)] use proptest_derive::Arbitrary;
#[cfg(test)] use itertools::Itertools;

pub mod board;

/// Upper bound on `smoothing.depth`, sizes the history buffers.
pub const MAX_HISTORY_DEPTH: usize = 16;
/// Settings that received a beacon during the RX sweep, kept for the median.
pub const SWEEP_CAPACITY: usize = 100;

/// Which side of the exchange this mote plays. Both run the same engine;
/// the role picks the reply ordering and the TX offset preset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(test, derive(Arbitrary))]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Initiator,
    Responder,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timing {
    /// Rate of the timer every deadline and window is expressed in.
    pub timer_hz: u32,
    pub measurement_ticks: u32,
    /// LC tank to counter division ratio.
    pub lc_divider: u32,
    pub rc_target_hz: u32,
    /// Window counts further than this from their expected value, in
    /// percent, are treated as a counter glitch.
    pub count_tolerance_pct: u32,
    /// Turnover plus LC setup after a sweep retune.
    pub settle_ticks: u32,
    pub tx_settle_ticks: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sweep {
    pub coarse: u8,
    pub mid: [u8; 2],
    pub fine: [u8; 2],
    pub rx_timeout_ticks: u32,
}

impl Sweep {
    /// Every setting visited by the RX sweep, ascending.
    pub fn settings(&self) -> impl Iterator<Item = TuningWord> + '_ {
        let [mid_lo, mid_hi] = self.mid;
        let [fine_lo, fine_hi] = self.fine;
        (mid_lo..=mid_hi).flat_map(move |mid| {
            (fine_lo..=fine_hi).map(move |fine| TuningWord::clamped(self.coarse, mid, fine))
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    /// Known-good starting point, replaces a TX sweep.
    pub seed: TuningWord,
    /// TX LC target above the smoothed RX LC estimate.
    pub offset_hz: i64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Smoothing {
    pub weight_new: u32,
    pub weight_total: u32,
    pub initial_rx_hz: i64,
    pub depth: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intermediate {
    pub target: u16,
    pub counts_per_fine: i32,
}

/// Candidate offset: +mid, -fine. On the raw word that is `mid * 32 - fine`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offset {
    pub mid: u8,
    pub fine: u8,
}

impl Offset {
    pub fn raw(self) -> i32 {
        i32::from(self.mid) * 32 - i32::from(self.fine)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guard {
    /// Inclusive safe band for the fine field.
    pub fine_low: u8,
    pub fine_high: u8,
    pub rx_offset: Offset,
    pub tx_offset: Offset,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub period_ticks: u32,
    pub lead_ticks: u32,
    pub listen_ticks: u32,
    pub retry_spacing_ticks: u32,
    pub max_retries: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    /// From the anchor to the start of our reply.
    pub reply_delay_ticks: u32,
    pub reply_listen_ticks: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub role: Role,
    pub sensitivity: Sensitivity,
    pub timing: Timing,
    pub sweep: Sweep,
    pub tx: Tx,
    pub smoothing: Smoothing,
    pub intermediate: Intermediate,
    pub guard: Guard,
    pub schedule: Schedule,
    pub exchange: Exchange,
}

impl Default for Config {
    fn default() -> Self {
        board::SCM3C_INITIATOR
    }
}

fn merge(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(inner)), toml::Value::Table(over)) => merge(inner, over),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

impl Config {
    pub fn preset(role: Role) -> Self {
        match role {
            Role::Initiator => board::SCM3C_INITIATOR,
            Role::Responder => board::SCM3C_RESPONDER,
        }
    }

    /// Parse a TOML override file. Anything left out comes from the preset
    /// for the file's `role` (initiator if absent).
    pub fn from_toml(contents: &str) -> Result<Self> {
        let overrides: toml::Table = contents.parse()?;
        let role = match overrides.get("role") {
            Some(role) => role.clone().try_into()?,
            None => Role::default(),
        };
        let mut merged = match toml::Value::try_from(Self::preset(role))? {
            toml::Value::Table(table) => table,
            _ => return Err(Error::Config("preset did not encode as a table")),
        };
        merge(&mut merged, overrides);
        let config: Self = toml::Value::Table(merged).try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let lc = self.sensitivity.lc;
        let rc = self.sensitivity.rc;
        if [lc.coarse, lc.mid, lc.fine, rc.coarse, rc.fine].contains(&0) {
            return Err(Error::Config("sensitivity must be nonzero"));
        }
        let t = &self.timing;
        if t.timer_hz == 0 || t.measurement_ticks == 0 || t.lc_divider == 0 {
            return Err(Error::Config("timer rate, measurement window and divider must be nonzero"));
        }
        if t.count_tolerance_pct == 0 || t.count_tolerance_pct >= 100 {
            return Err(Error::Config("count tolerance must be within 1..=99 percent"));
        }
        let s = &self.sweep;
        if s.coarse > FIELD_MAX
            || s.mid[0] > s.mid[1]
            || s.mid[1] > FIELD_MAX
            || s.fine[0] > s.fine[1]
            || s.fine[1] > FIELD_MAX
        {
            return Err(Error::Config("sweep range must be ascending within 0..=31"));
        }
        let sm = &self.smoothing;
        if sm.weight_new == 0 || sm.weight_new > sm.weight_total {
            return Err(Error::Config("smoothing weights must satisfy 0 < new <= total"));
        }
        if sm.depth == 0 || sm.depth > MAX_HISTORY_DEPTH {
            return Err(Error::Config("history depth out of range"));
        }
        if self.intermediate.counts_per_fine == 0 {
            return Err(Error::Config("IF counts per fine step must be nonzero"));
        }
        let g = &self.guard;
        if g.fine_low >= g.fine_high || g.fine_high > FIELD_MAX {
            return Err(Error::Config("guard band must be ascending within 0..=31"));
        }
        if [g.rx_offset, g.tx_offset].iter().any(|o| o.raw() <= 0 || o.fine > FIELD_MAX) {
            return Err(Error::Config("candidate offset must move the word upward"));
        }
        let sc = &self.schedule;
        if sc.lead_ticks >= sc.period_ticks || sc.listen_ticks == 0 {
            return Err(Error::Config("lead must be shorter than the period"));
        }
        if self.exchange.reply_delay_ticks >= sc.period_ticks {
            return Err(Error::Config("reply must fit inside the period"));
        }
        Ok(())
    }
}

#[test]
fn presets_validate() {
    board::SCM3C_INITIATOR.validate().unwrap();
    board::SCM3C_RESPONDER.validate().unwrap();
    assert_eq!(Config::default(), board::SCM3C_INITIATOR);
}

#[test]
fn sweep_covers_the_plane() {
    let sweep = board::SCM3C_INITIATOR.sweep;
    let settings: Vec<_> = sweep.settings().collect();
    assert_eq!(settings.len(), 32 * 32);
    assert_eq!(settings[0].unpack(), (23, 0, 0));
    assert_eq!(settings[1023].unpack(), (23, 31, 31));
    assert!(settings.iter().tuple_windows().all(|(a, b)| a < b));
}

#[test]
fn toml_overrides_merge_into_role_preset() {
    let config = Config::from_toml(
        r#"
        role = "responder"

        [schedule]
        max_retries = 3

        [tx]
        seed = [22, 10, 12]
        "#,
    )
    .unwrap();
    assert_eq!(config.role, Role::Responder);
    assert_eq!(config.schedule.max_retries, 3);
    assert_eq!(config.schedule.period_ticks, board::SCM3C_RESPONDER.schedule.period_ticks);
    assert_eq!(config.tx.seed.unpack(), (22, 10, 12));
    assert_eq!(config.tx.offset_hz, board::SCM3C_RESPONDER.tx.offset_hz);
}

#[test]
fn toml_rejects_bad_values() {
    assert!(matches!(Config::from_toml("[tx]\nseed = [32, 0, 0]"), Err(Error::Toml(_))));
    assert!(matches!(
        Config::from_toml("[smoothing]\ndepth = 0"),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Config::from_toml("[guard]\nfine_low = 30\nfine_high = 2"),
        Err(Error::Config(_))
    ));
    assert!(matches!(
        Config::from_toml("[timing]\ncount_tolerance_pct = 100"),
        Err(Error::Config(_))
    ));
}

#[test]
fn preset_roundtrips_through_toml() {
    let text = toml::to_string(&board::SCM3C_RESPONDER).unwrap();
    assert_eq!(Config::from_toml(&text).unwrap(), board::SCM3C_RESPONDER);
}

#[cfg(test)]
proptest! {
    #[test]
    fn role_peer_is_involution(role: Role) {
        assert_ne!(role, role.peer());
        assert_eq!(role, role.peer().peer());
    }
}
