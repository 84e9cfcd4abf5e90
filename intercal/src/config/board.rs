use crate::code::{LcSensitivity, RcSensitivity, Sensitivity, TuningWord};
use crate::config::*;

// Bench measurements on SCM3C, not derivable from the schematic
#[rustfmt::skip]
pub const SCM3C_SENSITIVITY: Sensitivity = Sensitivity {
    lc: LcSensitivity {
        coarse: 14_663_148,
        mid:       860_314, // 794_861 on some dies
        fine:      130_902,
    },
    rc: RcSensitivity {
        coarse: -10_860,
        fine:    -1_597,
    },
};

#[rustfmt::skip]
const SCM3C_TIMING: Timing = Timing {
    timer_hz:              500_000,
    measurement_ticks:      25_000, // 50 ms
    lc_divider:                960,
    rc_target_hz:        2_000_000,
    count_tolerance_pct:        50,
    settle_ticks:            9_200, // turnover + LC setup
    tx_settle_ticks:         1_400,
};

#[rustfmt::skip]
pub const SCM3C_INITIATOR: Config = Config {
    role: Role::Initiator,
    sensitivity: SCM3C_SENSITIVITY,
    timing: SCM3C_TIMING,
    sweep: Sweep {
        coarse: 23,
        mid:  [0, 31],
        fine: [0, 31],
        rx_timeout_ticks: 500, // 1 ms
    },
    tx: Tx {
        seed: TuningWord::clamped(23, 6, 4),
        offset_hz: 7_000_000,
    },
    smoothing: Smoothing {
        weight_new: 2,
        weight_total: 10,
        initial_rx_hz: 2_402_500_000,
        depth: 5,
    },
    intermediate: Intermediate {
        target: 500,
        counts_per_fine: 16,
    },
    guard: Guard {
        fine_low: 2,
        fine_high: 30,
        rx_offset: Offset { mid: 1, fine: 6 },
        tx_offset: Offset { mid: 1, fine: 6 },
    },
    schedule: Schedule {
        period_ticks:      150_000, // 300 ms
        lead_ticks:            500,
        listen_ticks:        2_500, // 5 ms
        retry_spacing_ticks: 2_500,
        max_retries: 6,
    },
    exchange: Exchange {
        reply_delay_ticks:  55_000,
        reply_listen_ticks: 30_000,
    },
};

// Same die family, TX pulled slightly further from RX
#[rustfmt::skip]
pub const SCM3C_RESPONDER: Config = Config {
    role: Role::Responder,
    tx: Tx {
        seed: TuningWord::clamped(23, 6, 4),
        offset_hz: 7_500_000,
    },
    ..SCM3C_INITIATOR
};
