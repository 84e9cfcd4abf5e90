use thiserror::Error;

pub mod arith;
pub mod code;
pub mod config;
pub mod engine;
pub mod frame;
pub mod guard;
pub mod integrity;
pub mod irq;
pub mod mote;
pub mod schedule;
pub mod sim;
pub mod telemetry;

pub use code::{RcCode, TuningWord};
pub use config::{Config, Role};
pub use engine::{Engine, Phase};
pub use irq::Irq;
pub use mote::{Counters, Mote};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Program checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    Integrity { expected: u32, computed: u32 },
    #[error("Code field {0} out of range (0..=31)")]
    FieldRange(u8),
    #[error("Degenerate tick count: reference {reference}, lc {lc}")]
    DegenerateCount { reference: u32, lc: u32 },
    #[error("Demodulator reported no IF estimate")]
    IfEstimate,
    #[error("Invalid frame length {0}")]
    FrameLength(usize),
    #[error("Invalid frame tag {0:#04x}")]
    FrameTag(u8),
    #[error("Invalid config setting: {0}")]
    Config(&'static str),
    #[error("Config parse failed")]
    Toml(#[from] toml::de::Error),
    #[error("Config encode failed")]
    TomlEncode(#[from] toml::ser::Error),
    #[error("Telemetry encode failed")]
    Cbor(#[from] ciborium::ser::Error<std::io::Error>),
    #[error("Telemetry socket failed")]
    Io(#[from] std::io::Error),
    #[error("Mote halted")]
    Halted,
}

pub type Result<T> = std::result::Result<T, Error>;
