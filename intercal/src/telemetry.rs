use crate::code::RcCode;
use crate::engine::Phase;
use crate::guard::CandidatePair;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::{io::ErrorKind, net::UdpSocket};

/// Event counters. None of these are errors, they are how often the engine
/// had to degrade.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub received: u32,
    pub crc_failures: u32,
    /// Wrong length, unknown tag, or our own role's tag.
    pub rejected: u32,
    pub timeouts: u32,
    pub retries: u32,
    pub long_sleeps: u32,
    pub degenerate_samples: u32,
    pub dropped_if: u32,
    pub boundary_clamps: u32,
    pub guard_shifts: u32,
    pub replies_sent: u32,
    pub follow_ups: u32,
    pub peer_gaps: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub phase: Phase,
    pub rx: CandidatePair,
    pub tx: CandidatePair,
    pub rc: RcCode,
    pub anchor: Option<u32>,
    pub sequence: u32,
    pub rx_hz: i64,
    pub tx_hz: i64,
    pub rc_hz: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum Report {
    Telemetry(Telemetry),
    Session(Session),
}

impl Report {
    pub fn send(&self, socket: &UdpSocket) -> Result<()> {
        let mut buf = Vec::<u8>::new();
        ciborium::ser::into_writer(self, &mut buf)?;
        if let Err(e) = socket.send(&buf) {
            match e.kind() {
                ErrorKind::ConnectionRefused => Ok(()),
                _ => Err(e),
            }?
        }
        Ok(())
    }
}

#[test]
fn report_encodes_as_cbor() {
    let report = Report::Telemetry(Telemetry { received: 3, peer_gaps: 1, ..Default::default() });
    let mut buf = Vec::<u8>::new();
    ciborium::ser::into_writer(&report, &mut buf).unwrap();
    let back: Report = ciborium::de::from_reader(buf.as_slice()).unwrap();
    match back {
        Report::Telemetry(t) => assert_eq!((t.received, t.peer_gaps), (3, 1)),
        other => panic!("{other:?}"),
    }
}

#[test]
fn send_without_listener_is_not_an_error() {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    // Bind and drop a socket to get a port nobody is listening on
    let port = UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    socket.connect(("127.0.0.1", port)).unwrap();
    let report = Report::Telemetry(Telemetry::default());
    for _ in 0..3 {
        report.send(&socket).unwrap();
    }
}
