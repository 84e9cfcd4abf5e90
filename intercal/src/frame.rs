// Peer payload, CRC is added and checked by the radio
use crate::config::Role;
use crate::{Error, Result};
use num_enum::{IntoPrimitive, TryFromPrimitive};
#[cfg(test)] use proptest::prelude::*;
#[cfg(test)] use proptest_derive::Arbitrary;

pub const FRAME_LEN: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(test, derive(Arbitrary))]
#[repr(u8)]
pub enum Tag {
    Beacon = b'C',
    Initiator = b'0',
    Responder = b'1',
}

impl From<Role> for Tag {
    fn from(role: Role) -> Self {
        match role {
            Role::Initiator => Tag::Initiator,
            Role::Responder => Tag::Responder,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(test, derive(Arbitrary))]
pub enum Frame {
    /// Sent while the peer sweeps; `countdown` is seconds until beaconing stops.
    Beacon { countdown: u8 },
    Exchange { role: Role, sequence: u32 },
}

impl Frame {
    pub fn tag(&self) -> Tag {
        match self {
            Frame::Beacon { .. } => Tag::Beacon,
            Frame::Exchange { role, .. } => Tag::from(*role),
        }
    }

    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut buf = [0; FRAME_LEN];
        buf[0] = self.tag().into();
        match self {
            Frame::Beacon { countdown } => buf[1] = *countdown,
            Frame::Exchange { sequence, .. } => buf[1..].copy_from_slice(&sequence.to_be_bytes()),
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; FRAME_LEN] = bytes.try_into().map_err(|_| Error::FrameLength(bytes.len()))?;
        let tag = Tag::try_from(bytes[0]).map_err(|e| Error::FrameTag(e.number))?;
        let sequence = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Ok(match tag {
            Tag::Beacon => Frame::Beacon { countdown: bytes[1] },
            Tag::Initiator => Frame::Exchange { role: Role::Initiator, sequence },
            Tag::Responder => Frame::Exchange { role: Role::Responder, sequence },
        })
    }
}

#[test]
fn exchange_layout() {
    let frame = Frame::Exchange { role: Role::Responder, sequence: 0x0102_0304 };
    assert_eq!(frame.encode(), [b'1', 1, 2, 3, 4]);
    assert_eq!(Frame::Beacon { countdown: 17 }.encode(), [b'C', 17, 0, 0, 0]);
}

#[test]
fn decode_rejects() {
    assert!(matches!(Frame::decode(&[b'0', 0, 0, 1]), Err(Error::FrameLength(4))));
    assert!(matches!(Frame::decode(&[b'P', 0, 0, 0, 1]), Err(Error::FrameTag(b'P'))));
}

#[cfg(test)]
proptest! {
    #[test]
    fn frame_roundtrip(frame: Frame) {
        assert_eq!(frame, Frame::decode(&frame.encode()).unwrap());
    }

    #[test]
    fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..8)) {
        let _ = Frame::decode(&bytes);
    }
}
