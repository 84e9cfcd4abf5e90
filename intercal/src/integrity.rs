use crate::{Error, Result};
use crc::{Crc, CRC_32_ISCSI};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub fn checksum(image: &[u8]) -> u32 {
    CASTAGNOLI.checksum(image)
}

/// Boot check of the loaded program. Failure is fatal, nothing may run after it.
pub fn verify(image: &[u8], expected: u32) -> Result<()> {
    let computed = checksum(image);
    if computed != expected {
        return Err(Error::Integrity { expected, computed });
    }
    Ok(())
}

#[test]
fn castagnoli_check_value() {
    assert_eq!(checksum(b"123456789"), 0xE306_9283);
}

#[test]
fn mismatch_is_reported() {
    verify(b"123456789", 0xE306_9283).unwrap();
    match verify(b"123456780", 0xE306_9283) {
        Err(Error::Integrity { expected, computed }) => {
            assert_eq!(expected, 0xE306_9283);
            assert_ne!(computed, expected);
        }
        other => panic!("{other:?}"),
    }
}
