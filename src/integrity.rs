//! Frame integrity checking
//!
//! Frames are protected by the STM32 CRC peripheral in its reset
//! configuration (polynomial 0x04C11DB7, initial value all ones, no
//! reflection, no output XOR) with each frame byte fed in as its own
//! zero-extended 32-bit word. Host and device must agree on this exactly,
//! so the host side computes trailers with [`SoftCrc`] which reproduces the
//! peripheral in software.

use ::crc::{Crc, Digest, CRC_32_MPEG_2};

use crate::hal::CrcUnit;

/// The peripheral's algorithm over big-endian word bytes
pub static STM32_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

#[derive(Copy, Clone, PartialEq, Debug, thiserror::Error)]
#[error("crc mismatch (computed 0x{computed:08x}, claimed 0x{claimed:08x})")]
pub struct IntegrityError {
    pub computed: u32,
    pub claimed: u32,
}

/// Software model of the CRC peripheral
#[derive(Clone)]
pub struct SoftCrc {
    digest: Digest<'static, u32>,
}

impl SoftCrc {
    pub fn new() -> Self {
        Self {
            digest: STM32_CRC.digest(),
        }
    }
}

impl Default for SoftCrc {
    fn default() -> Self {
        Self::new()
    }
}

impl CrcUnit for SoftCrc {
    fn accumulate(&mut self, word: u32) -> u32 {
        self.digest.update(&word.to_be_bytes());
        self.value()
    }

    fn value(&self) -> u32 {
        self.digest.clone().finalize()
    }

    fn reset(&mut self) {
        self.digest = STM32_CRC.digest();
    }
}

/// Run `data` through `unit` one byte per word, leaving the unit reset
pub fn compute<C: CrcUnit>(unit: &mut C, data: &[u8]) -> u32 {
    let crc = data
        .iter()
        .fold(unit.value(), |_, b| unit.accumulate(u32::from(*b)));

    unit.reset();

    crc
}

/// Check `data` against the trailer supplied by the host
pub fn verify<C: CrcUnit>(unit: &mut C, data: &[u8], claimed: u32) -> Result<(), IntegrityError> {
    let computed = compute(unit, data);

    if computed == claimed {
        Ok(())
    } else {
        Err(IntegrityError { computed, claimed })
    }
}

/// Trailer for `data` as the device will compute it
pub fn checksum(data: &[u8]) -> u32 {
    compute(&mut SoftCrc::new(), data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_fed_as_zero_extended_words() {
        let data = [0x05, 0x01, 0xa5];
        let words = [0, 0, 0, 0x05, 0, 0, 0, 0x01, 0, 0, 0, 0xa5];

        assert_eq!(checksum(&data), STM32_CRC.checksum(&words));
    }

    #[test]
    fn accumulate_reports_running_value() {
        let mut unit = SoftCrc::new();

        let first = unit.accumulate(0x05);
        assert_eq!(first, STM32_CRC.checksum(&[0, 0, 0, 0x05]));

        let second = unit.accumulate(0x01);
        assert_eq!(second, checksum(&[0x05, 0x01]));
    }

    #[test]
    fn empty_input_yields_reset_value() {
        let mut unit = SoftCrc::new();

        assert_eq!(checksum(&[]), 0xFFFF_FFFF);
        assert_eq!(checksum(&[]), STM32_CRC.checksum(&[]));
        assert!(verify(&mut unit, &[], 0).is_err());
        assert!(verify(&mut unit, &[], 0xFFFF_FFFF).is_ok());
    }

    #[test]
    fn consecutive_checks_do_not_combine() {
        let mut unit = SoftCrc::new();
        let a = [0x05, 0x01];
        let b = [0x07, 0x02, 0x00, 0x00];

        let crc_b = checksum(&b);

        assert!(verify(&mut unit, &a, checksum(&a)).is_ok());
        assert!(verify(&mut unit, &b, crc_b).is_ok());
        assert!(verify(&mut unit, &b, crc_b).is_ok());
    }

    #[test]
    fn any_single_bit_flip_fails() {
        let mut unit = SoftCrc::new();
        let data = [0x0b, 0x31, 0x00, 0x00, 0x01, 0x08, 0x02, 0xde, 0xad];
        let crc = checksum(&data);

        assert!(verify(&mut unit, &data, crc).is_ok());

        for i in 0..data.len() * 8 {
            let mut corrupt = data;
            corrupt[i / 8] ^= 1 << (i % 8);
            assert!(verify(&mut unit, &corrupt, crc).is_err(), "bit {} of data", i);
        }

        for bit in 0..32 {
            let e = verify(&mut unit, &data, crc ^ (1 << bit)).unwrap_err();
            assert_eq!(e.computed, crc, "bit {} of trailer", bit);
        }
    }
}
