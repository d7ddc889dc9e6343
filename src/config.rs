//! Board configuration
//!
//! Defaults describe an STM32F756ZG: 1 MiB flash in eight sectors, SRAM1
//! and SRAM2 as the writable RAM windows, application image in sector 2.

use crate::hal::VoltageRange;
use crate::memory::{MemoryMap, Region};
use crate::protocol::Version;

/// SRAM1 (240 KiB)
pub const SRAM1: Region = Region::new(0x2001_0000, 0x2004_BFFF);

/// SRAM2 (16 KiB)
pub const SRAM2: Region = Region::new(0x2004_C000, 0x2004_FFFF);

/// Main flash (1 MiB)
pub const FLASH: Region = Region::new(0x0800_0000, 0x080F_FFFF);

/// Number of erasable flash sectors
pub const FLASH_SECTORS: u8 = 8;

/// Sector selector requesting a mass erase
pub const MASS_ERASE: u8 = 0xFF;

/// Sector status word reported when every requested sector erased cleanly
pub const ERASE_CLEAN: u32 = 0xFFFF_FFFF;

/// Base of the flash sector holding the application vector table
pub const APP_BASE: u32 = 0x0801_0000;

/// Bits of the identification register holding the device id
pub const DEVICE_ID_MASK: u32 = 0x0FFF;

/// Bootloader version reported to the host
pub const VERSION: Version = Version {
    vendor: 200,
    major: 1,
    minor: 0,
    patch: 0,
};

#[derive(Clone, PartialEq, Debug)]
pub struct Config {
    /// Windows the host may address
    pub memory: MemoryMap,

    /// Number of flash sectors
    pub sectors: u8,

    /// Erase / program voltage range
    pub voltage: VoltageRange,

    /// Application vector table location
    pub app_base: u32,

    /// Version record returned by get-help and get-version
    pub version: Version,
}

impl Config {
    pub const STM32F756: Config = Config {
        memory: MemoryMap::new([SRAM1, SRAM2, FLASH]),
        sectors: FLASH_SECTORS,
        voltage: VoltageRange::Range3,
        app_base: APP_BASE,
        version: VERSION,
    };
}

impl Default for Config {
    fn default() -> Self {
        Self::STM32F756
    }
}
