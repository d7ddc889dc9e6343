//! In-memory device model
//!
//! [`Simulator`] stands in for the flash interface, option bytes and id
//! register of an STM32F7 so the agent can run on a host, either against a
//! real serial port or one end of an in-memory [`link`].

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::config::{Config, ERASE_CLEAN};
use crate::hal::{
    DeviceId, EraseKind, EraseRequest, FlashController, Launcher, OptionBytes, OptionChange,
    OptionStore,
};
use crate::memory::Region;
use crate::programmer::SerialPort;
use crate::protection::RDP_LEVEL_0;

/// STM32F75x sector sizes
pub const SECTOR_SIZES: [u32; 8] = [
    32 * 1024,
    32 * 1024,
    32 * 1024,
    32 * 1024,
    128 * 1024,
    256 * 1024,
    256 * 1024,
    256 * 1024,
];

/// STM32F75x identification register, device id 0x449
pub const IDCODE: u32 = 0x1001_0449;

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum SimError {
    #[error("interface locked")]
    Locked,
    #[error("address 0x{0:08x} not backed by memory")]
    Unmapped(u32),
    #[error("sector {0} write protected")]
    WriteProtected(u8),
    #[error("injected fault")]
    Injected,
}

/// Number of calls made into each interface operation
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct Calls {
    pub unlocks: usize,
    pub locks: usize,
    pub programs: usize,
    pub erases: usize,
    pub option_unlocks: usize,
    pub option_programs: usize,
    pub option_launches: usize,
    pub option_locks: usize,
}

/// Operations forced to fail
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct Faults {
    pub unlock: bool,
    pub lock: bool,
    pub program_at: Option<u32>,
    pub erase: bool,
    pub option_unlock: bool,
    pub option_program: bool,
    pub option_launch: bool,
    pub option_lock: bool,
}

pub struct Simulator {
    banks: Vec<(Region, Vec<u8>)>,
    flash: Region,
    sectors: Vec<Region>,
    flash_locked: bool,
    options_locked: bool,
    staged: Vec<OptionChange>,

    /// Committed option bytes
    pub options: OptionBytes,
    pub calls: Calls,
    pub faults: Faults,
}

impl Simulator {
    /// Create a device with erased flash and zeroed RAM for the windows in `config`
    pub fn new(config: &Config) -> Self {
        let flash = config.memory.flash();

        let banks = config
            .memory
            .regions()
            .iter()
            .map(|r| {
                let fill = if *r == flash { 0xFF } else { 0x00 };
                (*r, vec![fill; (r.end - r.base) as usize + 1])
            })
            .collect();

        let mut sectors = Vec::new();
        let mut base = flash.base;
        for size in SECTOR_SIZES.iter().take(config.sectors as usize) {
            let end = (base + size - 1).min(flash.end);
            sectors.push(Region::new(base, end));
            if end == flash.end {
                break;
            }
            base = end + 1;
        }

        Self {
            banks,
            flash,
            sectors,
            flash_locked: true,
            options_locked: true,
            staged: Vec::new(),
            options: OptionBytes {
                rdp: RDP_LEVEL_0,
                wrp_sectors: 0,
            },
            calls: Calls::default(),
            faults: Faults::default(),
        }
    }

    pub fn flash_locked(&self) -> bool {
        self.flash_locked
    }

    pub fn options_locked(&self) -> bool {
        self.options_locked
    }

    /// Sector layout of the flash window
    pub fn sectors(&self) -> &[Region] {
        &self.sectors
    }

    /// Read `len` bytes at `address`, `None` when the range leaves a window
    pub fn read(&self, address: u32, len: usize) -> Option<&[u8]> {
        let (region, mem) = self.banks.iter().find(|(r, _)| r.contains(address))?;
        let start = (address - region.base) as usize;
        mem.get(start..start + len)
    }

    /// Load `data` at `address` directly, bypassing the flash interface
    pub fn load(&mut self, address: u32, data: &[u8]) -> Result<(), SimError> {
        for (i, b) in data.iter().enumerate() {
            let a = address + i as u32;
            *self.cell(a).ok_or(SimError::Unmapped(a))? = *b;
        }
        Ok(())
    }

    fn cell(&mut self, address: u32) -> Option<&mut u8> {
        let (region, mem) = self.banks.iter_mut().find(|(r, _)| r.contains(address))?;
        mem.get_mut((address - region.base) as usize)
    }

    fn sector_of(&self, address: u32) -> Option<u8> {
        self.sectors
            .iter()
            .position(|s| s.contains(address))
            .map(|i| i as u8)
    }

    fn protected(&self, sector: u8) -> bool {
        sector < 32 && self.options.wrp_sectors & (1 << sector) != 0
    }

    fn erase_sectors(&mut self, first: u8, count: u8) -> u32 {
        for sector in first..first.saturating_add(count) {
            let region = match self.sectors.get(sector as usize) {
                Some(r) => *r,
                None => return u32::from(sector),
            };

            if self.protected(sector) {
                return u32::from(sector);
            }

            let flash = self.flash;
            if let Some((_, mem)) = self.banks.iter_mut().find(|(r, _)| *r == flash) {
                let start = (region.base - flash.base) as usize;
                let end = (region.end - flash.base) as usize;
                mem[start..=end].iter_mut().for_each(|b| *b = 0xFF);
            }
        }

        ERASE_CLEAN
    }
}

impl FlashController for Simulator {
    type Error = SimError;

    fn unlock(&mut self) -> Result<(), SimError> {
        self.calls.unlocks += 1;
        if self.faults.unlock {
            return Err(SimError::Injected);
        }
        self.flash_locked = false;
        Ok(())
    }

    fn lock(&mut self) -> Result<(), SimError> {
        self.calls.locks += 1;
        if self.faults.lock {
            return Err(SimError::Injected);
        }
        self.flash_locked = true;
        Ok(())
    }

    fn program_byte(&mut self, address: u32, value: u8) -> Result<(), SimError> {
        self.calls.programs += 1;

        if self.faults.program_at == Some(address) {
            return Err(SimError::Injected);
        }

        if self.flash.contains(address) {
            if self.flash_locked {
                return Err(SimError::Locked);
            }
            if let Some(sector) = self.sector_of(address).filter(|s| self.protected(*s)) {
                return Err(SimError::WriteProtected(sector));
            }
        }

        *self.cell(address).ok_or(SimError::Unmapped(address))? = value;

        Ok(())
    }

    fn erase(&mut self, request: &EraseRequest) -> Result<u32, SimError> {
        self.calls.erases += 1;

        if self.faults.erase {
            return Err(SimError::Injected);
        }
        if self.flash_locked {
            return Err(SimError::Locked);
        }

        let status = match request.kind {
            EraseKind::Mass => self.erase_sectors(0, self.sectors.len() as u8),
            EraseKind::Sectors { first, count } => self.erase_sectors(first, count),
        };

        Ok(status)
    }
}

impl OptionStore for Simulator {
    type Error = SimError;

    fn unlock_options(&mut self) -> Result<(), SimError> {
        self.calls.option_unlocks += 1;
        if self.faults.option_unlock {
            return Err(SimError::Injected);
        }
        self.options_locked = false;
        Ok(())
    }

    fn program_options(&mut self, change: &OptionChange) -> Result<(), SimError> {
        self.calls.option_programs += 1;
        if self.faults.option_program {
            return Err(SimError::Injected);
        }
        if self.options_locked {
            return Err(SimError::Locked);
        }
        self.staged.push(*change);
        Ok(())
    }

    fn launch_options(&mut self) -> Result<(), SimError> {
        self.calls.option_launches += 1;

        let staged = std::mem::take(&mut self.staged);
        if self.faults.option_launch {
            return Err(SimError::Injected);
        }
        if self.options_locked {
            return Err(SimError::Locked);
        }

        for change in staged {
            match change {
                OptionChange::ReadProtection(raw) => self.options.rdp = raw,
                OptionChange::WriteProtection {
                    enable: true,
                    sectors,
                } => self.options.wrp_sectors |= sectors,
                OptionChange::WriteProtection {
                    enable: false,
                    sectors,
                } => self.options.wrp_sectors &= !sectors,
            }
        }

        Ok(())
    }

    fn lock_options(&mut self) -> Result<(), SimError> {
        self.calls.option_locks += 1;
        if self.faults.option_lock {
            return Err(SimError::Injected);
        }
        self.options_locked = true;
        Ok(())
    }

    fn read_options(&self) -> OptionBytes {
        self.options
    }
}

impl DeviceId for Simulator {
    fn device_id(&self) -> u32 {
        IDCODE
    }
}

/// Launcher for hosted runs, there is no image to start so the process ends
pub struct Exit;

impl Launcher for Exit {
    fn launch(&mut self, entry_region_base: u32) -> ! {
        info!("Application launch requested at 0x{:08x}, exiting", entry_region_base);
        std::process::exit(0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("serial link disconnected")]
pub struct Disconnected;

/// One end of an in-memory serial link
pub struct Endpoint {
    tx: Sender<u8>,
    rx: Receiver<u8>,
}

/// Create a connected pair of serial endpoints
pub fn link() -> (Endpoint, Endpoint) {
    let (a_tx, b_rx) = channel();
    let (b_tx, a_rx) = channel();

    (Endpoint { tx: a_tx, rx: a_rx }, Endpoint { tx: b_tx, rx: b_rx })
}

impl Read<u8> for Endpoint {
    type Error = Disconnected;

    fn read(&mut self) -> nb::Result<u8, Disconnected> {
        match self.rx.recv_timeout(Duration::from_millis(1)) {
            Ok(b) => Ok(b),
            Err(RecvTimeoutError::Timeout) => Err(nb::Error::WouldBlock),
            Err(RecvTimeoutError::Disconnected) => Err(nb::Error::Other(Disconnected)),
        }
    }
}

impl Write<u8> for Endpoint {
    type Error = Disconnected;

    fn write(&mut self, word: u8) -> nb::Result<(), Disconnected> {
        self.tx.send(word).map_err(|_| nb::Error::Other(Disconnected))
    }

    fn flush(&mut self) -> nb::Result<(), Disconnected> {
        Ok(())
    }
}

impl SerialPort<Disconnected> for Endpoint {
    fn set_rts(&mut self, _level: bool) -> Result<(), Disconnected> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), Disconnected> {
        Ok(())
    }
}

/// Thread sleep delay
pub struct Sleep;

impl DelayMs<u32> for Sleep {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(u64::from(ms)));
    }
}
