//! Read and write protection management
//!
//! Both protections live in the option bytes and change through the same
//! sequence: unlock the option store, stage the change, launch (commit) it,
//! relock. A failed step ends the sequence; relock is still attempted.

use crate::hal::{OptionChange, OptionStore};

/// Raw option byte value for [`ProtectionLevel::Level0`]
pub const RDP_LEVEL_0: u8 = 0xAA;
/// Raw option byte value for [`ProtectionLevel::Level1`]
pub const RDP_LEVEL_1: u8 = 0x55;
/// Raw option byte value written for [`ProtectionLevel::Level2`], any value
/// other than the two above reads back as level 2
pub const RDP_LEVEL_2: u8 = 0xCC;

/// Device read protection level, ordered by strength
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ProtectionLevel {
    /// No read protection
    Level0,
    /// Debug and boot-from-RAM readout blocked, reversible with a mass erase
    Level1,
    /// Permanent, cannot be lowered again
    Level2,
}

impl ProtectionLevel {
    /// Decode the raw option byte
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            RDP_LEVEL_0 => ProtectionLevel::Level0,
            RDP_LEVEL_1 => ProtectionLevel::Level1,
            _ => ProtectionLevel::Level2,
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            ProtectionLevel::Level0 => RDP_LEVEL_0,
            ProtectionLevel::Level1 => RDP_LEVEL_1,
            ProtectionLevel::Level2 => RDP_LEVEL_2,
        }
    }

    /// Decode the level numbering used on the wire (0, 1, 2)
    pub fn from_protocol(level: u8) -> Option<Self> {
        match level {
            0 => Some(ProtectionLevel::Level0),
            1 => Some(ProtectionLevel::Level1),
            2 => Some(ProtectionLevel::Level2),
            _ => None,
        }
    }

    pub fn to_protocol(self) -> u8 {
        self as u8
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ProtectionError {
    #[error("read protection is permanent at level 2")]
    Permanent,
    #[error("{requested} sectors requested, device has {max}")]
    TooManySectors { requested: u8, max: u8 },
    #[error("option byte unlock failed")]
    Unlock,
    #[error("option byte programming failed")]
    Program,
    #[error("option byte launch failed")]
    Launch,
    #[error("option byte lock failed")]
    Lock,
}

/// Current read protection level
pub fn rdp_level<O: OptionStore>(store: &O) -> ProtectionLevel {
    ProtectionLevel::from_raw(store.read_options().rdp)
}

/// Current write protected sector mask
pub fn wrp_sectors<O: OptionStore>(store: &O) -> u32 {
    store.read_options().wrp_sectors
}

/// Move read protection to `level`.
///
/// Once the device sits at level 2 any request for a lower level is refused
/// here without touching the option store.
pub fn set_rdp<O: OptionStore>(
    store: &mut O,
    level: ProtectionLevel,
) -> Result<(), ProtectionError> {
    let current = rdp_level(store);

    if current == ProtectionLevel::Level2 && level != ProtectionLevel::Level2 {
        warn!("Refusing read protection change {:?} -> {:?}", current, level);
        return Err(ProtectionError::Permanent);
    }

    info!("Read protection {:?} -> {:?}", current, level);

    commit(store, &OptionChange::ReadProtection(level.to_raw()))
}

/// Enable or disable write protection for the sectors in `sector_code`.
pub fn set_wrp<O: OptionStore>(
    store: &mut O,
    sectors: u8,
    sector_count: u8,
    sector_code: u8,
    enable: bool,
) -> Result<(), ProtectionError> {
    if sector_count > sectors {
        warn!("Write protection for {} sectors refused, device has {}", sector_count, sectors);
        return Err(ProtectionError::TooManySectors {
            requested: sector_count,
            max: sectors,
        });
    }

    info!(
        "Write protection {} for sectors 0x{:02x}",
        if enable { "on" } else { "off" },
        sector_code
    );

    commit(
        store,
        &OptionChange::WriteProtection {
            enable,
            sectors: u32::from(sector_code),
        },
    )
}

fn commit<O: OptionStore>(store: &mut O, change: &OptionChange) -> Result<(), ProtectionError> {
    let staged = store
        .unlock_options()
        .map_err(|e| {
            error!("Option unlock failed: {:?}", e);
            ProtectionError::Unlock
        })
        .and_then(|_| {
            store.program_options(change).map_err(|e| {
                error!("Option programming failed: {:?}", e);
                ProtectionError::Program
            })
        })
        .and_then(|_| {
            store.launch_options().map_err(|e| {
                error!("Option launch failed: {:?}", e);
                ProtectionError::Launch
            })
        });

    let locked = store.lock_options().map_err(|e| {
        error!("Option lock failed: {:?}", e);
        ProtectionError::Lock
    });

    staged.and(locked)
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::config::{Config, FLASH_SECTORS};
    use crate::emulator::Simulator;

    fn sim() -> Simulator {
        Simulator::new(&Config::STM32F756)
    }

    #[test]
    fn raw_levels() {
        assert_eq!(ProtectionLevel::from_raw(0xAA), ProtectionLevel::Level0);
        assert_eq!(ProtectionLevel::from_raw(0x55), ProtectionLevel::Level1);
        assert_eq!(ProtectionLevel::from_raw(0xCC), ProtectionLevel::Level2);
        assert_eq!(ProtectionLevel::from_raw(0x00), ProtectionLevel::Level2);
        assert_eq!(ProtectionLevel::from_raw(0xFF), ProtectionLevel::Level2);

        for l in &[ProtectionLevel::Level0, ProtectionLevel::Level1, ProtectionLevel::Level2] {
            assert_eq!(ProtectionLevel::from_raw(l.to_raw()), *l);
            assert_eq!(ProtectionLevel::from_protocol(l.to_protocol()), Some(*l));
        }
        assert_eq!(ProtectionLevel::from_protocol(3), None);
    }

    #[test]
    fn rdp_read_back_is_stable() {
        let s = sim();
        assert_eq!(rdp_level(&s), rdp_level(&s));
        assert_eq!(rdp_level(&s), ProtectionLevel::Level0);
        assert_eq!(s.calls.option_unlocks, 0);
    }

    #[test]
    fn set_rdp_runs_full_sequence() {
        let mut s = sim();

        set_rdp(&mut s, ProtectionLevel::Level1).unwrap();

        assert_eq!(rdp_level(&s), ProtectionLevel::Level1);
        assert_eq!(s.options.rdp, RDP_LEVEL_1);
        assert_eq!(s.calls.option_unlocks, 1);
        assert_eq!(s.calls.option_programs, 1);
        assert_eq!(s.calls.option_launches, 1);
        assert_eq!(s.calls.option_locks, 1);
        assert!(s.options_locked());
    }

    #[test]
    fn level_two_is_permanent() {
        let mut s = sim();
        set_rdp(&mut s, ProtectionLevel::Level2).unwrap();
        assert_eq!(rdp_level(&s), ProtectionLevel::Level2);

        let before = s.calls;
        for l in &[ProtectionLevel::Level0, ProtectionLevel::Level1] {
            assert_eq!(set_rdp(&mut s, *l), Err(ProtectionError::Permanent));
        }

        assert_eq!(s.calls, before);
        assert_eq!(rdp_level(&s), ProtectionLevel::Level2);
    }

    #[test]
    fn failed_step_short_circuits_and_relocks() {
        let mut s = sim();
        s.faults.option_program = true;

        assert_eq!(set_rdp(&mut s, ProtectionLevel::Level1), Err(ProtectionError::Program));
        assert_eq!(s.calls.option_launches, 0);
        assert_eq!(s.calls.option_locks, 1);
        assert_eq!(rdp_level(&s), ProtectionLevel::Level0);
    }

    #[test]
    fn failed_unlock_still_attempts_lock() {
        let mut s = sim();
        s.faults.option_unlock = true;

        assert_eq!(
            set_wrp(&mut s, FLASH_SECTORS, 1, 0x01, true),
            Err(ProtectionError::Unlock)
        );
        assert_eq!(s.calls.option_programs, 0);
        assert_eq!(s.calls.option_locks, 1);
    }

    #[test]
    fn failed_launch_leaves_options_unchanged() {
        let mut s = sim();
        s.faults.option_launch = true;

        assert_eq!(
            set_wrp(&mut s, FLASH_SECTORS, 1, 0x01, true),
            Err(ProtectionError::Launch)
        );
        assert_eq!(wrp_sectors(&s), 0);
    }

    #[test]
    fn failed_lock_fails_change() {
        let mut s = sim();
        s.faults.option_lock = true;

        assert_eq!(set_rdp(&mut s, ProtectionLevel::Level1), Err(ProtectionError::Lock));
    }

    #[test]
    fn wrp_enable_and_disable() {
        let mut s = sim();

        set_wrp(&mut s, FLASH_SECTORS, 2, 0x0c, true).unwrap();
        assert_eq!(wrp_sectors(&s), 0x0c);

        set_wrp(&mut s, FLASH_SECTORS, 1, 0x04, false).unwrap();
        assert_eq!(wrp_sectors(&s), 0x08);
    }

    #[test]
    fn wrp_sector_count_bounded() {
        let mut s = sim();

        assert_eq!(
            set_wrp(&mut s, FLASH_SECTORS, FLASH_SECTORS + 1, 0xff, true),
            Err(ProtectionError::TooManySectors {
                requested: FLASH_SECTORS + 1,
                max: FLASH_SECTORS
            })
        );
        assert_eq!(s.calls.option_unlocks, 0);
    }
}
