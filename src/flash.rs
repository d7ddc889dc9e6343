//! Flash programming and erase
//!
//! Every operation follows unlock, operate, lock against the flash
//! interface. Nothing is retried: the first failure ends the operation.

use crate::config::{ERASE_CLEAN, MASS_ERASE};
use crate::hal::{EraseKind, EraseRequest, FlashController, VoltageRange};

#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
pub enum FlashError {
    #[error("flash unlock failed")]
    Unlock,
    #[error("flash lock failed")]
    Lock,
    #[error("programming failed at 0x{address:08x}")]
    Program { address: u32 },
    #[error("{requested} sectors requested, device has {max}")]
    TooManySectors { requested: u8, max: u8 },
    #[error("sector {sector} outside of {max} sector table")]
    SectorOutOfRange { sector: u8, max: u8 },
    #[error("erase rejected by flash interface")]
    EraseRejected,
    #[error("erase incomplete (status 0x{status:08x})")]
    EraseIncomplete { status: u32 },
}

/// Program `data` starting at `address`, lowest address first.
///
/// Programming stops at the first byte the interface rejects. The interface
/// is relocked after a fully successful write, and as a best effort after a
/// failed byte; a failed relock only changes the result of an otherwise
/// successful write.
pub fn write_payload<F: FlashController>(
    flash: &mut F,
    data: &[u8],
    address: u32,
) -> Result<(), FlashError> {
    if let Err(e) = flash.unlock() {
        error!("Flash unlock failed: {:?}", e);
        return Err(FlashError::Unlock);
    }

    for (offset, value) in data.iter().enumerate() {
        let target = address.wrapping_add(offset as u32);

        if let Err(e) = flash.program_byte(target, *value) {
            error!("Programming failed at 0x{:08x}: {:?}", target, e);

            if let Err(e) = flash.lock() {
                warn!("Flash relock after failed write also failed: {:?}", e);
            }

            return Err(FlashError::Program { address: target });
        }
    }

    if let Err(e) = flash.lock() {
        error!("Flash lock failed: {:?}", e);
        return Err(FlashError::Lock);
    }

    debug!("Wrote {} bytes at 0x{:08x}", data.len(), address);

    Ok(())
}

/// Resolve a host erase selection against a table of `sectors` sectors.
///
/// The count is checked before anything else, the mass erase sentinel then
/// ignores it, and sector ranges running off the end of the table are
/// clamped to the sectors remaining.
pub fn plan_erase(
    sectors: u8,
    sector: u8,
    count: u8,
    voltage: VoltageRange,
) -> Result<EraseRequest, FlashError> {
    if count > sectors {
        return Err(FlashError::TooManySectors {
            requested: count,
            max: sectors,
        });
    }

    let kind = if sector == MASS_ERASE {
        EraseKind::Mass
    } else if sector < sectors {
        let remaining = sectors - sector;
        EraseKind::Sectors {
            first: sector,
            count: count.min(remaining),
        }
    } else {
        return Err(FlashError::SectorOutOfRange { sector, max: sectors });
    };

    Ok(EraseRequest { kind, voltage })
}

/// Erase `count` sectors from `sector`, or the whole device for the mass
/// erase sentinel.
///
/// The result is decided by the status word the interface reports, a call
/// that returns without error but with any status other than
/// [`ERASE_CLEAN`] has failed. Relock is always attempted.
pub fn erase<F: FlashController>(
    flash: &mut F,
    sectors: u8,
    sector: u8,
    count: u8,
    voltage: VoltageRange,
) -> Result<(), FlashError> {
    let request = plan_erase(sectors, sector, count, voltage).map_err(|e| {
        warn!("Erase refused: {}", e);
        e
    })?;

    match request.kind {
        EraseKind::Mass => info!("Mass erase"),
        EraseKind::Sectors { first, count } => info!("Erasing {} sectors from {}", count, first),
    }

    let result = match flash.unlock() {
        Ok(()) => match flash.erase(&request) {
            Ok(ERASE_CLEAN) => Ok(()),
            Ok(status) => Err(FlashError::EraseIncomplete { status }),
            Err(e) => {
                error!("Erase call failed: {:?}", e);
                Err(FlashError::EraseRejected)
            }
        },
        Err(e) => {
            error!("Flash unlock failed: {:?}", e);
            Err(FlashError::Unlock)
        }
    };

    if let Err(e) = flash.lock() {
        warn!("Flash lock after erase failed: {:?}", e);
    }

    result
}
