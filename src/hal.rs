//! Interfaces to the drivers the agent sits on top of.
//!
//! Everything behind these traits is a thin wrapper over a peripheral
//! (UART, CRC unit, flash interface, option bytes, debug MCU id) and
//! carries no decision logic of its own.
//!
//! The unlock / operate / lock sequences driven through [`FlashController`]
//! and [`OptionStore`] are not atomic: callers must guarantee that no other
//! control flow (interrupt handlers included) touches the flash or option
//! registers while an exchange is in progress.

use core::fmt::Debug;

use embedded_hal::serial::{Read, Write};

/// How long blocking transport reads may wait for the host.
#[derive(Copy, Clone, PartialEq, Debug)]
#[non_exhaustive]
pub enum WaitPolicy {
    /// Block until a byte arrives, however long that takes
    Unbounded,
}

/// Wait policy applied to every transport read, write and flush performed
/// by the agent
pub const HOST_WAIT: WaitPolicy = WaitPolicy::Unbounded;

/// Byte transport to the host
pub trait Transport<E>: Read<u8, Error = E> + Write<u8, Error = E> {}

impl<T, E> Transport<E> for T where T: Read<u8, Error = E> + Write<u8, Error = E> {}

/// Blocking read of a single byte under the provided wait policy
pub fn recv<T, E>(port: &mut T, wait: WaitPolicy) -> Result<u8, E>
where
    T: Read<u8, Error = E>,
{
    match wait {
        WaitPolicy::Unbounded => nb::block!(port.read()),
    }
}

/// Blocking write of a single byte under the provided wait policy
pub fn send<T, E>(port: &mut T, byte: u8, wait: WaitPolicy) -> Result<(), E>
where
    T: Write<u8, Error = E>,
{
    match wait {
        WaitPolicy::Unbounded => nb::block!(port.write(byte)),
    }
}

/// Blocking flush under the provided wait policy
pub fn flush<T, E>(port: &mut T, wait: WaitPolicy) -> Result<(), E>
where
    T: Write<u8, Error = E>,
{
    match wait {
        WaitPolicy::Unbounded => nb::block!(port.flush()),
    }
}

/// Hardware CRC accumulator
pub trait CrcUnit {
    /// Fold one 32-bit word into the running value, returning the new value
    fn accumulate(&mut self, word: u32) -> u32;

    /// Current value without folding anything in
    fn value(&self) -> u32;

    /// Return the accumulator to its initial value
    fn reset(&mut self);
}

/// Supply voltage range, selects erase parallelism and timing
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum VoltageRange {
    /// 1.8 V - 2.1 V
    Range1,
    /// 2.1 V - 2.7 V
    Range2,
    /// 2.7 V - 3.6 V
    Range3,
    /// 2.7 V - 3.6 V with external Vpp
    Range4,
}

/// Erase scope submitted to the flash interface
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum EraseKind {
    /// Every sector at once
    Mass,
    /// `count` consecutive sectors starting from `first`
    Sectors { first: u8, count: u8 },
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub struct EraseRequest {
    pub kind: EraseKind,
    pub voltage: VoltageRange,
}

/// Flash program / erase interface
pub trait FlashController {
    type Error: Debug;

    fn unlock(&mut self) -> Result<(), Self::Error>;

    fn lock(&mut self) -> Result<(), Self::Error>;

    /// Program a single byte
    fn program_byte(&mut self, address: u32, value: u8) -> Result<(), Self::Error>;

    /// Submit an erase, returning the sector status word reported by the
    /// interface (all ones when every sector erased cleanly, otherwise the
    /// index of the first sector that failed)
    fn erase(&mut self, request: &EraseRequest) -> Result<u32, Self::Error>;
}

/// A single option byte modification
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum OptionChange {
    /// Set the raw read protection option byte
    ReadProtection(u8),
    /// Enable or disable write protection for the sectors in `sectors`
    WriteProtection { enable: bool, sectors: u32 },
}

/// Snapshot of the option byte configuration
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct OptionBytes {
    /// Raw read protection option byte
    pub rdp: u8,
    /// Write protected sector mask
    pub wrp_sectors: u32,
}

/// Persistent option byte store, locked separately from the main flash
pub trait OptionStore {
    type Error: Debug;

    fn unlock_options(&mut self) -> Result<(), Self::Error>;

    /// Stage a modification, applied by [`OptionStore::launch_options`]
    fn program_options(&mut self, change: &OptionChange) -> Result<(), Self::Error>;

    /// Commit staged modifications
    fn launch_options(&mut self) -> Result<(), Self::Error>;

    fn lock_options(&mut self) -> Result<(), Self::Error>;

    fn read_options(&self) -> OptionBytes;
}

/// Device identification register
pub trait DeviceId {
    /// Raw identification code, device id in the low 12 bits
    fn device_id(&self) -> u32;
}

/// Everything the agent needs from the microcontroller itself
pub trait Mcu: FlashController + OptionStore + DeviceId {}

impl<T> Mcu for T where T: FlashController + OptionStore + DeviceId {}

/// Whole-system transfer of control to another image
pub trait Launcher {
    /// Start the image whose vector table sits at `entry_region_base`.
    /// Nothing owned by the caller survives this call.
    fn launch(&mut self, entry_region_base: u32) -> !;
}
