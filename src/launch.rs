//! Transfer of control to a flashed image

pub use crate::hal::Launcher;

use crate::memory::{MemoryMap, Validity};

/// First two words of a Cortex-M vector table
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct VectorTable {
    /// Initial main stack pointer
    pub stack_pointer: u32,
    /// Reset handler address
    pub reset: u32,
}

impl VectorTable {
    /// Bytes occupied by the two words
    pub const LEN: u32 = 8;

    /// Required alignment of a table base
    pub const ALIGN: u32 = 4;

    /// Whether `base` can hold a vector table readable by [`VectorTable::read`]
    pub fn fits(map: &MemoryMap, base: u32) -> bool {
        base % Self::ALIGN == 0 && map.classify_span(base, Self::LEN) == Validity::Valid
    }

    /// Read the vector table at `table`.
    ///
    /// # Safety
    ///
    /// `table` must be word aligned and point at two readable words.
    pub unsafe fn read(table: *const u32) -> Self {
        Self {
            stack_pointer: core::ptr::read_volatile(table),
            reset: core::ptr::read_volatile(table.add(1)),
        }
    }
}

/// Launcher for the real core.
///
/// This is the one place the agent steps outside of ownership: the stack
/// the caller is running on is abandoned and every value it holds,
/// including the frame buffer, becomes meaningless.
#[cfg(feature = "cortex-m")]
pub struct CortexM<R> {
    reset_peripherals: R,
}

#[cfg(feature = "cortex-m")]
impl<R: FnMut()> CortexM<R> {
    /// `reset_peripherals` returns clocks and shared peripherals to their
    /// reset state before the image starts
    pub fn new(reset_peripherals: R) -> Self {
        Self { reset_peripherals }
    }
}

#[cfg(feature = "cortex-m")]
impl<R: FnMut()> Launcher for CortexM<R> {
    fn launch(&mut self, entry_region_base: u32) -> ! {
        // SAFETY: Go only launches bases accepted by `VectorTable::fits`, word
        // aligned with both words inside one memory window. The configured
        // application base is trusted to satisfy the same. Whether an image is
        // actually present there is outside of what the agent can check.
        let vectors = unsafe { VectorTable::read(entry_region_base as *const u32) };

        info!(
            "Launching image at 0x{:08x} (msp 0x{:08x}, reset 0x{:08x})",
            entry_region_base, vectors.stack_pointer, vectors.reset
        );

        (self.reset_peripherals)();

        // SAFETY: loads MSP and branches to the reset vector in one step,
        // nothing on the current stack is touched afterwards.
        unsafe {
            cortex_m::asm::bootstrap(
                vectors.stack_pointer as *const u32,
                vectors.reset as *const u32,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::Config;

    #[test]
    fn reads_stack_pointer_then_reset() {
        let table: [u32; 2] = [0x2005_0000, 0x0801_0199];

        let v = unsafe { VectorTable::read(table.as_ptr()) };

        assert_eq!(v.stack_pointer, 0x2005_0000);
        assert_eq!(v.reset, 0x0801_0199);
    }

    #[test]
    fn table_base_must_be_aligned_and_mapped() {
        let map = Config::STM32F756.memory;

        assert!(VectorTable::fits(&map, 0x0801_0000));
        assert!(VectorTable::fits(&map, 0x2001_0000));
        assert!(VectorTable::fits(&map, 0x080F_FFF8));

        assert!(!VectorTable::fits(&map, 0x0801_0001));
        assert!(!VectorTable::fits(&map, 0x0801_0002));
        assert!(!VectorTable::fits(&map, 0x080F_FFFC));
        assert!(!VectorTable::fits(&map, 0x0000_0000));
    }
}
