//! Host address validation

/// Inclusive address window
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Region {
    pub base: u32,
    pub end: u32,
}

impl Region {
    pub const fn new(base: u32, end: u32) -> Self {
        Self { base, end }
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.base && address <= self.end
    }

    /// Whether all `len` bytes from `address` sit inside this window
    pub fn contains_span(&self, address: u32, len: u32) -> bool {
        match len.checked_sub(1).and_then(|n| address.checked_add(n)) {
            Some(last) => self.contains(address) && self.contains(last),
            None => false,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Validity {
    Valid,
    Invalid,
}

/// The fixed set of windows a host may read, write or jump into:
/// two RAM regions followed by the flash region.
#[derive(Clone, PartialEq, Debug)]
pub struct MemoryMap {
    regions: [Region; 3],
}

impl MemoryMap {
    pub const fn new(regions: [Region; 3]) -> Self {
        Self { regions }
    }

    pub fn regions(&self) -> &[Region; 3] {
        &self.regions
    }

    pub fn flash(&self) -> Region {
        self.regions[2]
    }

    /// Classify an address against the configured windows
    pub fn classify(&self, address: u32) -> Validity {
        if self.regions.iter().any(|r| r.contains(address)) {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }

    /// Classify a `len` byte span, valid only when one window holds all of it
    pub fn classify_span(&self, address: u32, len: u32) -> Validity {
        if self.regions.iter().any(|r| r.contains_span(address, len)) {
            Validity::Valid
        } else {
            Validity::Invalid
        }
    }
}
