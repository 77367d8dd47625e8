//! # Boot Memory Handoff
//!
//! What the boot loader tells the kernel about physical memory: a list of
//! `{base, length, kind}` regions plus the physical extent of the loaded kernel
//! image. The memory manager consumes this exactly once, when the frame
//! allocator is initialized.

use kernel_memory_addresses::PhysicalAddress;

/// Classification of a physical memory region, following the E820 numbering.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand out.
    Usable = 1,
    /// Firmware or device reserved; never touched.
    Reserved = 2,
    /// ACPI tables; reclaimable after they have been parsed.
    AcpiReclaimable = 3,
    /// ACPI non-volatile storage.
    AcpiNvs = 4,
    /// RAM reported as defective.
    BadMemory = 5,
}

impl MemoryRegionKind {
    /// Decodes a raw E820 type. Unknown types are treated as reserved.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::Usable,
            3 => Self::AcpiReclaimable,
            4 => Self::AcpiNvs,
            5 => Self::BadMemory,
            _ => Self::Reserved,
        }
    }

    /// Only [`Usable`](Self::Usable) memory is ever handed out.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        matches!(self, Self::Usable)
    }
}

/// One entry of the boot memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    #[must_use]
    pub const fn reserved(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Reserved)
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// A half-open physical range `[start, end)`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PhysicalRange {
    pub start: PhysicalAddress,
    pub end: PhysicalAddress,
}

impl PhysicalRange {
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn from_len(start: u64, len: u64) -> Self {
        Self {
            start: PhysicalAddress::new(start),
            end: PhysicalAddress::new(start.saturating_add(len)),
        }
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the memory manager needs from the boot loader.
#[derive(Debug, Copy, Clone)]
pub struct BootMemoryInfo<'a> {
    /// The firmware memory map. Regions may be unsorted and may overlap.
    pub regions: &'a [MemoryRegion],

    /// Physical extent of the loaded kernel image (text, data and bss).
    pub kernel_image: PhysicalRange,
}

impl BootMemoryInfo<'_> {
    /// Highest end address of any region in the map.
    #[must_use]
    pub fn highest_address(&self) -> u64 {
        self.regions.iter().map(MemoryRegion::end).max().unwrap_or(0)
    }

    /// Sum of the lengths of all usable regions.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.kind.is_usable())
            .map(|r| r.length)
            .sum()
    }
}
