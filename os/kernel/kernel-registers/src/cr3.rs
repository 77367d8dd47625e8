#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// CR3 — physical base of the active PML4 (PCID disabled).
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2 — reserved.
    #[bits(3)]
    __: u8,

    /// Bit 3 — PWT for accesses to the PML4 itself.
    pub write_through: bool,

    /// Bit 4 — PCD for accesses to the PML4 itself.
    pub cache_disable: bool,

    /// Bits 5–11 — reserved.
    #[bits(7)]
    __: u8,

    /// Bits 12–51 — PML4 frame number.
    #[bits(40)]
    pml4_frame: u64,

    /// Bits 52–63 — reserved.
    #[bits(12)]
    __: u16,
}

impl Cr3 {
    /// CR3 value selecting `pml4` with write-back caching.
    #[must_use]
    pub const fn for_root(pml4: PhysicalPage<Size4K>) -> Self {
        Self::new().with_pml4_frame(pml4.number())
    }

    /// The PML4 this value selects.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.pml4_frame())
    }

    /// Physical address of the PML4.
    #[must_use]
    pub const fn root_address(&self) -> PhysicalAddress {
        self.root().base()
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
