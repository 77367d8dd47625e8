#[cfg(feature = "asm")]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR0 as far as paging bring-up is concerned.
///
/// The x87/cache control bits are kept opaque in `other_low`/`other_mid` so a
/// read-modify-write preserves them unchanged.
#[bitfield(u64)]
pub struct Cr0 {
    /// Bit 0 — PE: protected mode. Required before PG can be set.
    pub protection_enable: bool,

    /// Bits 1–15 — MP, EM, TS, ET, NE and reserved bits.
    #[bits(15)]
    pub other_low: u16,

    /// Bit 16 — WP: supervisor writes honour read-only pages.
    pub write_protect: bool,

    /// Bits 17–30 — AM, NW, CD and reserved bits.
    #[bits(14)]
    pub other_mid: u16,

    /// Bit 31 — PG: paging enabled.
    pub paging: bool,

    /// Bits 32–63 — reserved.
    #[bits(32)]
    __: u32,
}

impl Cr0 {
    /// Whether both protection and paging are on.
    #[must_use]
    pub const fn paging_active(&self) -> bool {
        self.protection_enable() && self.paging()
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr0 {
    unsafe fn load_unsafe() -> Self {
        let cr0: u64;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) cr0, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr0)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr0 {
    unsafe fn store_unsafe(self) {
        let cr0 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) cr0, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paging_bit_is_31() {
        let cr0 = Cr0::new().with_protection_enable(true).with_paging(true);
        assert_eq!(cr0.into_bits(), 0x8000_0001);
        assert!(cr0.paging_active());
        assert!(!Cr0::new().with_paging(true).paging_active());
    }

    #[test]
    fn read_modify_write_keeps_other_bits() {
        let raw = 0x0005_0033_u64; // PE | MP | NE | ET | WP | AM
        let cr0 = Cr0::from_bits(raw).with_paging(true);
        assert_eq!(cr0.into_bits(), raw | (1 << 31));
        assert!(cr0.write_protect());
    }
}
