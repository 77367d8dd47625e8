//! # Paging Hardware
//!
//! The [`Mmu`] trait is the only way the memory manager reaches CR0, CR3 and
//! the TLB. [`X86Mmu`] (feature `asm`) drives the real registers;
//! [`SoftMmu`] is a software model for hosted runs that records what the
//! hardware would have been asked to do.

use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

pub trait Mmu {
    /// `CR0.PG` is set.
    fn paging_enabled(&self) -> bool;

    /// The PML4 currently loaded in CR3.
    fn active_root(&self) -> PhysicalPage<Size4K>;

    /// Loads `root` into CR3, implicitly flushing non-global TLB entries.
    ///
    /// # Safety
    /// `root` must be a valid PML4 that maps the currently executing code,
    /// the stack, and everything the kernel touches next.
    unsafe fn switch_root(&mut self, root: PhysicalPage<Size4K>);

    /// Sets `CR0.PG` (and `CR0.PE`).
    ///
    /// # Safety
    /// CR3 must already hold a valid PML4 identity-mapping the executing code.
    unsafe fn enable_paging(&mut self);

    /// Drops the cached translation for the page containing `va`.
    fn invalidate_page(&mut self, va: VirtualAddress);

    /// Drops all non-global cached translations.
    fn flush_all(&mut self);
}

/// The real CPU.
#[cfg(feature = "asm")]
pub struct X86Mmu {
    _private: (),
}

#[cfg(feature = "asm")]
impl X86Mmu {
    /// # Safety
    /// Ring 0 only; there must be a single instance driving the CPU.
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(feature = "asm")]
impl Mmu for X86Mmu {
    fn paging_enabled(&self) -> bool {
        use kernel_registers::{LoadRegisterUnsafe, cr0::Cr0};
        unsafe { Cr0::load_unsafe() }.paging_active()
    }

    fn active_root(&self) -> PhysicalPage<Size4K> {
        use kernel_registers::{LoadRegisterUnsafe, cr3::Cr3};
        unsafe { Cr3::load_unsafe() }.root()
    }

    unsafe fn switch_root(&mut self, root: PhysicalPage<Size4K>) {
        use kernel_registers::{StoreRegisterUnsafe, cr3::Cr3};
        unsafe { Cr3::for_root(root).store_unsafe() };
    }

    unsafe fn enable_paging(&mut self) {
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe, cr0::Cr0};
        unsafe {
            Cr0::load_unsafe()
                .with_protection_enable(true)
                .with_paging(true)
                .store_unsafe();
        }
    }

    fn invalidate_page(&mut self, va: VirtualAddress) {
        unsafe { kernel_registers::tlb::invlpg(va) };
    }

    fn flush_all(&mut self) {
        unsafe { kernel_registers::tlb::flush_all() };
    }
}

/// Software model of the paging registers.
///
/// Keeps CR3 and CR0.PG as plain fields and counts invalidations, which is
/// what hosted tests assert on.
#[derive(Debug, Default, Clone)]
pub struct SoftMmu {
    pub root: Option<PhysicalPage<Size4K>>,
    pub paging: bool,
    pub invalidated_pages: u64,
    pub full_flushes: u64,
    pub root_switches: u64,
}

impl SoftMmu {
    /// Paging off, CR3 empty; what a BIOS-style boot hands over.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: None,
            paging: false,
            invalidated_pages: 0,
            full_flushes: 0,
            root_switches: 0,
        }
    }

    /// Paging already on with `root` loaded; what a UEFI loader hands over.
    #[must_use]
    pub const fn with_active_root(root: PhysicalPage<Size4K>) -> Self {
        Self {
            root: Some(root),
            paging: true,
            invalidated_pages: 0,
            full_flushes: 0,
            root_switches: 0,
        }
    }
}

impl Mmu for SoftMmu {
    fn paging_enabled(&self) -> bool {
        self.paging
    }

    fn active_root(&self) -> PhysicalPage<Size4K> {
        self.root.unwrap_or(PhysicalPage::from_number(0))
    }

    unsafe fn switch_root(&mut self, root: PhysicalPage<Size4K>) {
        self.root = Some(root);
        self.root_switches += 1;
    }

    unsafe fn enable_paging(&mut self) {
        self.paging = true;
    }

    fn invalidate_page(&mut self, _va: VirtualAddress) {
        self.invalidated_pages += 1;
    }

    fn flush_all(&mut self) {
        self.full_flushes += 1;
    }
}
