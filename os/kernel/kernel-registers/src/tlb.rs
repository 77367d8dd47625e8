//! Translation lookaside buffer maintenance.

use kernel_memory_addresses::VirtualAddress;

/// Invalidates the TLB entry (and paging-structure cache entries) for `va`.
///
/// # Safety
/// Ring 0 only.
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Flushes all non-global TLB entries by reloading CR3 with itself.
///
/// # Safety
/// Ring 0 only.
#[inline]
pub unsafe fn flush_all() {
    unsafe {
        core::arch::asm!(
            "mov {tmp}, cr3",
            "mov cr3, {tmp}",
            tmp = out(reg) _,
            options(nostack, preserves_flags)
        );
    }
}
