//! # Virtual Memory Support
//!
//! x86-64 4-level paging: typed entries, table nodes and an
//! [`AddressSpace`] that walks, creates, and tears down translations.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!   │        │        │        │
//!   │        │        │        └───► PTE   → maps 4 KiB page
//!   │        │        └────────────► PDE   → PS=1 → 2 MiB page
//!   │        └─────────────────────► PDPTE → PS=1 → 1 GiB page
//!   └──────────────────────────────► PML4E
//! ```
//!
//! Each level consumes 9 bits of the virtual address as an index into a
//! 512-entry [`PageTable`]; the low 12 bits are the offset into the page.
//!
//! ## Collaborators
//!
//! The walker never owns memory. It is parameterized over three seams:
//!
//! | Trait | Role |
//! |-------|------|
//! | [`PhysMapper`] | Turns a physical table frame into a pointer the kernel can dereference (direct map, identity map, or a test buffer). |
//! | [`PhysFrameAlloc`] | Hands out and takes back 4 KiB frames for new table nodes. |
//! | [`Mmu`] | CR3, CR0.PG and TLB invalidation, see [`mmu`]. |
//!
//! New mappings only ever install 4 KiB leaves. Large 2 MiB / 1 GiB leaves
//! created by the boot loader are understood by [`AddressSpace::translate`],
//! and mapping below them is rejected.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod entry;
pub mod mmu;
mod table;

pub use address_space::{AddressSpace, MapError, Translation, UnmapError, Unmapped};
pub use entry::PageEntry;
pub use mmu::Mmu;
pub use table::{ENTRIES_PER_TABLE, Level, PageTable, TableIndex, split_indices};

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Source and sink of 4 KiB physical frames for page-table nodes and mapped
/// pages.
pub trait PhysFrameAlloc {
    /// One free frame, or `None` when physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Returns a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, frame: PhysicalPage<Size4K>);
}

/// Access to physical memory from the running kernel.
///
/// # Safety
/// Implementations must return a pointer through which the whole 4 KiB frame
/// containing `pa` is readable and writable for as long as the mapper lives,
/// and the pointer must not alias memory the kernel uses otherwise.
pub unsafe trait PhysMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    /// The table node stored in `frame`.
    ///
    /// # Safety
    /// `frame` must hold a page table (or be about to be zeroed into one) and
    /// no other reference to it may be live.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut<'a>(&self, frame: PhysicalPage<Size4K>) -> &'a mut PageTable {
        unsafe { &mut *self.phys_to_ptr(frame.base()).cast::<PageTable>() }
    }
}
