//! # Kernel Memory Context
//!
//! [`KernelMemory`] owns the three layers and brings them up in order:
//!
//! 1. the [`BitmapFrameAlloc`] from the boot memory map,
//! 2. the [`Vmm`], identity mapping low memory, the kernel image and the
//!    frame bitmap before paging is switched on,
//! 3. the [`Heap`], over an arena taken from the allocation window with
//!    [`Vmm::alloc_pages`].
//!
//! The context is owned by the boot routine and passed by reference; every
//! entry point takes `&mut self`. Nothing here is torn down again.

use crate::frame_alloc::{BitmapFrameAlloc, FrameAllocError, FrameStats};
use crate::heap::{Heap, HeapCorruption, HeapError, HeapStats};
use crate::vmm::{PagingStats, Vmm, VmmError};
use core::ptr::NonNull;
use kernel_info::boot::{BootMemoryInfo, PhysicalRange};
use kernel_info::memory::{FRAME_SIZE, MemoryLayout};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::{Mmu, PageEntry, PhysMapper};
use log::{error, info};

/// Why bringing up memory management failed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("frame allocator: {0}")]
    FrameAllocator(#[from] FrameAllocError),
    #[error("paging init: {source} ({free_frames}/{total_frames} frames free)")]
    Paging {
        source: VmmError,
        free_frames: u64,
        total_frames: u64,
    },
    #[error("heap arena of {bytes} bytes: {source} ({free_frames}/{total_frames} frames free)")]
    HeapArena {
        source: VmmError,
        bytes: u64,
        free_frames: u64,
        total_frames: u64,
    },
    #[error("heap arena mapped at {0:?}, which is not addressable")]
    ArenaAddress(VirtualAddress),
    #[error("heap: {0}")]
    Heap(#[from] HeapError),
}

pub struct KernelMemory<'a, M: PhysMapper, T: Mmu> {
    pmm: BitmapFrameAlloc<'a>,
    vmm: Vmm<'a, M, T>,
    heap: Heap,
    heap_base: VirtualAddress,
}

impl<'a, M: PhysMapper, T: Mmu> KernelMemory<'a, M, T> {
    /// Boots all three layers, placing the frame bitmap inside usable RAM.
    ///
    /// # Errors
    /// The first layer that fails, with the frame counters at that point.
    ///
    /// # Safety
    /// `mapper` must reach all physical memory listed in `info` for `'a`;
    /// `mmu` must be the only driver of the paging hardware.
    pub unsafe fn boot(
        info: &BootMemoryInfo<'_>,
        mapper: &'a M,
        mmu: T,
        layout: &MemoryLayout,
    ) -> Result<Self, BootError> {
        let pmm = unsafe { BitmapFrameAlloc::init_in_place(info, &[], mapper)? };
        unsafe { Self::boot_with_pmm(pmm, info.kernel_image, mapper, mmu, layout) }
    }

    /// Boots paging and the heap on top of an already built frame allocator.
    ///
    /// # Errors
    /// [`BootError::Paging`], [`BootError::HeapArena`] or [`BootError::Heap`].
    ///
    /// # Safety
    /// As [`boot`](Self::boot).
    pub unsafe fn boot_with_pmm(
        mut pmm: BitmapFrameAlloc<'a>,
        kernel_image: PhysicalRange,
        mapper: &'a M,
        mmu: T,
        layout: &MemoryLayout,
    ) -> Result<Self, BootError> {
        let bitmap = pmm.placement().unwrap_or(PhysicalRange::from_len(0, 0));
        let bootstrap = [kernel_image, bitmap];

        let mut vmm = unsafe { Vmm::init(mapper, mmu, &mut pmm, layout, &bootstrap) }.map_err(
            |source| BootError::Paging {
                source,
                free_frames: pmm.free_frames(),
                total_frames: pmm.total_frames(),
            },
        )?;

        let heap_base = vmm
            .alloc_pages(&mut pmm, layout.heap_bytes / FRAME_SIZE, PageEntry::kernel_data())
            .map_err(|source| BootError::HeapArena {
                source,
                bytes: layout.heap_bytes,
                free_frames: pmm.free_frames(),
                total_frames: pmm.total_frames(),
            })?;

        let arena = NonNull::new(heap_base.as_u64() as *mut u8)
            .ok_or(BootError::ArenaAddress(heap_base))?;
        #[allow(clippy::cast_possible_truncation)]
        let heap = unsafe { Heap::new(arena, layout.heap_bytes as usize)? };

        let memory = Self {
            pmm,
            vmm,
            heap,
            heap_base,
        };
        memory.log_summary();
        Ok(memory)
    }

    /// [`boot`](Self::boot) for the kernel entry point: there is nothing to
    /// fall back to, so failure halts with the diagnostic.
    ///
    /// # Panics
    /// If any layer fails to come up.
    ///
    /// # Safety
    /// As [`boot`](Self::boot).
    pub unsafe fn boot_or_halt(
        info: &BootMemoryInfo<'_>,
        mapper: &'a M,
        mmu: T,
        layout: &MemoryLayout,
    ) -> Self {
        match unsafe { Self::boot(info, mapper, mmu, layout) } {
            Ok(memory) => memory,
            Err(err) => {
                error!("mm: bootstrap failed: {err}");
                panic!("memory management bootstrap failed: {err}");
            }
        }
    }

    pub fn pmm_alloc_frame(&mut self) -> Option<PhysicalAddress> {
        self.pmm.alloc_frame()
    }

    /// # Errors
    /// See [`BitmapFrameAlloc::free_frame`].
    pub fn pmm_free_frame(&mut self, address: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.pmm.free_frame(address)
    }

    #[must_use]
    pub const fn pmm_total_frames(&self) -> u64 {
        self.pmm.total_frames()
    }

    #[must_use]
    pub const fn pmm_free_frames(&self) -> u64 {
        self.pmm.free_frames()
    }

    #[must_use]
    pub const fn pmm_used_frames(&self) -> u64 {
        self.pmm.used_frames()
    }

    /// # Errors
    /// See [`Vmm::map_page`].
    pub fn map_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntry,
    ) -> Result<(), VmmError> {
        self.vmm.map_page(&mut self.pmm, va, pa, flags)
    }

    /// # Errors
    /// See [`Vmm::unmap_page`].
    pub fn unmap_page(&mut self, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        self.vmm.unmap_page(&mut self.pmm, va)
    }

    #[must_use]
    pub fn get_physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.get_physical_address(va)
    }

    /// # Errors
    /// See [`Vmm::alloc_pages`].
    pub fn alloc_pages(&mut self, pages: u64, flags: PageEntry) -> Result<VirtualAddress, VmmError> {
        self.vmm.alloc_pages(&mut self.pmm, pages, flags)
    }

    /// # Errors
    /// See [`Vmm::free_pages`].
    pub fn free_pages(&mut self, va: VirtualAddress, pages: u64) -> Result<u64, VmmError> {
        self.vmm.free_pages(&mut self.pmm, va, pages)
    }

    /// Page-granular kernel data pages, bypassing the heap.
    ///
    /// # Errors
    /// See [`Vmm::alloc_pages`].
    pub fn kmalloc_pages(&mut self, pages: u64) -> Result<VirtualAddress, VmmError> {
        self.alloc_pages(pages, PageEntry::kernel_data())
    }

    /// Releases pages from [`kmalloc_pages`](Self::kmalloc_pages).
    ///
    /// # Errors
    /// See [`Vmm::free_pages`].
    pub fn kfree_pages(&mut self, va: VirtualAddress, pages: u64) -> Result<u64, VmmError> {
        self.free_pages(va, pages)
    }

    /// # Errors
    /// See [`Heap::alloc`].
    pub fn kmalloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.alloc(size)
    }

    /// # Errors
    /// See [`Heap::zalloc`].
    pub fn kzalloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.zalloc(size)
    }

    /// # Errors
    /// See [`Heap::calloc`].
    pub fn kcalloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.calloc(count, size)
    }

    /// # Errors
    /// See [`Heap::realloc`].
    ///
    /// # Safety
    /// See [`Heap::realloc`].
    pub unsafe fn krealloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        unsafe { self.heap.realloc(ptr, new_size) }
    }

    /// # Errors
    /// See [`Heap::free`].
    ///
    /// # Safety
    /// See [`Heap::free`].
    pub unsafe fn kfree(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        unsafe { self.heap.free(ptr) }
    }

    /// # Errors
    /// See [`Heap::alloc_aligned`].
    pub fn kmalloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.alloc_aligned(size, align)
    }

    /// # Errors
    /// See [`Heap::zalloc_aligned`].
    pub fn kzalloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        self.heap.zalloc_aligned(size, align)
    }

    /// # Errors
    /// See [`Heap::strdup`].
    pub fn kstrdup(&mut self, s: &str) -> Result<NonNull<u8>, HeapError> {
        self.heap.strdup(s)
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// # Errors
    /// The first inconsistency in the block list.
    pub fn heap_validate(&self) -> Result<(), HeapCorruption> {
        self.heap.validate()
    }

    #[must_use]
    pub const fn frame_stats(&self) -> FrameStats {
        self.pmm.stats()
    }

    #[must_use]
    pub const fn paging_stats(&self) -> PagingStats {
        self.vmm.stats()
    }

    /// Virtual base of the heap arena.
    #[must_use]
    pub const fn heap_base(&self) -> VirtualAddress {
        self.heap_base
    }

    #[must_use]
    pub const fn pmm(&self) -> &BitmapFrameAlloc<'a> {
        &self.pmm
    }

    pub const fn pmm_mut(&mut self) -> &mut BitmapFrameAlloc<'a> {
        &mut self.pmm
    }

    #[must_use]
    pub const fn vmm(&self) -> &Vmm<'a, M, T> {
        &self.vmm
    }

    /// The VMM together with the frame allocator its calls take.
    pub const fn vmm_mut(&mut self) -> (&mut Vmm<'a, M, T>, &mut BitmapFrameAlloc<'a>) {
        (&mut self.vmm, &mut self.pmm)
    }

    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    pub const fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn log_summary(&self) {
        let frames = self.pmm.stats();
        info!(
            "mm: {} of {} frames free, heap {} KiB at {:?}",
            frames.free,
            frames.total,
            self.heap.arena_len() / 1024,
            self.heap_base
        );
        self.vmm.log_stats();
        self.heap.log_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostMemory, hosted_layout, test_pmm};
    use kernel_vmem::mmu::SoftMmu;

    #[test]
    fn boot_brings_up_all_layers() {
        let ram = HostMemory::with_frames(128);
        let mapper = ram.mapper();
        let window = HostMemory::with_frames(32);
        let mut storage = [0u64; 2];
        let pmm = test_pmm(&mut storage, 128, 4);

        let mut mm = unsafe {
            KernelMemory::boot_with_pmm(
                pmm,
                PhysicalRange::from_len(0, 4 * FRAME_SIZE),
                &mapper,
                SoftMmu::new(),
                &hosted_layout(&window),
            )
        }
        .unwrap();

        assert!(mm.vmm().mmu().paging);
        assert_eq!(mm.heap_base().as_u64(), window.base().as_ptr() as u64);
        assert!(mm.vmm().validate_range(mm.heap_base(), 8));
        assert_eq!(mm.heap_stats().total_bytes, 8 * 4096);
        assert_eq!(
            mm.pmm_used_frames() + mm.pmm_free_frames(),
            mm.pmm_total_frames()
        );

        let p = mm.kmalloc(100).unwrap();
        let s = mm.kstrdup("mm").unwrap();
        assert!(mm.heap().contains(p.as_ptr()));
        unsafe {
            mm.kfree(p).unwrap();
            mm.kfree(s).unwrap();
        }
        mm.heap_validate().unwrap();
    }

    #[test]
    fn page_allocations_return_every_frame() {
        let ram = HostMemory::with_frames(128);
        let mapper = ram.mapper();
        let window = HostMemory::with_frames(32);
        let mut storage = [0u64; 2];
        let pmm = test_pmm(&mut storage, 128, 4);
        let mut mm = unsafe {
            KernelMemory::boot_with_pmm(
                pmm,
                PhysicalRange::from_len(0, 0),
                &mapper,
                SoftMmu::new(),
                &hosted_layout(&window),
            )
        }
        .unwrap();

        let free = mm.pmm_free_frames();
        let va = mm.kmalloc_pages(4).unwrap();
        // Four data frames, plus a page table if the pages start a new one.
        assert!(mm.pmm_free_frames() <= free - 4);
        let pa = mm.get_physical_address(va + 0x10).unwrap();
        assert_eq!(pa.as_u64() & 0xFFF, 0x10);

        assert_eq!(mm.kfree_pages(va, 4), Ok(4));
        assert_eq!(mm.pmm_free_frames(), free);
        assert!(mm.get_physical_address(va).is_none());
    }

    #[test]
    fn heap_arena_failure_reports_counters() {
        let ram = HostMemory::with_frames(32);
        let mapper = ram.mapper();
        let window = HostMemory::with_frames(32);
        let mut storage = [0u64; 1];
        let pmm = test_pmm(&mut storage, 32, 4);
        let layout = hosted_layout(&window).with_heap_bytes(30 * FRAME_SIZE);

        let err = unsafe {
            KernelMemory::boot_with_pmm(
                pmm,
                PhysicalRange::from_len(0, 0),
                &mapper,
                SoftMmu::new(),
                &layout,
            )
        }
        .err()
        .unwrap();
        assert!(matches!(
            err,
            BootError::HeapArena {
                bytes,
                total_frames: 32,
                ..
            } if bytes == 30 * FRAME_SIZE
        ));
        assert!(err.to_string().contains("frames free"));
    }
}
