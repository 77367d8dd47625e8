//! # Kernel Virtual Memory Manager
//!
//! [`Vmm`] drives one active [`AddressSpace`] and the paging hardware behind
//! an [`Mmu`]. On top of the single-page walker it adds:
//!
//! - TLB maintenance after every change of a live translation,
//! - range operations with rollback,
//! - a kernel *allocation window*, a fixed virtual range handed out in page
//!   granularity by [`Vmm::alloc_pages`] (bump pointer plus a list of
//!   released ranges),
//! - named [`VmRegion`] bookkeeping,
//! - [`PagingStats`] counters.
//!
//! Frames for page tables and for `alloc_pages` come from any
//! [`PhysFrameAlloc`], passed per call.

use arrayvec::ArrayVec;
use core::fmt;
use kernel_info::boot::PhysicalRange;
use kernel_info::memory::{FRAME_SIZE, MAX_VM_REGIONS, MAX_WINDOW_HOLES, MemoryLayout};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, align_down, align_up,
};
use kernel_vmem::{
    AddressSpace, Level, MapError, Mmu, PageEntry, PhysFrameAlloc, PhysMapper, UnmapError,
};
use log::{debug, error, info, trace, warn};

/// First address of the higher (kernel) half.
const KERNEL_HALF_BASE: u64 = 0xffff_8000_0000_0000;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Unmap(#[from] UnmapError),
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("no {pages} contiguous pages left in the allocation window")]
    WindowExhausted { pages: u64 },
    #[error("request for zero pages")]
    ZeroPages,
    #[error("{va:?} (+{pages} pages) is not inside the allocation window")]
    NotInWindow { va: VirtualAddress, pages: u64 },
    #[error("{va:?} (+{pages} pages) overlaps a range that is already free")]
    NotAllocated { va: VirtualAddress, pages: u64 },
    #[error("length {0:#x} is not a multiple of the page size")]
    UnalignedLength(u64),
    #[error("memory layout is inconsistent: {0:?}")]
    InvalidLayout(MemoryLayout),
    #[error("region [{start:?}, {end:?}) is empty or overlaps an existing region")]
    RegionOverlap {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("all {0} region slots are in use")]
    RegionTableFull(usize),
    #[error("no region [{start:?}, {end:?})")]
    RegionNotFound {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    #[error("directory {0:?} is the kernel directory or currently active")]
    DirectoryInUse(PhysicalPage<Size4K>),
}

/// Running counters of the paging layer.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PagingStats {
    pub pages_mapped: u64,
    pub pages_unmapped: u64,
    /// Single-page invalidations plus full flushes.
    pub tlb_flushes: u64,
    /// Failed `alloc_pages` calls.
    pub allocation_failures: u64,
    pub tables_allocated: u64,
    pub tables_reclaimed: u64,
}

/// A named, page-aligned range of reserved kernel address space.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct VmRegion {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
    pub flags: PageEntry,
    pub name: &'static str,
}

impl VmRegion {
    #[inline]
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.start <= va && va < self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64() - self.start.as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for VmRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VmRegion({:?}..{:?} {} W={} U={} NX={})",
            self.start,
            self.end,
            self.name,
            self.flags.writable(),
            self.flags.user_access(),
            self.flags.no_execute()
        )
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct Hole {
    start: u64,
    pages: u64,
}

impl Hole {
    const fn end(&self) -> u64 {
        self.start + self.pages * FRAME_SIZE
    }
}

/// Page-granular allocator for the kernel allocation window.
///
/// Released ranges are kept sorted and coalesced; a range adjacent to the
/// bump pointer lowers it instead.
#[derive(Debug)]
struct AllocWindow {
    base: u64,
    end: u64,
    next: u64,
    holes: ArrayVec<Hole, MAX_WINDOW_HOLES>,
}

impl AllocWindow {
    const fn new(base: u64, bytes: u64) -> Self {
        Self {
            base,
            end: base + bytes,
            next: base,
            holes: ArrayVec::new_const(),
        }
    }

    fn contains(&self, start: u64, pages: u64) -> bool {
        pages
            .checked_mul(FRAME_SIZE)
            .and_then(|len| start.checked_add(len))
            .is_some_and(|end| self.base <= start && end <= self.next)
    }

    fn covers(&self, addr: u64) -> bool {
        self.base <= addr && addr < self.end
    }

    /// `[start, start + pages)` was handed out and is not part of a hole.
    fn is_reserved(&self, start: u64, pages: u64) -> bool {
        if !self.contains(start, pages) {
            return false;
        }
        let end = start + pages * FRAME_SIZE;
        !self.holes.iter().any(|h| h.start < end && start < h.end())
    }

    fn reserve(&mut self, pages: u64) -> Option<u64> {
        let len = pages.checked_mul(FRAME_SIZE)?;

        if let Some(i) = self.holes.iter().position(|h| h.pages >= pages) {
            let hole = &mut self.holes[i];
            let start = hole.start;
            hole.start += len;
            hole.pages -= pages;
            if hole.pages == 0 {
                self.holes.remove(i);
            }
            return Some(start);
        }

        let start = self.next;
        let end = start.checked_add(len)?;
        if end > self.end {
            return None;
        }
        self.next = end;
        Some(start)
    }

    /// Returns `[start, start + pages)` to the window. Returns `false` when
    /// the range had to be dropped because the hole list is full.
    fn release(&mut self, start: u64, pages: u64) -> bool {
        let end = start + pages * FRAME_SIZE;

        if end == self.next {
            self.next = start;
            while let Some(last) = self.holes.last()
                && last.end() == self.next
            {
                self.next = last.start;
                self.holes.pop();
            }
            return true;
        }

        let i = self.holes.partition_point(|h| h.start < start);
        let merges_prev = i > 0 && self.holes[i - 1].end() == start;
        let merges_next = i < self.holes.len() && self.holes[i].start == end;

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.holes.remove(i);
                self.holes[i - 1].pages += pages + next.pages;
            }
            (true, false) => self.holes[i - 1].pages += pages,
            (false, true) => {
                self.holes[i].start = start;
                self.holes[i].pages += pages;
            }
            (false, false) => {
                if self.holes.try_insert(i, Hole { start, pages }).is_err() {
                    return false;
                }
            }
        }
        true
    }

    fn free_pages(&self) -> u64 {
        let tail = (self.end - self.next) / FRAME_SIZE;
        tail + self.holes.iter().map(|h| h.pages).sum::<u64>()
    }
}

pub struct Vmm<'m, M: PhysMapper, T: Mmu> {
    mapper: &'m M,
    mmu: T,
    kernel_root: PhysicalPage<Size4K>,
    active_root: PhysicalPage<Size4K>,
    window: AllocWindow,
    regions: ArrayVec<VmRegion, MAX_VM_REGIONS>,
    stats: PagingStats,
}

impl<'m, M: PhysMapper, T: Mmu> Vmm<'m, M, T> {
    /// Brings up paging.
    ///
    /// If paging is already enabled the loader's PML4 is adopted as the
    /// kernel directory, otherwise a fresh one is allocated. The first
    /// `layout.identity_map_bytes` of physical memory and every range in
    /// `bootstrap` (kernel image, frame bitmap) are identity mapped;
    /// pages that are already translated are left alone. The directory is
    /// then loaded into CR3 and paging is switched on.
    ///
    /// # Errors
    /// [`VmmError::InvalidLayout`] or any failure while identity mapping.
    ///
    /// # Safety
    /// The identity map must cover everything the CPU touches right after
    /// the CR3 switch (code, stack, the frame bitmap).
    pub unsafe fn init<A: PhysFrameAlloc>(
        mapper: &'m M,
        mmu: T,
        alloc: &mut A,
        layout: &MemoryLayout,
        bootstrap: &[PhysicalRange],
    ) -> Result<Self, VmmError> {
        let window_base = VirtualAddress::new(layout.alloc_window_base);
        if !layout.is_consistent() || !window_base.is_canonical() {
            return Err(VmmError::InvalidLayout(*layout));
        }

        let root = if mmu.paging_enabled() {
            let root = mmu.active_root();
            info!("vmm: adopting the loader's PML4 at {root:?}");
            root
        } else {
            AddressSpace::new(mapper, alloc)?.root()
        };

        let mut vmm = Self {
            mapper,
            mmu,
            kernel_root: root,
            active_root: root,
            window: AllocWindow::new(layout.alloc_window_base, layout.alloc_window_bytes),
            regions: ArrayVec::new(),
            stats: PagingStats::default(),
        };

        let identity = PhysicalRange::from_len(0, layout.identity_map_bytes);
        for range in core::iter::once(&identity).chain(bootstrap) {
            vmm.identity_map(alloc, *range)?;
        }
        vmm.link_window_pdpts(alloc)?;

        unsafe {
            vmm.mmu.switch_root(root);
            if !vmm.mmu.paging_enabled() {
                vmm.mmu.enable_paging();
            }
        }

        info!(
            "vmm: paging on, kernel PML4 {root:?}, window {:?}..{:?}, {} tables allocated",
            window_base,
            VirtualAddress::new(vmm.window.end),
            vmm.stats.tables_allocated
        );
        Ok(vmm)
    }

    fn identity_map<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
        range: PhysicalRange,
    ) -> Result<(), VmmError> {
        if range.is_empty() {
            return Ok(());
        }
        let first = align_down(range.start.as_u64(), FRAME_SIZE);
        let end = align_up(range.end.as_u64(), FRAME_SIZE).unwrap_or(u64::MAX);

        let space = self.space();
        let mut created = 0;
        for page in 0..(end - first) / FRAME_SIZE {
            let addr = first + page * FRAME_SIZE;
            let va = VirtualAddress::new(addr);
            if space.translate(va).is_some() {
                continue;
            }
            created += space.map_4k(alloc, va, PhysicalAddress::new(addr), PageEntry::kernel_rw())?;
        }
        self.stats.tables_allocated += created as u64;
        debug!(
            "vmm: identity mapped {:?}..{:?}",
            PhysicalAddress::new(first),
            PhysicalAddress::new(end)
        );
        Ok(())
    }

    /// Gives the window's kernel-half PML4 slots their PDPTs before any
    /// directory copies the kernel half.
    fn link_window_pdpts<A: PhysFrameAlloc>(&mut self, alloc: &mut A) -> Result<(), VmmError> {
        let span = Level::Pml4.entry_span();
        let space = self.space();
        let mut slot = align_down(self.window.base, span);
        while slot < self.window.end {
            if slot >= KERNEL_HALF_BASE && space.ensure_pdpt(alloc, VirtualAddress::new(slot))? {
                self.stats.tables_allocated += 1;
            }
            let Some(next) = slot.checked_add(span) else {
                break;
            };
            slot = next;
        }
        Ok(())
    }

    #[inline]
    fn space(&self) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, self.active_root)
    }

    /// The kernel half and the allocation window always live in the kernel
    /// directory; everything else in the active one.
    fn space_for(&self, va: VirtualAddress) -> AddressSpace<'m, M> {
        if va.as_u64() >= KERNEL_HALF_BASE || self.window.covers(va.as_u64()) {
            AddressSpace::from_root(self.mapper, self.kernel_root)
        } else {
            self.space()
        }
    }

    /// Maps one 4 KiB page and invalidates its TLB entry.
    ///
    /// # Errors
    /// See [`MapError`]; an existing mapping is never replaced.
    pub fn map_page<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntry,
    ) -> Result<(), VmmError> {
        let created = self.space_for(va).map_4k(alloc, va, pa, flags)?;
        self.stats.tables_allocated += created as u64;
        self.stats.pages_mapped += 1;
        self.invalidate(va);
        Ok(())
    }

    /// Removes one 4 KiB translation and returns the frame it pointed to.
    /// The frame is not freed.
    ///
    /// # Errors
    /// See [`UnmapError`].
    pub fn unmap_page<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, VmmError> {
        let unmapped = self.space_for(va).unmap_4k(alloc, va).inspect_err(|err| {
            warn!("vmm: unmap of {va:?} refused: {err}");
        })?;
        self.stats.tables_reclaimed += unmapped.tables_freed as u64;
        self.stats.pages_unmapped += 1;
        self.invalidate(va);
        Ok(unmapped.frame.base())
    }

    /// Resolves `va`, including its offset into the page.
    #[must_use]
    pub fn get_physical_address(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.space_for(va).query(va)
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.space_for(va).translate(va).is_some()
    }

    /// Replaces the permissions of an existing 4 KiB mapping.
    ///
    /// # Errors
    /// See [`UnmapError`].
    pub fn protect_page(&mut self, va: VirtualAddress, flags: PageEntry) -> Result<(), VmmError> {
        self.space_for(va).protect_4k(va, flags)?;
        self.invalidate(va);
        Ok(())
    }

    /// Every page of `[va, va + pages * 4 KiB)` is mapped.
    #[must_use]
    pub fn validate_range(&self, va: VirtualAddress, pages: u64) -> bool {
        (0..pages).all(|i| {
            va.checked_add(i * FRAME_SIZE)
                .is_some_and(|page| self.space_for(page).translate(page).is_some())
        })
    }

    /// Maps `bytes` starting at `va` to the physically contiguous range at
    /// `pa`. On failure every page mapped by this call is unmapped again.
    ///
    /// # Errors
    /// [`VmmError::UnalignedLength`] or the first page's mapping error.
    pub fn map_range<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        bytes: u64,
        flags: PageEntry,
    ) -> Result<u64, VmmError> {
        if !bytes.is_multiple_of(FRAME_SIZE) {
            return Err(VmmError::UnalignedLength(bytes));
        }
        let pages = bytes / FRAME_SIZE;

        for i in 0..pages {
            let off = i * FRAME_SIZE;
            if let Err(err) = self.map_page(alloc, va + off, pa + off, flags) {
                for j in 0..i {
                    let _ = self.unmap_page(alloc, va + j * FRAME_SIZE);
                }
                return Err(err);
            }
        }
        Ok(pages)
    }

    /// Unmaps every mapped page in `[va, va + pages * 4 KiB)`, optionally
    /// freeing the frames. Returns the number of pages that were mapped.
    pub fn unmap_range<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pages: u64,
        free_frames: bool,
    ) -> u64 {
        let mut count = 0;
        for i in 0..pages {
            let page = va + i * FRAME_SIZE;
            let Ok(unmapped) = self.space_for(page).unmap_4k(alloc, page) else {
                continue;
            };
            self.stats.tables_reclaimed += unmapped.tables_freed as u64;
            self.stats.pages_unmapped += 1;
            self.invalidate(page);
            if free_frames {
                alloc.free_4k(unmapped.frame);
            }
            count += 1;
        }
        count
    }

    /// Allocates `pages` fresh frames and maps them at consecutive addresses
    /// of the allocation window.
    ///
    /// Either every page is mapped, or nothing is: on failure the frames,
    /// table nodes and window range claimed by this call are returned.
    ///
    /// # Errors
    /// [`VmmError::ZeroPages`], [`VmmError::WindowExhausted`],
    /// [`VmmError::OutOfFrames`], or a mapping error.
    pub fn alloc_pages<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
        pages: u64,
        flags: PageEntry,
    ) -> Result<VirtualAddress, VmmError> {
        if pages == 0 {
            return Err(VmmError::ZeroPages);
        }

        let Some(start) = self.window.reserve(pages) else {
            self.stats.allocation_failures += 1;
            error!(
                "vmm: window exhausted for {pages} pages ({} free)",
                self.window.free_pages()
            );
            return Err(VmmError::WindowExhausted { pages });
        };
        let base = VirtualAddress::new(start);

        for i in 0..pages {
            let va = base + i * FRAME_SIZE;
            let result = match alloc.alloc_4k() {
                Some(frame) => self
                    .map_page(alloc, va, frame.base(), flags)
                    .inspect_err(|_| alloc.free_4k(frame)),
                None => Err(VmmError::OutOfFrames),
            };

            if let Err(err) = result {
                self.unmap_range(alloc, base, i, true);
                if !self.window.release(start, pages) {
                    warn!("vmm: window hole list full, leaking {pages} pages of address space at {base:?}");
                }
                self.stats.allocation_failures += 1;
                error!("vmm: alloc_pages({pages}) failed after {i} pages: {err}");
                return Err(err);
            }
        }

        trace!("vmm: alloc_pages({pages}) -> {base:?}");
        Ok(base)
    }

    /// Unmaps and frees `pages` pages obtained from [`alloc_pages`](Self::alloc_pages)
    /// and returns the range to the window.
    ///
    /// # Errors
    /// [`VmmError::NotInWindow`] if the range was not handed out by the
    /// window, [`VmmError::NotAllocated`] if part of it is already free;
    /// nothing is changed then.
    pub fn free_pages<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
        va: VirtualAddress,
        pages: u64,
    ) -> Result<u64, VmmError> {
        if pages == 0 {
            return Err(VmmError::ZeroPages);
        }
        if !va.is_aligned::<Size4K>() || !self.window.contains(va.as_u64(), pages) {
            warn!("vmm: free_pages({va:?}, {pages}) outside the allocation window");
            return Err(VmmError::NotInWindow { va, pages });
        }
        if !self.window.is_reserved(va.as_u64(), pages) {
            warn!("vmm: free_pages({va:?}, {pages}) overlaps a free window range");
            return Err(VmmError::NotAllocated { va, pages });
        }

        let unmapped = self.unmap_range(alloc, va, pages, true);
        if unmapped != pages {
            warn!("vmm: free_pages({va:?}, {pages}) found only {unmapped} mapped pages");
        }
        if !self.window.release(va.as_u64(), pages) {
            warn!("vmm: window hole list full, leaking {pages} pages of address space at {va:?}");
        }
        Ok(unmapped)
    }

    /// Records a named region. `start` is rounded down and `end` up to page
    /// boundaries.
    ///
    /// # Errors
    /// Empty or overlapping ranges, or a full region table.
    pub fn create_region(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
        flags: PageEntry,
        name: &'static str,
    ) -> Result<VmRegion, VmmError> {
        let start = start.align_down::<Size4K>();
        let end = VirtualAddress::new(
            align_up(end.as_u64(), FRAME_SIZE).unwrap_or(align_down(u64::MAX, FRAME_SIZE)),
        );
        if start >= end || self.regions.iter().any(|r| r.start < end && start < r.end) {
            return Err(VmmError::RegionOverlap { start, end });
        }

        let region = VmRegion {
            start,
            end,
            flags,
            name,
        };
        self.regions
            .try_push(region)
            .map_err(|_| VmmError::RegionTableFull(MAX_VM_REGIONS))?;
        debug!("vmm: new {region:?}");
        Ok(region)
    }

    /// Forgets the region with exactly these bounds.
    ///
    /// # Errors
    /// [`VmmError::RegionNotFound`].
    pub fn destroy_region(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<VmRegion, VmmError> {
        let i = self
            .regions
            .iter()
            .position(|r| r.start == start && r.end == end)
            .ok_or(VmmError::RegionNotFound { start, end })?;
        Ok(self.regions.remove(i))
    }

    #[must_use]
    pub fn find_region(&self, va: VirtualAddress) -> Option<&VmRegion> {
        self.regions.iter().find(|r| r.contains(va))
    }

    #[must_use]
    pub fn regions(&self) -> &[VmRegion] {
        &self.regions
    }

    /// Allocates a new directory sharing the kernel directory's upper half.
    ///
    /// # Errors
    /// [`VmmError::Map`] when no frame is left for the PML4.
    pub fn create_directory<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let kernel = AddressSpace::from_root(self.mapper, self.kernel_root);
        let space = AddressSpace::new_sharing_kernel_half(self.mapper, alloc, &kernel)?;
        self.stats.tables_allocated += 1;
        Ok(space.root())
    }

    /// Releases a directory from [`create_directory`](Self::create_directory)
    /// together with the table nodes of its lower half. Mapped frames are
    /// not freed. Returns the number of table frames released.
    ///
    /// # Errors
    /// [`VmmError::DirectoryInUse`] for the kernel or the active directory.
    pub fn destroy_directory<A: PhysFrameAlloc>(
        &mut self,
        alloc: &mut A,
        root: PhysicalPage<Size4K>,
    ) -> Result<usize, VmmError> {
        if root == self.kernel_root || root == self.active_root {
            return Err(VmmError::DirectoryInUse(root));
        }
        let freed = unsafe { AddressSpace::from_root(self.mapper, root).destroy(alloc) };
        self.stats.tables_reclaimed += freed as u64;
        Ok(freed)
    }

    /// Loads `root` into CR3 and makes it the target of subsequent mapping
    /// operations.
    ///
    /// # Safety
    /// `root` must be a valid PML4 mapping the executing code and stack,
    /// e.g. one from [`create_directory`](Self::create_directory).
    pub unsafe fn switch_directory(&mut self, root: PhysicalPage<Size4K>) {
        unsafe { self.mmu.switch_root(root) };
        self.active_root = root;
        self.stats.tlb_flushes += 1;
        debug!("vmm: switched to directory {root:?}");
    }

    /// Drops every non-global TLB entry.
    pub fn flush_all(&mut self) {
        self.mmu.flush_all();
        self.stats.tlb_flushes += 1;
    }

    fn invalidate(&mut self, va: VirtualAddress) {
        self.mmu.invalidate_page(va);
        self.stats.tlb_flushes += 1;
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> PhysicalPage<Size4K> {
        self.kernel_root
    }

    #[inline]
    #[must_use]
    pub const fn active_root(&self) -> PhysicalPage<Size4K> {
        self.active_root
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> PagingStats {
        self.stats
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &T {
        &self.mmu
    }

    /// Pages still available in the allocation window.
    #[must_use]
    pub fn window_free_pages(&self) -> u64 {
        self.window.free_pages()
    }

    /// Logs the page-table walk for `va` in the active directory.
    pub fn dump_walk(&self, va: VirtualAddress) {
        info!("vmm: walk for {va:?} in {:?}", self.active_root);
        self.space().log_walk(va);
    }

    pub fn log_stats(&self) {
        let s = &self.stats;
        info!(
            "vmm: mapped={} unmapped={} tlb_flushes={} alloc_failures={} tables +{} -{} window_free={} regions={}",
            s.pages_mapped,
            s.pages_unmapped,
            s.tlb_flushes,
            s.allocation_failures,
            s.tables_allocated,
            s.tables_reclaimed,
            self.window.free_pages(),
            self.regions.len()
        );
        for region in &self.regions {
            info!("vmm:   {region:?}");
        }
    }
}
