//! # Address Space (x86-64, PML4-rooted)
//!
//! [`AddressSpace`] is a handle to one translation tree. It does not own the
//! tree's frames; it borrows a [`PhysMapper`] to reach table nodes and takes a
//! [`PhysFrameAlloc`] per call whenever nodes must be created or released.
//!
//! ## Highlights
//!
//! - [`AddressSpace::map_4k`] walks PML4 → PT, creating missing nodes, and
//!   installs one 4 KiB leaf. A failed call leaves no trace: nodes created on
//!   the way are released again.
//! - [`AddressSpace::unmap_4k`] clears one leaf and returns the physical
//!   address it pointed to. Nodes that become empty are released, but only if
//!   they carry the [owned table](PageEntry::owned_table) marker.
//! - [`AddressSpace::translate`] resolves any address, including offsets into
//!   2 MiB / 1 GiB leaves set up by the boot loader.
//!
//! ## Safety
//!
//! Nothing here touches the TLB. Callers changing a live address space must
//! invalidate the affected pages afterwards (see [`Mmu`](crate::Mmu)).

use crate::{Level, PageEntry, PageTable, PhysFrameAlloc, PhysMapper, TableIndex};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use log::{debug, info, trace};

/// Index of the first PML4 slot of the higher (kernel) half.
const KERNEL_HALF_START: u16 = 256;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of physical frames allocating a {0} node")]
    OutOfFrames(Level),
    #[error("{va:?} is already mapped to {existing:?}")]
    AlreadyMapped {
        va: VirtualAddress,
        existing: PhysicalAddress,
    },
    #[error("{va:?} lies inside a large page at {level}")]
    LargePageInPath { va: VirtualAddress, level: Level },
    #[error("{va:?} -> {pa:?} is not 4 KiB aligned")]
    Unaligned {
        va: VirtualAddress,
        pa: PhysicalAddress,
    },
    #[error("{0:?} is not canonical")]
    NonCanonical(VirtualAddress),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum UnmapError {
    #[error("{0:?} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{va:?} is mapped by a large page at {level}")]
    LargePage { va: VirtualAddress, level: Level },
}

/// Result of a successful [`AddressSpace::translate`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    /// The physical address `va` resolves to, offset included.
    pub address: PhysicalAddress,
    /// The level holding the leaf; [`Level::Pt`] for 4 KiB pages.
    pub level: Level,
    /// The leaf entry itself.
    pub entry: PageEntry,
}

/// Result of a successful [`AddressSpace::unmap_4k`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Unmapped {
    /// The frame the page was mapped to. Not freed.
    pub frame: PhysicalPage<Size4K>,
    /// The leaf entry as it was before clearing.
    pub entry: PageEntry,
    /// Number of emptied table nodes handed back to the frame allocator.
    pub tables_freed: usize,
}

/// A table node created during a [`map_4k`](AddressSpace::map_4k) walk.
#[derive(Copy, Clone)]
struct CreatedNode {
    parent: PhysicalPage<Size4K>,
    index: TableIndex,
    node: PhysicalPage<Size4K>,
}

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: PhysicalPage<Size4K>,
    mapper: &'m M,
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Wraps an existing PML4, e.g. the one the boot loader left in CR3.
    #[inline]
    pub const fn from_root(mapper: &'m M, root: PhysicalPage<Size4K>) -> Self {
        Self { root, mapper }
    }

    /// Allocates and zeroes a fresh PML4.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is available for the root.
    pub fn new<A: PhysFrameAlloc>(mapper: &'m M, alloc: &mut A) -> Result<Self, MapError> {
        let root = alloc.alloc_4k().ok_or(MapError::OutOfFrames(Level::Pml4))?;
        let space = Self { root, mapper };
        space.table(root).zero();
        debug!("vmem: new PML4 at {root:?}");
        Ok(space)
    }

    /// Allocates a PML4 whose kernel half (slots 256..512) aliases `kernel`'s.
    ///
    /// Kernel mappings created later through either space are visible in
    /// both as long as they live below an already present PML4 slot.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is available for the root.
    pub fn new_sharing_kernel_half<A: PhysFrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        kernel: &AddressSpace<'_, M>,
    ) -> Result<Self, MapError> {
        let space = Self::new(mapper, alloc)?;
        let src = kernel.table(kernel.root);
        let dst = space.table(space.root);
        for i in KERNEL_HALF_START..512 {
            let index = TableIndex::new(i);
            // Shared links must never be reclaimed through this space.
            dst.set(index, src.get(index).with_owned_table(false));
        }
        Ok(space)
    }

    /// Physical page of the PML4.
    #[inline]
    pub const fn root(&self) -> PhysicalPage<Size4K> {
        self.root
    }

    #[inline]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    fn table(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        // Safety: every frame reached from the root holds a table node; the
        // walk never holds two references to the same node.
        unsafe { self.mapper.table_mut(frame) }
    }

    /// Maps the 4 KiB page at `va` to the frame at `pa` with the permission
    /// bits of `flags`.
    ///
    /// Missing PDPT/PD/PT nodes are allocated from `alloc`, zeroed and linked
    /// as `present|writable` (plus `user` when `flags` is user-accessible).
    /// Returns the number of nodes created.
    ///
    /// # Errors
    /// - [`MapError::AlreadyMapped`] if the leaf is present; nothing changes.
    /// - [`MapError::OutOfFrames`] if a node cannot be allocated; nodes
    ///   created by this call are released again.
    /// - [`MapError::LargePageInPath`], [`MapError::Unaligned`],
    ///   [`MapError::NonCanonical`] for invalid targets.
    pub fn map_4k<A: PhysFrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntry,
    ) -> Result<usize, MapError> {
        if !va.is_canonical() {
            return Err(MapError::NonCanonical(va));
        }
        if !va.is_aligned::<Size4K>() || !pa.is_aligned::<Size4K>() {
            return Err(MapError::Unaligned { va, pa });
        }

        let user = flags.user_access();
        let mut created = [None::<CreatedNode>; 3];
        let mut count = 0;
        // Existing links that need the user bit once the leaf is in place.
        let mut upgrades = [None::<(PhysicalPage<Size4K>, TableIndex)>; 3];
        let mut frame = self.root;

        for (depth, level) in [Level::Pml4, Level::Pdpt, Level::Pd].into_iter().enumerate() {
            let index = level.index_of(va);
            let table = self.table(frame);
            let entry = table.get(index);

            if !entry.present() {
                let below = level.next().unwrap_or(Level::Pt);
                let Some(node) = alloc.alloc_4k() else {
                    self.release_created(alloc, &created[..count]);
                    return Err(MapError::OutOfFrames(below));
                };
                self.table(node).zero();
                table.set(index, PageEntry::owned_link(node, user));
                created[count] = Some(CreatedNode {
                    parent: frame,
                    index,
                    node,
                });
                count += 1;
                debug!("vmem: new {below} node {node:?} for {va:?}");
                frame = node;
            } else if entry.large_page() {
                return Err(MapError::LargePageInPath { va, level });
            } else {
                if user && !entry.user_access() {
                    upgrades[depth] = Some((frame, index));
                }
                frame = entry.frame();
            }
        }

        let pt = self.table(frame);
        let index = Level::Pt.index_of(va);
        let existing = pt.get(index);
        if existing.present() {
            return Err(MapError::AlreadyMapped {
                va,
                existing: existing.frame_address(),
            });
        }

        pt.set(index, PageEntry::leaf(pa, flags));
        self.grant_user(&upgrades);
        trace!("vmem: map {va:?} -> {pa:?}");
        Ok(count)
    }

    fn grant_user(&self, links: &[Option<(PhysicalPage<Size4K>, TableIndex)>]) {
        for &(frame, index) in links.iter().flatten() {
            let table = self.table(frame);
            table.set(index, table.get(index).with_user_access(true));
        }
    }

    /// Makes sure the PML4 slot covering `va` links to a PDPT, allocating an
    /// empty one if needed. Returns whether a node was created.
    ///
    /// Kernel-half PDPTs created this way before any directory shares the
    /// kernel half are visible in every later directory.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if the PDPT cannot be allocated.
    pub fn ensure_pdpt<A: PhysFrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<bool, MapError> {
        let index = Level::Pml4.index_of(va);
        let pml4 = self.table(self.root);
        if pml4.get(index).present() {
            return Ok(false);
        }
        let node = alloc.alloc_4k().ok_or(MapError::OutOfFrames(Level::Pdpt))?;
        self.table(node).zero();
        pml4.set(index, PageEntry::owned_link(node, false));
        debug!("vmem: new PDPT node {node:?} for PML4 slot {}", index.as_usize());
        Ok(true)
    }

    /// Unlinks and frees nodes recorded during a failed walk, deepest first.
    fn release_created<A: PhysFrameAlloc>(&self, alloc: &mut A, created: &[Option<CreatedNode>]) {
        for c in created.iter().rev().flatten() {
            self.table(c.parent).clear(c.index);
            alloc.free_4k(c.node);
        }
    }

    /// Clears the 4 KiB leaf for `va`.
    ///
    /// The mapped frame is returned, not freed. Table nodes left without any
    /// present entry are released to `alloc`, bottom-up, as long as their
    /// parent link is marked as [owned](PageEntry::owned_table). PDPTs
    /// linked from the kernel half of the PML4 are shared with every
    /// directory created by [`new_sharing_kernel_half`](Self::new_sharing_kernel_half)
    /// and are never released.
    ///
    /// # Errors
    /// - [`UnmapError::NotMapped`] if any level on the way is not present.
    /// - [`UnmapError::LargePage`] if a 2 MiB / 1 GiB leaf covers `va`.
    pub fn unmap_4k<A: PhysFrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<Unmapped, UnmapError> {
        // (table frame, index into it) for PML4, PDPT, PD, PT.
        let mut path = [(self.root, TableIndex::new(0)); 4];
        let mut frame = self.root;

        for (depth, level) in Level::WALK.into_iter().enumerate() {
            let index = level.index_of(va);
            path[depth] = (frame, index);
            let entry = self.table(frame).get(index);
            if !entry.present() {
                return Err(UnmapError::NotMapped(va));
            }
            if level == Level::Pt {
                break;
            }
            if entry.large_page() {
                return Err(UnmapError::LargePage { va, level });
            }
            frame = entry.frame();
        }

        let (pt_frame, pt_index) = path[3];
        let pt = self.table(pt_frame);
        let leaf = pt.get(pt_index);
        pt.clear(pt_index);
        trace!("vmem: unmap {va:?} (was {:?})", leaf.frame_address());

        let mut tables_freed = 0;
        for depth in (0..3).rev() {
            let (parent_frame, parent_index) = path[depth];
            let (node, _) = path[depth + 1];
            if depth == 0 && parent_index.as_usize() >= usize::from(KERNEL_HALF_START) {
                break;
            }
            let parent = self.table(parent_frame);
            if !parent.get(parent_index).owned_table() || !self.table(node).is_empty() {
                break;
            }
            parent.clear(parent_index);
            alloc.free_4k(node);
            tables_freed += 1;
            debug!(
                "vmem: reclaimed empty {} node {node:?}",
                Level::WALK[depth + 1]
            );
        }

        Ok(Unmapped {
            frame: leaf.frame(),
            entry: leaf,
            tables_freed,
        })
    }

    /// Replaces the permission bits of the 4 KiB leaf for `va`, keeping its
    /// frame. Returns the previous leaf.
    ///
    /// # Errors
    /// As [`unmap_4k`](Self::unmap_4k).
    pub fn protect_4k(&self, va: VirtualAddress, flags: PageEntry) -> Result<PageEntry, UnmapError> {
        let mut upgrades = [None::<(PhysicalPage<Size4K>, TableIndex)>; 3];
        let mut frame = self.root;
        for (depth, level) in [Level::Pml4, Level::Pdpt, Level::Pd].into_iter().enumerate() {
            let index = level.index_of(va);
            let entry = self.table(frame).get(index);
            if !entry.present() {
                return Err(UnmapError::NotMapped(va));
            }
            if entry.large_page() {
                return Err(UnmapError::LargePage { va, level });
            }
            if flags.user_access() && !entry.user_access() {
                upgrades[depth] = Some((frame, index));
            }
            frame = entry.frame();
        }

        let pt = self.table(frame);
        let index = Level::Pt.index_of(va);
        let old = pt.get(index);
        if !old.present() {
            return Err(UnmapError::NotMapped(va));
        }
        pt.set(index, PageEntry::leaf(old.frame_address(), flags));
        self.grant_user(&upgrades);
        Ok(old)
    }

    /// Resolves `va` without creating anything.
    ///
    /// Handles 1 GiB and 2 MiB leaves by keeping the matching number of
    /// low-order offset bits.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<Translation> {
        let mut frame = self.root;
        for level in Level::WALK {
            let entry = self.table(frame).get(level.index_of(va));
            if !entry.present() {
                return None;
            }
            if entry.is_leaf_at(level) {
                let mask = level.entry_span() - 1;
                let base = entry.frame_address().as_u64() & !mask;
                return Some(Translation {
                    address: PhysicalAddress::new(base | (va.as_u64() & mask)),
                    level,
                    entry,
                });
            }
            frame = entry.frame();
        }
        None
    }

    /// Shorthand for the physical address of [`translate`](Self::translate).
    #[inline]
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.translate(va).map(|t| t.address)
    }

    /// Releases every owned node below the user half (PML4 slots 0..256) and
    /// the PML4 itself. Leaf frames are not freed.
    ///
    /// # Safety
    /// The space must not be active in CR3 and must not be used afterwards.
    pub unsafe fn destroy<A: PhysFrameAlloc>(self, alloc: &mut A) -> usize {
        let mut freed = 0;
        let pml4 = self.table(self.root);
        for i in 0..KERNEL_HALF_START {
            let index = TableIndex::new(i);
            let entry = pml4.get(index);
            if entry.present() && entry.owned_table() {
                freed += self.release_subtree(alloc, entry.frame(), Level::Pdpt);
            }
            pml4.clear(index);
        }
        alloc.free_4k(self.root);
        freed + 1
    }

    fn release_subtree<A: PhysFrameAlloc>(
        &self,
        alloc: &mut A,
        node: PhysicalPage<Size4K>,
        level: Level,
    ) -> usize {
        let mut freed = 0;
        if level != Level::Pt {
            let table = self.table(node);
            for i in 0..512 {
                let entry = table.get(TableIndex::new(i));
                if entry.present() && !entry.is_leaf_at(level) && entry.owned_table() {
                    if let Some(next) = level.next() {
                        freed += self.release_subtree(alloc, entry.frame(), next);
                    }
                }
            }
        }
        alloc.free_4k(node);
        freed + 1
    }

    /// Logs every level of the walk for `va`.
    pub fn log_walk(&self, va: VirtualAddress) {
        let mut frame = self.root;
        for level in Level::WALK {
            let index = level.index_of(va);
            let e = self.table(frame).get(index);
            info!(
                "{level:>4}[{:3}]={:016x} P={} RW={} US={} PS={} NX={} owned={}",
                index.as_usize(),
                e.into_bits(),
                e.present(),
                e.writable(),
                e.user_access(),
                e.large_page(),
                e.no_execute(),
                e.owned_table(),
            );
            if !e.present() || e.is_leaf_at(level) {
                return;
            }
            frame = e.frame();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpAlloc, TestPhys};

    const VA: VirtualAddress = VirtualAddress::new(0xFFFF_FFFF_9000_0000);

    fn setup(frames: u64) -> (TestPhys, BumpAlloc) {
        let phys = TestPhys::with_frames(usize::try_from(frames).unwrap());
        (phys, BumpAlloc::new(1, frames))
    }

    #[test]
    fn map_creates_three_nodes_then_reuses_them() {
        let (phys, mut alloc) = setup(64);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();

        let pa = PhysicalAddress::new(0x30_0000);
        assert_eq!(space.map_4k(&mut alloc, VA, pa, PageEntry::kernel_data()), Ok(3));
        assert_eq!(
            space.map_4k(&mut alloc, VA + 0x1000, pa + 0x1000, PageEntry::kernel_data()),
            Ok(0)
        );

        let t = space.translate(VA + 0x123).unwrap();
        assert_eq!(t.address, PhysicalAddress::new(0x30_0123));
        assert_eq!(t.level, Level::Pt);
        assert!(t.entry.writable() && t.entry.no_execute() && !t.entry.user_access());
        assert_eq!(alloc.live(), 4);
    }

    #[test]
    fn mapping_a_present_leaf_is_rejected() {
        let (phys, mut alloc) = setup(64);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        let first = PhysicalAddress::new(0x1000);
        space
            .map_4k(&mut alloc, VA, first, PageEntry::kernel_data())
            .unwrap();

        let err = space
            .map_4k(&mut alloc, VA, PhysicalAddress::new(0x2000), PageEntry::kernel_data())
            .unwrap_err();
        assert_eq!(
            err,
            MapError::AlreadyMapped {
                va: VA,
                existing: first
            }
        );
        assert_eq!(space.query(VA), Some(first));
    }

    #[test]
    fn misaligned_and_non_canonical_inputs() {
        let (phys, mut alloc) = setup(16);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        assert!(matches!(
            space.map_4k(&mut alloc, VA + 8, PhysicalAddress::zero(), PageEntry::kernel_rw()),
            Err(MapError::Unaligned { .. })
        ));
        assert!(matches!(
            space.map_4k(
                &mut alloc,
                VirtualAddress::new(0x0000_8000_0000_0000),
                PhysicalAddress::zero(),
                PageEntry::kernel_rw()
            ),
            Err(MapError::NonCanonical(_))
        ));
        assert_eq!(alloc.live(), 1);
    }

    #[test]
    fn exhaustion_mid_walk_releases_created_nodes() {
        // Root plus two nodes fit; the PT does not.
        let (phys, mut alloc) = setup(4);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();

        let err = space
            .map_4k(&mut alloc, VA, PhysicalAddress::new(0x1000), PageEntry::kernel_rw())
            .unwrap_err();
        assert_eq!(err, MapError::OutOfFrames(Level::Pt));
        assert_eq!(alloc.live(), 1);
        assert!(space.table(space.root()).is_empty());
    }

    #[test]
    fn unmap_returns_frame_and_reclaims_empty_nodes() {
        let (phys, mut alloc) = setup(64);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x4000_0000);
        let pa = PhysicalAddress::new(0x7000);
        space.map_4k(&mut alloc, va, pa, PageEntry::kernel_rw()).unwrap();
        space
            .map_4k(&mut alloc, va + 0x1000, pa + 0x1000, PageEntry::kernel_rw())
            .unwrap();

        let first = space.unmap_4k(&mut alloc, va).unwrap();
        assert_eq!(first.frame.base(), pa);
        assert_eq!(first.tables_freed, 0);
        assert_eq!(space.query(va), None);

        let second = space.unmap_4k(&mut alloc, va + 0x1000).unwrap();
        assert_eq!(second.tables_freed, 3);
        assert_eq!(alloc.live(), 1);

        assert_eq!(
            space.unmap_4k(&mut alloc, va),
            Err(UnmapError::NotMapped(va))
        );
    }

    #[test]
    fn kernel_half_pdpt_outlives_its_last_mapping() {
        let (phys, mut alloc) = setup(64);
        let kernel = AddressSpace::new(&phys, &mut alloc).unwrap();
        kernel
            .map_4k(&mut alloc, VA, PhysicalAddress::new(0x7000), PageEntry::kernel_rw())
            .unwrap();
        let user = AddressSpace::new_sharing_kernel_half(&phys, &mut alloc, &kernel).unwrap();

        let i4 = Level::Pml4.index_of(VA);
        let pdpt = kernel.table(kernel.root()).get(i4).frame();
        let unmapped = kernel.unmap_4k(&mut alloc, VA).unwrap();
        assert_eq!(unmapped.tables_freed, 2);
        assert!(kernel.table(kernel.root()).get(i4).present());
        assert!(!alloc.freed.contains(&pdpt));

        // A later kernel mapping under the same slot shows up in `user`.
        let next = VA + 0x20_0000;
        kernel
            .map_4k(&mut alloc, next, PhysicalAddress::new(0x8000), PageEntry::kernel_rw())
            .unwrap();
        assert_eq!(user.table(user.root()).get(i4).frame(), pdpt);
        assert_eq!(user.query(next), Some(PhysicalAddress::new(0x8000)));
    }

    #[test]
    fn ensure_pdpt_links_an_empty_node_once() {
        let (phys, mut alloc) = setup(16);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        assert_eq!(space.ensure_pdpt(&mut alloc, VA), Ok(true));
        assert_eq!(space.ensure_pdpt(&mut alloc, VA + 0x1000), Ok(false));
        assert_eq!(alloc.live(), 2);
        assert_eq!(space.query(VA), None);
        assert_eq!(
            space.map_4k(&mut alloc, VA, PhysicalAddress::new(0x1000), PageEntry::kernel_rw()),
            Ok(2)
        );
    }

    #[test]
    fn boot_loader_nodes_are_never_reclaimed() {
        let (phys, mut alloc) = setup(64);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        space
            .map_4k(&mut alloc, VA, PhysicalAddress::new(0x5000), PageEntry::kernel_rw())
            .unwrap();

        // Strip the ownership marker from the PML4 link, as if the loader
        // had built the PDPT.
        let i4 = Level::Pml4.index_of(VA);
        let link = space.table(space.root()).get(i4);
        space
            .table(space.root())
            .set(i4, link.with_owned_table(false));

        let unmapped = space.unmap_4k(&mut alloc, VA).unwrap();
        assert_eq!(unmapped.tables_freed, 2);
        assert!(space.table(space.root()).get(i4).present());
    }

    #[test]
    fn user_leaf_upgrades_existing_links() {
        let (phys, mut alloc) = setup(64);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        space
            .map_4k(&mut alloc, va, PhysicalAddress::new(0x9000), PageEntry::kernel_rw())
            .unwrap();
        space
            .map_4k(
                &mut alloc,
                va + 0x1000,
                PhysicalAddress::new(0xA000),
                PageEntry::user_data(),
            )
            .unwrap();

        let link = space.table(space.root()).get(Level::Pml4.index_of(va));
        assert!(link.user_access());
        assert!(!space.translate(va).unwrap().entry.user_access());
        assert!(space.translate(va + 0x1000).unwrap().entry.user_access());
    }

    #[test]
    fn failed_user_mapping_leaves_links_supervisor_only() {
        let (phys, mut alloc) = setup(64);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        space
            .map_4k(&mut alloc, va, PhysicalAddress::new(0x9000), PageEntry::kernel_rw())
            .unwrap();

        assert!(matches!(
            space.map_4k(&mut alloc, va, PhysicalAddress::new(0xA000), PageEntry::user_data()),
            Err(MapError::AlreadyMapped { .. })
        ));
        assert_eq!(
            space.protect_4k(va + 0x1000, PageEntry::user_data()),
            Err(UnmapError::NotMapped(va + 0x1000))
        );

        let root = space.table(space.root());
        assert!(!root.get(Level::Pml4.index_of(va)).user_access());
    }

    #[test]
    fn translate_large_pages() {
        let (phys, mut alloc) = setup(64);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        let pdpt = alloc.alloc_4k().unwrap();
        let pd = alloc.alloc_4k().unwrap();

        // Identity-style boot mapping: 2 MiB leaf for [0, 2 MiB), 1 GiB leaf
        // for [1 GiB, 2 GiB).
        let root = space.table(space.root());
        root.set(TableIndex::new(0), PageEntry::kernel_rw().with_frame_address(pdpt.base()));
        let pdpt_t = space.table(pdpt);
        pdpt_t.set(TableIndex::new(0), PageEntry::kernel_rw().with_frame_address(pd.base()));
        pdpt_t.set(
            TableIndex::new(1),
            PageEntry::kernel_rw()
                .with_large_page(true)
                .with_frame_address(PhysicalAddress::new(0x4000_0000)),
        );
        space.table(pd).set(
            TableIndex::new(0),
            PageEntry::kernel_rw()
                .with_large_page(true)
                .with_frame_address(PhysicalAddress::zero()),
        );

        let small = space.translate(VirtualAddress::new(0x1F_F123)).unwrap();
        assert_eq!(small.address, PhysicalAddress::new(0x1F_F123));
        assert_eq!(small.level, Level::Pd);

        let huge = space.translate(VirtualAddress::new(0x4123_4567)).unwrap();
        assert_eq!(huge.address, PhysicalAddress::new(0x4123_4567));
        assert_eq!(huge.level, Level::Pdpt);

        assert!(matches!(
            space.map_4k(
                &mut alloc,
                VirtualAddress::new(0x1000),
                PhysicalAddress::new(0x1000),
                PageEntry::kernel_rw()
            ),
            Err(MapError::LargePageInPath {
                level: Level::Pd,
                ..
            })
        ));
        assert!(matches!(
            space.unmap_4k(&mut alloc, VirtualAddress::new(0x1000)),
            Err(UnmapError::LargePage { .. })
        ));
    }

    #[test]
    fn protect_changes_flags_keeps_frame() {
        let (phys, mut alloc) = setup(64);
        let space = AddressSpace::new(&phys, &mut alloc).unwrap();
        let pa = PhysicalAddress::new(0xB000);
        space.map_4k(&mut alloc, VA, pa, PageEntry::kernel_data()).unwrap();

        let old = space.protect_4k(VA, PageEntry::kernel_ro()).unwrap();
        assert!(old.writable());
        let now = space.translate(VA).unwrap();
        assert_eq!(now.address, pa);
        assert!(!now.entry.writable());
        assert!(!now.entry.no_execute());

        assert_eq!(
            space.protect_4k(VA + 0x1000, PageEntry::kernel_ro()),
            Err(UnmapError::NotMapped(VA + 0x1000))
        );
    }

    #[test]
    fn shared_kernel_half_and_destroy() {
        let (phys, mut alloc) = setup(64);
        let kernel = AddressSpace::new(&phys, &mut alloc).unwrap();
        kernel
            .map_4k(&mut alloc, VA, PhysicalAddress::new(0xC000), PageEntry::kernel_rw())
            .unwrap();
        let before = alloc.live();

        let user = AddressSpace::new_sharing_kernel_half(&phys, &mut alloc, &kernel).unwrap();
        assert_eq!(user.query(VA), Some(PhysicalAddress::new(0xC000)));

        let uva = VirtualAddress::new(0x40_0000);
        user.map_4k(&mut alloc, uva, PhysicalAddress::new(0xD000), PageEntry::user_data())
            .unwrap();
        assert_eq!(kernel.query(uva), None);

        let freed = unsafe { user.destroy(&mut alloc) };
        assert_eq!(freed, 4);
        assert_eq!(alloc.live(), before);
        assert_eq!(kernel.query(VA), Some(PhysicalAddress::new(0xC000)));
    }
}
