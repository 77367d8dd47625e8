use crate::Level;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// A single 64-bit x86-64 page-table entry.
///
/// One type models all four levels (PML4E, PDPTE, PDE, PTE). Which bits are
/// meaningful depends on the level the entry sits in, see [`Level`].
///
/// ### Bit layout
///
/// | Bits      | Name             | Meaning |
/// |-----------|------------------|---------|
/// | 0         | `P`              | Present |
/// | 1         | `RW`             | Writable |
/// | 2         | `US`             | User-mode accessible |
/// | 3         | `PWT`            | Write-through caching |
/// | 4         | `PCD`            | Cache disable |
/// | 5         | `A`              | Accessed (set by the CPU) |
/// | 6         | `D`              | Dirty (leaf only, set by the CPU) |
/// | 7         | `PS`             | Large page (PDPTE/PDE only) |
/// | 8         | `G`              | Global (leaf only) |
/// | 9         | owned table      | OS bit: child table allocated by this kernel |
/// | 10–11     | OS available     | Unused |
/// | 12–51     | `addr`           | Physical frame bits `[51:12]` |
/// | 52–62     | OS available     | Unused |
/// | 63        | `NX`             | Execute disable |
///
/// The *owned table* bit marks upper-level entries whose child table frame
/// came from the frame allocator. Only those children are returned to the
/// allocator when they become empty; tables built by the boot loader are
/// left alone.
///
/// ```rust
/// # use kernel_vmem::PageEntry;
/// # use kernel_memory_addresses::PhysicalAddress;
/// let e = PageEntry::kernel_rw().with_frame_address(PhysicalAddress::new(0x20_3000));
/// assert!(e.present() && e.writable() && !e.user_access());
/// assert_eq!(e.frame_address(), PhysicalAddress::new(0x20_3000));
/// ```
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    pub present: bool,
    pub writable: bool,
    pub user_access: bool,
    pub write_through: bool,
    pub cache_disabled: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub large_page: bool,
    pub global: bool,

    /// Child table was allocated by the kernel and may be reclaimed.
    pub owned_table: bool,

    #[bits(2)]
    __: u8,

    #[bits(40)]
    frame_bits: u64,

    #[bits(11)]
    __: u16,

    pub no_execute: bool,
}

impl PageEntry {
    /// Bits of an entry that carry permissions and caching policy, i.e.
    /// everything except the address, the CPU-maintained A/D bits and the
    /// table bookkeeping bit.
    pub const FLAG_MASK: u64 = 0x8000_0000_0000_011F;

    /// The empty (not present) entry.
    #[inline]
    #[must_use]
    pub const fn empty() -> Self {
        Self::new()
    }

    /// Present, writable, supervisor-only, executable.
    #[inline]
    #[must_use]
    pub const fn kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, writable, supervisor-only, no-execute. The default for data.
    #[inline]
    #[must_use]
    pub const fn kernel_data() -> Self {
        Self::kernel_rw().with_no_execute(true)
    }

    /// Present, read-only, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn kernel_ro() -> Self {
        Self::new().with_present(true)
    }

    /// Present, writable, user-accessible, no-execute.
    #[inline]
    #[must_use]
    pub const fn user_data() -> Self {
        Self::kernel_data().with_user_access(true)
    }

    /// Uncached device memory.
    #[inline]
    #[must_use]
    pub const fn mmio() -> Self {
        Self::kernel_data()
            .with_cache_disabled(true)
            .with_write_through(true)
    }

    /// Link to a freshly allocated child table.
    ///
    /// Upper-level entries are always `present|writable`; `user` is added when
    /// a user-accessible leaf lives below, since permissions intersect along
    /// the walk.
    #[inline]
    #[must_use]
    pub const fn owned_link(table: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::kernel_rw()
            .with_user_access(user)
            .with_owned_table(true)
            .with_frame_address(table.base())
    }

    /// A 4 KiB leaf mapping `frame` with the permission bits of `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalAddress, flags: Self) -> Self {
        Self::from_bits(flags.into_bits() & Self::FLAG_MASK)
            .with_present(true)
            .with_large_page(false)
            .with_frame_address(frame)
    }

    #[inline]
    #[must_use]
    pub const fn frame_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame_bits() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn with_frame_address(self, pa: PhysicalAddress) -> Self {
        self.with_frame_bits(pa.as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_number(self.frame_bits())
    }

    /// Only the permission and caching bits, see [`FLAG_MASK`](Self::FLAG_MASK).
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> Self {
        Self::from_bits(self.into_bits() & Self::FLAG_MASK)
    }

    /// Whether the entry terminates the walk at `level`.
    #[inline]
    #[must_use]
    pub const fn is_leaf_at(&self, level: Level) -> bool {
        match level {
            Level::Pml4 => false,
            Level::Pdpt | Level::Pd => self.large_page(),
            Level::Pt => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_mask_covers_permission_bits() {
        let all = PageEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(true)
            .with_write_through(true)
            .with_cache_disabled(true)
            .with_global(true)
            .with_no_execute(true);
        assert_eq!(all.into_bits(), PageEntry::FLAG_MASK);
    }

    #[test]
    fn leaf_strips_address_and_bookkeeping_from_flags() {
        let flags = PageEntry::user_data()
            .with_owned_table(true)
            .with_accessed(true)
            .with_frame_address(PhysicalAddress::new(0xdead_0000));
        let leaf = PageEntry::leaf(PhysicalAddress::new(0x5000), flags);
        assert_eq!(leaf.frame_address(), PhysicalAddress::new(0x5000));
        assert!(leaf.user_access() && leaf.writable() && leaf.no_execute());
        assert!(!leaf.owned_table());
        assert!(!leaf.accessed());
    }

    #[test]
    fn owned_link_marks_the_child_table() {
        let table = PhysicalPage::<Size4K>::from_number(7);
        let e = PageEntry::owned_link(table, false);
        assert_eq!(e.into_bits(), 0x7000 | 0b10_0000_0011);
        assert_eq!(e.frame(), table);
        assert!(!e.is_leaf_at(Level::Pml4));
    }

    #[test]
    fn large_pages_are_leaves_only_mid_level() {
        let e = PageEntry::kernel_rw().with_large_page(true);
        assert!(e.is_leaf_at(Level::Pd));
        assert!(e.is_leaf_at(Level::Pdpt));
        assert!(!e.is_leaf_at(Level::Pml4));
        assert!(PageEntry::kernel_rw().is_leaf_at(Level::Pt));
    }

    #[test]
    fn address_bits_are_12_to_51() {
        let pa = PhysicalAddress::new(0x000F_FFFF_FFFF_F000);
        let e = PageEntry::new().with_frame_address(pa);
        assert_eq!(e.into_bits(), 0x000F_FFFF_FFFF_F000);
        assert_eq!(e.frame_address(), pa);
    }
}
