//! # Page Table Nodes
//!
//! A [`PageTable`] is one 4 KiB node of the translation tree: 512 eight-byte
//! [`PageEntry`] values, 4 KiB aligned. The same node layout is used at every
//! [`Level`]; the level only decides how an entry is interpreted.
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```

use crate::PageEntry;
use core::fmt;
use kernel_memory_addresses::{PageSize, Size1G, Size2M, Size4K, VirtualAddress};

/// Number of entries in every table node.
pub const ENTRIES_PER_TABLE: usize = 512;

/// One of the four levels of the x86-64 paging hierarchy, top to bottom.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    /// All levels in walk order.
    pub const WALK: [Self; 4] = [Self::Pml4, Self::Pdpt, Self::Pd, Self::Pt];

    /// Bit position of this level's 9-bit index inside a virtual address.
    #[inline]
    #[must_use]
    pub const fn shift(self) -> u32 {
        match self {
            Self::Pml4 => 39,
            Self::Pdpt => Size1G::SHIFT,
            Self::Pd => Size2M::SHIFT,
            Self::Pt => Size4K::SHIFT,
        }
    }

    /// Index into a node at this level for `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index_of(self, va: VirtualAddress) -> TableIndex {
        TableIndex(((va.as_u64() >> self.shift()) & 0x1FF) as u16)
    }

    /// Bytes covered by one entry at this level.
    #[inline]
    #[must_use]
    pub const fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// The level below, or `None` at the PT.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Pml4 => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pd => Some(Self::Pt),
            Self::Pt => None,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Pml4 => "PML4",
            Self::Pdpt => "PDPT",
            Self::Pd => "PD",
            Self::Pt => "PT",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A 9-bit index into a [`PageTable`]; always `< 512`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

impl TableIndex {
    #[inline]
    #[must_use]
    pub const fn new(index: u16) -> Self {
        debug_assert!((index as usize) < ENTRIES_PER_TABLE);
        Self(index)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Splits `va` into its PML4, PDPT, PD and PT indices.
///
/// ```rust
/// # use kernel_vmem::split_indices;
/// # use kernel_memory_addresses::VirtualAddress;
/// let [i4, i3, i2, i1] = split_indices(VirtualAddress::new(0xFFFF_FFFF_9000_3000));
/// assert_eq!((i4.as_usize(), i3.as_usize(), i2.as_usize(), i1.as_usize()), (511, 510, 128, 3));
/// ```
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> [TableIndex; 4] {
    [
        Level::Pml4.index_of(va),
        Level::Pdpt.index_of(va),
        Level::Pd.index_of(va),
        Level::Pt.index_of(va),
    ]
}

/// One 4 KiB node of the paging hierarchy.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageEntry::empty(); ENTRIES_PER_TABLE],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: TableIndex) -> PageEntry {
        self.entries[index.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, index: TableIndex, entry: PageEntry) {
        self.entries[index.as_usize()] = entry;
    }

    #[inline]
    pub const fn clear(&mut self, index: TableIndex) {
        self.set(index, PageEntry::empty());
    }

    /// Clears every entry.
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::empty());
    }

    /// No entry is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.present())
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_the_9_bit_slices() {
        let va = VirtualAddress::new(
            (0x1A3_u64 << 39) | (0x0F1 << 30) | (0x1FF << 21) | (0x002 << 12) | 0xABC,
        );
        let [i4, i3, i2, i1] = split_indices(va);
        assert_eq!(i4.as_usize(), 0x1A3);
        assert_eq!(i3.as_usize(), 0x0F1);
        assert_eq!(i2.as_usize(), 0x1FF);
        assert_eq!(i1.as_usize(), 0x002);
    }

    #[test]
    fn spans_match_page_sizes() {
        assert_eq!(Level::Pt.entry_span(), Size4K::SIZE);
        assert_eq!(Level::Pd.entry_span(), Size2M::SIZE);
        assert_eq!(Level::Pdpt.entry_span(), Size1G::SIZE);
        assert_eq!(Level::Pml4.entry_span(), 512 * Size1G::SIZE);
    }

    #[test]
    fn walk_order() {
        let mut level = Level::Pml4;
        let mut seen = vec![level];
        while let Some(next) = level.next() {
            seen.push(next);
            level = next;
        }
        assert_eq!(seen, Level::WALK);
    }

    #[test]
    fn table_emptiness() {
        let mut t = PageTable::zeroed();
        assert!(t.is_empty());
        t.set(TableIndex::new(42), PageEntry::kernel_rw());
        assert_eq!(t.present_count(), 1);
        t.clear(TableIndex::new(42));
        assert!(t.is_empty());
    }
}
