use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the x86-64 translation granules.
///
/// Only [`Size4K`], [`Size2M`] and [`Size1G`] implement it; the trait is
/// sealed so page arithmetic can rely on `SIZE` being a power of two.
pub trait PageSize:
    sealed::Sealed + Copy + Eq + Ord + Hash + fmt::Debug + fmt::Display + 'static
{
    /// Page size in bytes.
    const SIZE: u64;

    /// `log2(SIZE)`.
    const SHIFT: u32;

    /// Mask selecting the in-page offset bits.
    const OFFSET_MASK: u64 = Self::SIZE - 1;

    /// Short human-readable label, e.g. `"4K"`.
    const LABEL: &'static str;
}

macro_rules! page_size {
    ($(#[$doc:meta])* $name:ident, $size:expr, $shift:expr, $label:literal) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = $size;
            const SHIFT: u32 = $shift;
            const LABEL: &'static str = $label;
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::LABEL)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::LABEL)
            }
        }

        const _: () = assert!(1u64 << $shift == $size);
    };
}

page_size!(
    /// 4 KiB page, the frame granularity of the physical allocator.
    Size4K,
    4096,
    12,
    "4K"
);

page_size!(
    /// 2 MiB large page (PD-level leaf).
    Size2M,
    2 * 1024 * 1024,
    21,
    "2M"
);

page_size!(
    /// 1 GiB huge page (PDPT-level leaf).
    Size1G,
    1024 * 1024 * 1024,
    30,
    "1G"
);
