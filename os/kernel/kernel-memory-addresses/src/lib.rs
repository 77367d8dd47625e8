//! # Physical and Virtual Address Types
//!
//! Zero-cost wrappers that keep physical and virtual addresses apart at the
//! type level. Everything above this crate (the frame allocator, the page-table
//! walker and the heap) speaks in these types instead of bare `u64`s.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`PhysicalPage<S>`] | The aligned base of a physical page of size `S`; a *frame* for `S = Size4K`. |
//! | [`VirtualAddress`] | A byte address in a page-table translated address space. |
//! | [`VirtualPage<S>`] | The aligned base of a virtual page of size `S`. |
//!
//! Page sizes are marker types implementing the sealed [`PageSize`] trait:
//! [`Size4K`], [`Size2M`] and [`Size1G`].
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! let page = va.page::<Size4K>();
//! assert_eq!(page.join(va.offset::<Size4K>()), va);
//!
//! let frame = PhysicalAddress::new(0x20_0000).page::<Size2M>();
//! assert_eq!(frame.number(), 1);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use physical_address::{PhysicalAddress, PhysicalPage};
pub use virtual_address::{VirtualAddress, VirtualPage};

/// Rounds `value` down to a multiple of `align` (a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Rounds `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` if the result does not fit into a `u64`.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
/// assert_eq!(align_up(0x1000, 0x1000), Some(0x1000));
/// assert_eq!(align_up(u64::MAX, 0x1000), None);
/// ```
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_split_and_join() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let page = pa.page::<Size4K>();
        assert_eq!(page.base(), PhysicalAddress::new(0x0000_0010_2000_0000));
        assert_eq!(page.join(pa.offset::<Size4K>()), pa);
    }

    #[test]
    fn frame_numbers_follow_page_size() {
        let pa = PhysicalAddress::new(0x4000_0000);
        assert_eq!(pa.page::<Size4K>().number(), 0x4_0000);
        assert_eq!(pa.page::<Size2M>().number(), 0x200);
        assert_eq!(pa.page::<Size1G>().number(), 1);
    }

    #[test]
    fn try_from_base_rejects_unaligned() {
        assert!(VirtualPage::<Size4K>::try_from_base(VirtualAddress::new(0x1000)).is_some());
        assert!(VirtualPage::<Size4K>::try_from_base(VirtualAddress::new(0x1008)).is_none());
        assert!(PhysicalPage::<Size2M>::try_from_base(PhysicalAddress::new(0x1000)).is_none());
    }

    #[test]
    fn align_up_overflow() {
        assert_eq!(PhysicalAddress::new(u64::MAX).align_up::<Size4K>(), None);
        assert_eq!(
            PhysicalAddress::new(0x1).align_up::<Size4K>(),
            Some(PhysicalAddress::new(0x1000))
        );
    }

    #[test]
    fn checked_step_walks_pages() {
        let page = VirtualAddress::new(0xFFFF_FFFF_9000_0000).page::<Size4K>();
        let third = page.checked_step(3).expect("in range");
        assert_eq!(third.base().as_u64(), 0xFFFF_FFFF_9000_3000);
        assert!(page.checked_step(u64::MAX).is_none());
    }

    #[test]
    fn canonical_addresses() {
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x0001_0000_0000_0000).is_canonical());
    }

    #[test]
    fn debug_formats() {
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x1000)),
            "PA(0x0000000000001000)"
        );
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x1000).page::<Size4K>()),
            "VirtualPage<4K>(0x0000000000001000)"
        );
    }
}
