//! # Direct-Offset Physical Mapper
//!
//! A [`PhysMapper`] for kernels that can see all of physical memory at a
//! fixed virtual offset: every physical address `pa` is reachable at
//! `offset + pa`.
//!
//! - With `offset == 0` this is the identity map the boot code sets up for
//!   low memory.
//! - With a higher-half offset it is a direct map of all RAM.
//! - Hosted tests point `offset` at a heap buffer standing in for RAM.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::DirectMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let mapper = unsafe { DirectMapper::new(0xffff_8000_0000_0000) };
//! let ptr = mapper.phys_to_ptr(PhysicalAddress::new(0x1234_0000));
//! assert_eq!(ptr as u64, 0xffff_8000_1234_0000);
//! ```

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] adding a constant offset to physical addresses.
///
/// # Safety
/// Constructing one asserts that `[offset, offset + max_phys)` maps all
/// physical memory the kernel will touch through it, writable, for the
/// mapper's lifetime.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DirectMapper {
    offset: u64,
}

impl DirectMapper {
    /// # Safety
    /// See the type-level documentation.
    #[must_use]
    pub const unsafe fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// Physical address == virtual address.
    ///
    /// # Safety
    /// The low memory the kernel touches must be identity mapped.
    #[must_use]
    pub const unsafe fn identity() -> Self {
        Self { offset: 0 }
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

unsafe impl PhysMapper for DirectMapper {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        self.offset.wrapping_add(pa.as_u64()) as *mut u8
    }
}
