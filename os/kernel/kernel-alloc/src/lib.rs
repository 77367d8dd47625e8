//! # Kernel Memory Management
//!
//! Physical frame allocation, the kernel's virtual memory manager and the
//! kernel heap, plus the context that boots and owns all three.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Kernel Heap ([`heap`])                 │
//! │    • best-fit blocks with checksummed headers       │
//! │    • split on alloc, coalesce on free               │
//! │    • aligned allocations via back-offset tags       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ arena from `alloc_pages`
//! ┌─────────────────▼───────────────────────────────────┐
//! │         Virtual Memory Manager ([`vmm`])            │
//! │    • 4-level mappings with TLB maintenance          │
//! │    • kernel allocation window, regions, stats       │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ frames for tables and pages
//! ┌─────────────────▼───────────────────────────────────┐
//! │      Physical Frame Allocator ([`frame_alloc`])     │
//! │    • one bit per 4 KiB frame, next-fit scan         │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//!            boot memory map
//! ```
//!
//! [`KernelMemory`] initializes the layers bottom-up and exposes the
//! kernel-facing calls (`pmm_alloc_frame`, `map_page`, `alloc_pages`,
//! `kmalloc`, ...). [`LockedKernelMemory`] wraps it in a spin lock and
//! implements [`GlobalAlloc`](core::alloc::GlobalAlloc).
//!
//! Page tables are reached through a [`PhysMapper`](kernel_vmem::PhysMapper);
//! [`DirectMapper`] covers identity and fixed-offset direct maps. The paging
//! registers sit behind [`Mmu`](kernel_vmem::Mmu): the `asm` feature enables
//! the real CPU, hosted builds use [`SoftMmu`](kernel_vmem::mmu::SoftMmu).
//!
//! ## Example
//! ```rust
//! use kernel_alloc::heap::Heap;
//! use core::ptr::NonNull;
//!
//! #[repr(align(16))]
//! struct Arena([u8; 1024]);
//!
//! let mut arena = Arena([0; 1024]);
//! let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();
//! let mut heap = unsafe { Heap::new(base, arena.0.len()) }.unwrap();
//!
//! let p = heap.alloc(100).unwrap();
//! assert_eq!(heap.stats().used_blocks, 1);
//! unsafe { heap.free(p) }.unwrap();
//! assert!(heap.validate().is_ok());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod frame_alloc;
pub mod global;
pub mod heap;
pub mod manager;
pub mod phys_mapper;
pub mod vmm;

pub use frame_alloc::{BitmapFrameAlloc, FrameAllocError, FrameStats};
pub use global::LockedKernelMemory;
pub use heap::{Heap, HeapCorruption, HeapError, HeapStats};
pub use manager::{BootError, KernelMemory};
pub use phys_mapper::DirectMapper;
pub use vmm::{PagingStats, VmRegion, Vmm, VmmError};
