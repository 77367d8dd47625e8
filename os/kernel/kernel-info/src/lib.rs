//! # Kernel Memory Configuration and Boot Handoff
//!
//! Shared constants and plain data types that the boot path and the memory
//! manager agree on.
//!
//! ## Virtual Memory Layout
//!
//! ```text
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │  Identity map (boot, low 4 MiB) │
//!                       ├─────────────────────────────────┤
//!                       │         User Space              │
//!                       │                                 │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! KERNEL_ALLOC_WINDOW   ├─────────────────────────────────┤ 0xffff_ffff_9000_0000
//!   _BASE               │  Heap arena (first allocation)  │
//!                       │  alloc_pages() mappings         │
//!                       ├─────────────────────────────────┤ + KERNEL_ALLOC_WINDOW_BYTES
//!                       │          unused                 │
//! 0xffff_ffff_ffff_ffff └─────────────────────────────────┘
//! ```
//!
//! ## Physical Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1MiB)         │
//! PHYS_LOAD   ├─────────────────────────────────┤ 0x0010_0000 (1 MiB)
//!             │       Kernel Image              │
//!             ├─────────────────────────────────┤
//!             │   Frame bitmap (placed at boot) │
//!             ├─────────────────────────────────┤
//!             │    Available RAM                │
//!             │  (managed by the frame allocator│
//!             └─────────────────────────────────┘
//! ```
//!
//! The compile-time constants live in [`memory`] and are checked with `const`
//! assertions; [`memory::MemoryLayout`] carries them at runtime so the memory
//! manager can be brought up with a smaller layout under test. The boot
//! loader's memory map is described by the types in [`boot`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
