//! # Typed `x86_64` Paging Registers
//!
//! The control registers and TLB instructions the memory manager touches:
//!
//! - [`cr0::Cr0`] to check and enable paging (`CR0.PG`),
//! - [`cr3::Cr3`] to read and switch the active PML4,
//! - [`tlb`] for single-page (`invlpg`) and full (CR3 reload) invalidation.
//!
//! Register values are plain `bitfield` structs and can be built and inspected
//! anywhere. Reading or writing the hardware registers requires the `asm`
//! feature and ring 0.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "asm")]
pub mod tlb;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// Control register access is privileged and requires ring 0.
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// Control register access is privileged and requires ring 0. Writing a
    /// value that does not describe a valid paging configuration faults.
    unsafe fn store_unsafe(self);
}
