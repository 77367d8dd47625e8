//! # Kernel synchronization primitives
//!
//! The memory manager is non-reentrant by contract: every entry point takes
//! `&mut self`. Once it is published behind a global (for `GlobalAlloc`), a
//! single [`SpinLock`] serializes access to the whole context.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod spin_lock;

pub use spin_lock::{SpinLock, SpinLockGuard};
