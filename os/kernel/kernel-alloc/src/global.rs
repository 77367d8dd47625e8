//! # Global Allocator Adapter
//!
//! [`LockedKernelMemory`] puts a [`KernelMemory`] behind one [`SpinLock`]
//! so it can serve as the `#[global_allocator]`. Until a context is
//! [installed](LockedKernelMemory::install) every allocation fails with a
//! null pointer.
//!
//! ```ignore
//! #[global_allocator]
//! static MEMORY: LockedKernelMemory<'static, DirectMapper, X86Mmu> = LockedKernelMemory::new();
//!
//! MEMORY.install(unsafe { KernelMemory::boot_or_halt(&info, &MAPPER, X86Mmu::new(), &MemoryLayout::DEFAULT) });
//! ```
//!
//! The lock does not mask interrupts; allocating from an interrupt handler
//! that preempted an allocation deadlocks.

use crate::heap::{Heap, QUANTUM};
use crate::manager::KernelMemory;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};
use kernel_sync::SpinLock;
use kernel_vmem::{Mmu, PhysMapper};

pub struct LockedKernelMemory<'a, M: PhysMapper, T: Mmu> {
    inner: SpinLock<Option<KernelMemory<'a, M, T>>>,
}

impl<'a, M: PhysMapper, T: Mmu> LockedKernelMemory<'a, M, T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Installs `memory`, returning the previously installed context.
    pub fn install(&self, memory: KernelMemory<'a, M, T>) -> Option<KernelMemory<'a, M, T>> {
        self.inner.with_lock(|slot| slot.replace(memory))
    }

    /// Runs `f` on the installed context under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut KernelMemory<'a, M, T>) -> R) -> Option<R> {
        self.inner.with_lock(|slot| slot.as_mut().map(f))
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.inner.with_lock(|slot| slot.is_some())
    }
}

impl<M: PhysMapper, T: Mmu> Default for LockedKernelMemory<'_, M, T> {
    fn default() -> Self {
        Self::new()
    }
}

fn allocate(heap: &mut Heap, layout: Layout) -> Option<NonNull<u8>> {
    if layout.align() > QUANTUM {
        heap.alloc_aligned(layout.size(), layout.align()).ok()
    } else {
        heap.alloc(layout.size()).ok()
    }
}

unsafe impl<M: PhysMapper, T: Mmu> GlobalAlloc for LockedKernelMemory<'_, M, T> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with(|memory| allocate(memory.heap_mut(), layout))
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Some(ptr) = NonNull::new(ptr) else {
            return;
        };
        // Rejections are logged and counted by the heap.
        self.with(|memory| unsafe { memory.kfree(ptr) });
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { self.alloc(layout) };
        if !ptr.is_null() {
            unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
        }
        ptr
    }

    /// Keeps the alignment of the original allocation.
    unsafe fn realloc(&self, ptr: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        self.with(|memory| unsafe { memory.krealloc(NonNull::new(ptr), new_size) }.ok())
            .flatten()
            .flatten()
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }
}
