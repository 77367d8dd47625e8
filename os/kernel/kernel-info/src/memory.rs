//! # Memory Layout

/// Size of a physical frame and of a base virtual page.
pub const FRAME_SIZE: u64 = 4096;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in *physical* memory (LMA) before paging.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Low memory identity-mapped at boot so the kernel image, the frame bitmap
/// and the code switching CR3 stay addressable across the switch.
pub const IDENTITY_MAP_BYTES: u64 = 0x40_0000; // 4 MiB

/// Start of the window `alloc_pages` carves kernel dynamic mappings from.
/// The heap arena is the first allocation made from it.
pub const KERNEL_ALLOC_WINDOW_BASE: u64 = 0xffff_ffff_9000_0000;

/// Size of the kernel allocation window.
pub const KERNEL_ALLOC_WINDOW_BYTES: u64 = 0x1000_0000; // 256 MiB

/// Size of the kernel heap arena, requested once at boot.
pub const KERNEL_HEAP_BYTES: u64 = 0x400_0000; // 64 MiB

/// Upper bound on the number of tracked virtual memory regions.
pub const MAX_VM_REGIONS: usize = 32;

/// Upper bound on the number of released ranges the allocation window keeps
/// for reuse before it has to fall back to the bump pointer.
pub const MAX_WINDOW_HOLES: usize = 64;

const _: () = {
    assert!(IDENTITY_MAP_BYTES.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_ALLOC_WINDOW_BASE.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_ALLOC_WINDOW_BYTES.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_HEAP_BYTES.is_multiple_of(FRAME_SIZE));
    assert!(KERNEL_HEAP_BYTES <= KERNEL_ALLOC_WINDOW_BYTES);
    assert!(KERNEL_ALLOC_WINDOW_BASE > KERNEL_BASE);
    assert!(KERNEL_ALLOC_WINDOW_BASE.checked_add(KERNEL_ALLOC_WINDOW_BYTES).is_some());
    assert!(PHYS_LOAD < IDENTITY_MAP_BYTES);
};

/// Runtime view of the memory layout handed to the memory manager at boot.
///
/// [`MemoryLayout::DEFAULT`] mirrors the compile-time constants of this
/// module. Tests and constrained machines shrink it with the `with_*`
/// builders.
///
/// ```rust
/// # use kernel_info::memory::{MemoryLayout, KERNEL_HEAP_BYTES};
/// let layout = MemoryLayout::DEFAULT.with_heap_bytes(0x10_0000);
/// assert!(layout.is_consistent());
/// assert_ne!(layout.heap_bytes, KERNEL_HEAP_BYTES);
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryLayout {
    /// Bytes of low physical memory to identity-map at boot.
    pub identity_map_bytes: u64,
    /// Virtual base of the kernel allocation window.
    pub alloc_window_base: u64,
    /// Size of the kernel allocation window.
    pub alloc_window_bytes: u64,
    /// Size of the heap arena.
    pub heap_bytes: u64,
}

impl MemoryLayout {
    pub const DEFAULT: Self = Self {
        identity_map_bytes: IDENTITY_MAP_BYTES,
        alloc_window_base: KERNEL_ALLOC_WINDOW_BASE,
        alloc_window_bytes: KERNEL_ALLOC_WINDOW_BYTES,
        heap_bytes: KERNEL_HEAP_BYTES,
    };

    #[must_use]
    pub const fn with_identity_map_bytes(mut self, bytes: u64) -> Self {
        self.identity_map_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_alloc_window(mut self, base: u64, bytes: u64) -> Self {
        self.alloc_window_base = base;
        self.alloc_window_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_heap_bytes(mut self, bytes: u64) -> Self {
        self.heap_bytes = bytes;
        self
    }

    /// Page alignment of every field, and the heap fitting the window.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.identity_map_bytes.is_multiple_of(FRAME_SIZE)
            && self.alloc_window_base.is_multiple_of(FRAME_SIZE)
            && self.alloc_window_bytes.is_multiple_of(FRAME_SIZE)
            && self.heap_bytes.is_multiple_of(FRAME_SIZE)
            && self.heap_bytes > 0
            && self.heap_bytes <= self.alloc_window_bytes
            && self
                .alloc_window_base
                .checked_add(self.alloc_window_bytes)
                .is_some()
    }
}

impl Default for MemoryLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}
