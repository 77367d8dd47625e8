//! # Kernel Heap
//!
//! A best-fit, split-and-coalesce allocator over one fixed arena.
//!
//! Every block starts with a [`BlockHeader`] followed by its payload. All
//! blocks, free or not, form one address-ordered doubly linked list that
//! covers the arena without gaps; FREE blocks are additionally threaded on a
//! separate free list. Links are `u32` offsets from the arena base.
//!
//! ```text
//! arena base
//! ┌────────┬──────────────┬────────┬────────┬────────┬──────────────────┐
//! │ header │ payload      │ header │ payload│ header │ payload          │
//! │ USED   │              │ FREE   │ 0xDD.. │ USED   │                  │
//! └────────┴──────────────┴────────┴────────┴────────┴──────────────────┘
//!  ◄─────── size ────────► ◄──── size ─────► ◄──────── size ──────────►
//! ```
//!
//! The eight bytes right before any pointer handed out hold a
//! [`PointerTag`] with the distance back to the header. For ordinary
//! allocations that tag is the tail of the header itself; for over-aligned
//! allocations it is written into the payload. Headers carry a magic value
//! and a checksum; both are verified before a header is trusted.
//!
//! ## Invariants
//! - block sizes are multiples of [`QUANTUM`] and at least [`MIN_BLOCK`],
//! - no two FREE blocks are adjacent,
//! - `used_bytes + free_bytes == arena length`.

use core::ptr::{self, NonNull};
use log::{debug, error, info, warn};

/// Allocation granularity and minimum alignment of every pointer.
pub const QUANTUM: usize = 16;

/// Size of the per-block header.
pub const HEADER_SIZE: usize = size_of::<BlockHeader>();

/// Smallest block, header included. Splits never leave anything smaller.
pub const MIN_BLOCK: usize = HEADER_SIZE + QUANTUM;

/// Fill pattern for freed payloads while poisoning is enabled.
pub const POISON_BYTE: u8 = 0xDD;

const NIL: u32 = u32::MAX;
#[allow(clippy::cast_possible_truncation)]
const HEADER: u32 = HEADER_SIZE as u32;
#[allow(clippy::cast_possible_truncation)]
const MIN_BLOCK_U32: u32 = MIN_BLOCK as u32;
const TAG_SIZE: usize = size_of::<PointerTag>();

const MAGIC_ALLOCATED: u64 = 0xA110_CA7E_DB10_C000;
const MAGIC_FREE: u64 = 0xF4EE_B10C_F4EE_B10C;

const TAG_DIRECT: u16 = 0xB10C;
const TAG_ALIGNED: u16 = 0xA11C;

/// Back-reference stored immediately before a user pointer.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct PointerTag {
    /// Bytes from the header to the user pointer.
    back: u32,
    kind: u16,
    align_log2: u16,
}

impl PointerTag {
    #[allow(clippy::cast_possible_truncation)]
    const fn direct() -> Self {
        Self {
            back: HEADER,
            kind: TAG_DIRECT,
            align_log2: QUANTUM.trailing_zeros() as u16,
        }
    }

    const fn is_valid(&self) -> bool {
        matches!(self.kind, TAG_DIRECT | TAG_ALIGNED)
            && self.back >= HEADER
            && self.back.is_multiple_of(QUANTUM as u32)
    }
}

#[repr(C, align(16))]
#[derive(Debug, Copy, Clone)]
struct BlockHeader {
    magic: u64,
    /// Whole block, header included.
    size: u32,
    prev: u32,
    next: u32,
    free_prev: u32,
    free_next: u32,
    /// Offset of the user pointer from the header; `0` while FREE.
    user: u32,
    /// Bytes the caller asked for; `0` while FREE.
    requested: u32,
    checksum: u32,
    tag: PointerTag,
}

const _: () = assert!(HEADER_SIZE == 48);
const _: () = assert!(HEADER_SIZE.is_multiple_of(QUANTUM));
const _: () = assert!(TAG_SIZE == 8);

impl BlockHeader {
    const fn free(size: u32, prev: u32, next: u32) -> Self {
        Self {
            magic: MAGIC_FREE,
            size,
            prev,
            next,
            free_prev: NIL,
            free_next: NIL,
            user: 0,
            requested: 0,
            checksum: 0,
            tag: PointerTag::direct(),
        }
    }

    const fn is_free(&self) -> bool {
        self.magic == MAGIC_FREE
    }

    /// FNV-1a over the header's 32-bit words, `checksum` excluded.
    #[allow(clippy::cast_possible_truncation)]
    fn compute_checksum(&self) -> u32 {
        [
            self.magic as u32,
            (self.magic >> 32) as u32,
            self.size,
            self.prev,
            self.next,
            self.free_prev,
            self.free_next,
            self.user,
            self.requested,
            self.tag.back,
            u32::from(self.tag.kind) | (u32::from(self.tag.align_log2) << 16),
        ]
        .iter()
        .fold(0x811C_9DC5_u32, |hash, word| {
            (hash ^ word).wrapping_mul(0x0100_0193)
        })
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapCorruption {
    #[error("block offset {offset:#x} is outside the arena or misaligned")]
    BadOffset { offset: u32 },
    #[error("block at {offset:#x} has magic {magic:#018x}")]
    BadMagic { offset: u32, magic: u64 },
    #[error("block at {offset:#x} fails its checksum")]
    BadChecksum { offset: u32 },
    #[error("block at {offset:#x} has invalid size {size:#x}")]
    BadSize { offset: u32, size: u32 },
    #[error("block at {offset:#x} has an inconsistent back link")]
    BrokenLink { offset: u32 },
    #[error("block at {offset:#x} is not followed by its neighbour")]
    Gap { offset: u32 },
    #[error("free blocks at {offset:#x} and its predecessor are not merged")]
    Uncoalesced { offset: u32 },
    #[error("free list is inconsistent at {offset:#x}")]
    FreeList { offset: u32 },
    #[error("allocated block at {offset:#x} has a bad user offset")]
    BadUserOffset { offset: u32 },
    #[error("counted {used} used / {free} free bytes, statistics say {recorded_used} / {recorded_free}")]
    Accounting {
        used: usize,
        free: usize,
        recorded_used: usize,
        recorded_free: usize,
    },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("out of heap memory for {requested} bytes")]
    OutOfMemory { requested: usize },
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("allocation size overflows")]
    Overflow,
    #[error("{0:#x} was not handed out by this heap")]
    InvalidPointer(usize),
    #[error("double free of {0:#x}")]
    DoubleFree(usize),
    #[error("{0:#x} refers to a free block")]
    NotAllocated(usize),
    #[error("heap arena is not 16-byte aligned")]
    ArenaMisaligned,
    #[error("heap arena of {0} bytes is too small")]
    ArenaTooSmall(usize),
    #[error("heap arena of {0} bytes exceeds the 4 GiB offset range")]
    ArenaTooLarge(usize),
    #[error("heap corruption: {0}")]
    Corrupted(#[from] HeapCorruption),
}

/// Snapshot of the heap's counters.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub allocations: u64,
    pub deallocations: u64,
    pub failures: u64,
    pub corruptions: u64,
    pub double_frees: u64,
    pub largest_free: usize,
    pub smallest_free: usize,
}

#[derive(Debug, Copy, Clone, Default)]
struct Counters {
    used_bytes: usize,
    free_bytes: usize,
    used_blocks: usize,
    free_blocks: usize,
    allocations: u64,
    deallocations: u64,
    failures: u64,
    corruptions: u64,
    double_frees: u64,
}

pub struct Heap {
    base: NonNull<u8>,
    len: u32,
    free_head: u32,
    poison: bool,
    counters: Counters,
}

// Safety: the arena is owned exclusively by the heap; all access goes
// through `&mut self`.
unsafe impl Send for Heap {}

impl Heap {
    /// Formats `[base, base + len)` as one FREE block. `len` is rounded down
    /// to the quantum. Poisoning starts enabled.
    ///
    /// # Errors
    /// Misaligned, too small or too large arenas.
    ///
    /// # Safety
    /// The range must be valid, writable and exclusive to the heap for its
    /// whole lifetime.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> Result<Self, HeapError> {
        if !base.as_ptr().addr().is_multiple_of(QUANTUM) {
            return Err(HeapError::ArenaMisaligned);
        }
        let len = len & !(QUANTUM - 1);
        if len < MIN_BLOCK {
            return Err(HeapError::ArenaTooSmall(len));
        }
        let arena = u32::try_from(len)
            .ok()
            .filter(|l| *l < NIL)
            .ok_or(HeapError::ArenaTooLarge(len))?;

        let mut heap = Self {
            base,
            len: arena,
            free_head: NIL,
            poison: true,
            counters: Counters {
                free_bytes: len,
                free_blocks: 1,
                ..Counters::default()
            },
        };
        heap.write(0, BlockHeader::free(arena, NIL, NIL));
        heap.push_free(0);

        info!("heap: {} KiB arena at {:p}", len / 1024, base);
        Ok(heap)
    }

    #[inline]
    #[must_use]
    pub const fn arena_len(&self) -> usize {
        self.len as usize
    }

    /// Whether `ptr` points into the arena.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        ptr.addr()
            .checked_sub(self.base.as_ptr().addr())
            .is_some_and(|rel| rel < self.len as usize)
    }

    pub const fn set_poison(&mut self, enabled: bool) {
        self.poison = enabled;
    }

    #[must_use]
    pub const fn poison_enabled(&self) -> bool {
        self.poison
    }

    /// Allocates `size` bytes aligned to [`QUANTUM`].
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`], [`HeapError::OutOfMemory`] (the arena never
    /// grows), or [`HeapError::Corrupted`] if the free list is damaged.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        let Some((total, requested)) = block_size_for(size).zip(u32::try_from(size).ok()) else {
            return Err(self.out_of_memory(size));
        };
        let off = self.find(total, size)?;
        Ok(self.carve(off, total, HEADER, requested))
    }

    /// Allocates `size` bytes whose address is a multiple of `align`.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc), plus [`HeapError::InvalidAlignment`] and
    /// [`HeapError::Overflow`].
    pub fn alloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidAlignment(align));
        }
        if align <= QUANTUM {
            return self.alloc(size);
        }
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }

        let padded = size.checked_add(align).ok_or(HeapError::Overflow)?;
        let Some((total, requested)) = block_size_for(padded).zip(u32::try_from(size).ok()) else {
            return Err(self.out_of_memory(size));
        };
        let off = self.find(total, size)?;

        let block = self.base.as_ptr().addr() + off as usize;
        let aligned = (block + HEADER_SIZE + TAG_SIZE).next_multiple_of(align);
        // Bounded by HEADER_SIZE + align, which fits the block.
        #[allow(clippy::cast_possible_truncation)]
        let user = (aligned - block) as u32;

        let ptr = self.carve(off, total, user, requested);
        #[allow(clippy::cast_possible_truncation)]
        let tag = PointerTag {
            back: user,
            kind: TAG_ALIGNED,
            align_log2: align.trailing_zeros() as u16,
        };
        unsafe { ptr.as_ptr().sub(TAG_SIZE).cast::<PointerTag>().write(tag) };
        Ok(ptr)
    }

    /// [`alloc`](Self::alloc) followed by zeroing.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn zalloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.alloc(size)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// [`alloc_aligned`](Self::alloc_aligned) followed by zeroing.
    ///
    /// # Errors
    /// As [`alloc_aligned`](Self::alloc_aligned).
    pub fn zalloc_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        let ptr = self.alloc_aligned(size, align)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, size) };
        Ok(ptr)
    }

    /// Zeroed array of `count` elements of `size` bytes.
    ///
    /// # Errors
    /// [`HeapError::Overflow`] if `count * size` overflows, otherwise as
    /// [`alloc`](Self::alloc).
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let bytes = count.checked_mul(size).ok_or(HeapError::Overflow)?;
        self.zalloc(bytes)
    }

    /// Copies `s` into a new NUL-terminated allocation.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc).
    pub fn strdup(&mut self, s: &str) -> Result<NonNull<u8>, HeapError> {
        let len = s.len();
        let ptr = self.alloc(len.checked_add(1).ok_or(HeapError::Overflow)?)?;
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), len);
            ptr.as_ptr().add(len).write(0);
        }
        Ok(ptr)
    }

    /// Releases an allocation.
    ///
    /// The header is validated before anything is written. A FREE header is
    /// reported as a double free and counted; damaged headers are counted as
    /// corruption. Neither case changes the heap.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`], [`HeapError::DoubleFree`] or
    /// [`HeapError::Corrupted`].
    ///
    /// # Safety
    /// `ptr` must not be used after a successful call.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let (off, header) = self.locate(ptr)?;
        if header.is_free() {
            self.counters.double_frees += 1;
            warn!("heap: double free of {ptr:p}");
            return Err(HeapError::DoubleFree(ptr.as_ptr().addr()));
        }
        self.release(off);
        Ok(())
    }

    /// Resizes an allocation, C `realloc` style.
    ///
    /// - `None` behaves like [`alloc`](Self::alloc).
    /// - `new_size == 0` frees `ptr` and returns `Ok(None)`.
    /// - If the block already has room, the pointer is kept and any excess
    ///   large enough for a block is split off.
    /// - Otherwise the content moves to a new block with the same alignment.
    ///
    /// On error the original allocation and its content are unchanged.
    ///
    /// # Errors
    /// As [`alloc`](Self::alloc) and [`free`](Self::free), plus
    /// [`HeapError::NotAllocated`].
    ///
    /// # Safety
    /// On success, `ptr` must not be used any more unless it was returned.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(ptr) = ptr else {
            return self.alloc(new_size).map(Some);
        };
        if new_size == 0 {
            unsafe { self.free(ptr)? };
            return Ok(None);
        }

        let (off, header) = self.locate(ptr)?;
        if header.is_free() {
            warn!("heap: realloc of freed {ptr:p}");
            return Err(HeapError::NotAllocated(ptr.as_ptr().addr()));
        }

        let usable = (header.size - header.user) as usize;
        if new_size <= usable {
            self.shrink(off, new_size);
            return Ok(Some(ptr));
        }

        let tag = unsafe { ptr.as_ptr().sub(TAG_SIZE).cast::<PointerTag>().read() };
        let align = 1usize << tag.align_log2;
        let new = if align > QUANTUM {
            self.alloc_aligned(new_size, align)?
        } else {
            self.alloc(new_size)?
        };

        unsafe {
            ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), usable);
        }
        self.release(off);
        Ok(Some(new))
    }

    /// Bytes usable behind `ptr`, at least what was requested.
    ///
    /// # Errors
    /// [`HeapError::InvalidPointer`], [`HeapError::NotAllocated`] or
    /// [`HeapError::Corrupted`].
    pub fn usable_size(&mut self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let (_, header) = self.locate(ptr)?;
        if header.is_free() {
            return Err(HeapError::NotAllocated(ptr.as_ptr().addr()));
        }
        Ok((header.size - header.user) as usize)
    }

    /// Current counters plus the largest and smallest FREE block.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut largest = 0;
        let mut smallest = 0;
        let mut cur = self.free_head;
        for _ in 0..self.counters.free_blocks {
            let Ok(h) = self.check(cur) else { break };
            let size = h.size as usize;
            largest = largest.max(size);
            smallest = if smallest == 0 { size } else { smallest.min(size) };
            cur = h.free_next;
        }

        let c = &self.counters;
        HeapStats {
            total_bytes: self.len as usize,
            used_bytes: c.used_bytes,
            free_bytes: c.free_bytes,
            used_blocks: c.used_blocks,
            free_blocks: c.free_blocks,
            allocations: c.allocations,
            deallocations: c.deallocations,
            failures: c.failures,
            corruptions: c.corruptions,
            double_frees: c.double_frees,
            largest_free: largest,
            smallest_free: smallest,
        }
    }

    /// Walks the whole arena and the free list and checks every invariant.
    ///
    /// # Errors
    /// The first inconsistency found.
    pub fn validate(&self) -> Result<(), HeapCorruption> {
        let (mut used, mut free, mut free_blocks) = (0usize, 0usize, 0usize);
        let mut prev = NIL;
        let mut prev_free = false;
        let mut off = 0;

        while off != NIL {
            let h = self.check(off)?;
            if h.prev != prev {
                return Err(HeapCorruption::BrokenLink { offset: off });
            }
            if h.is_free() {
                if prev_free {
                    return Err(HeapCorruption::Uncoalesced { offset: off });
                }
                free += h.size as usize;
                free_blocks += 1;
            } else {
                if h.user < HEADER || u64::from(h.user) + u64::from(h.requested) > u64::from(h.size) {
                    return Err(HeapCorruption::BadUserOffset { offset: off });
                }
                used += h.size as usize;
            }

            let end = off + h.size;
            let expected_next = if end == self.len { NIL } else { end };
            if h.next != expected_next {
                return Err(HeapCorruption::Gap { offset: off });
            }
            prev_free = h.is_free();
            prev = off;
            off = h.next;
        }

        let mut listed = 0;
        let mut back = NIL;
        let mut cur = self.free_head;
        while cur != NIL {
            let h = self.check(cur)?;
            listed += 1;
            if !h.is_free() || h.free_prev != back || listed > free_blocks {
                return Err(HeapCorruption::FreeList { offset: cur });
            }
            back = cur;
            cur = h.free_next;
        }
        if listed != free_blocks || free_blocks != self.counters.free_blocks {
            return Err(HeapCorruption::FreeList { offset: self.free_head });
        }

        if used != self.counters.used_bytes || free != self.counters.free_bytes {
            return Err(HeapCorruption::Accounting {
                used,
                free,
                recorded_used: self.counters.used_bytes,
                recorded_free: self.counters.free_bytes,
            });
        }
        Ok(())
    }

    /// Logs every block in address order.
    pub fn log_blocks(&self) {
        let mut off = 0;
        while off != NIL {
            match self.check(off) {
                Ok(h) => {
                    info!(
                        "heap: {off:#010x} {:>8} {} req={}",
                        h.size,
                        if h.is_free() { "FREE" } else { "USED" },
                        h.requested
                    );
                    off = h.next;
                }
                Err(err) => {
                    error!("heap: block walk stopped: {err}");
                    return;
                }
            }
        }
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        info!(
            "heap: {} / {} bytes used in {} blocks, {} free blocks (largest {}, smallest {}), \
             allocs={} frees={} failures={} corruptions={} double_frees={}",
            s.used_bytes,
            s.total_bytes,
            s.used_blocks,
            s.free_blocks,
            s.largest_free,
            s.smallest_free,
            s.allocations,
            s.deallocations,
            s.failures,
            s.corruptions,
            s.double_frees
        );
    }

    fn header_ptr(&self, off: u32) -> *mut BlockHeader {
        unsafe { self.base.as_ptr().add(off as usize).cast() }
    }

    fn read(&self, off: u32) -> BlockHeader {
        unsafe { self.header_ptr(off).read() }
    }

    fn write(&mut self, off: u32, mut header: BlockHeader) {
        header.checksum = header.compute_checksum();
        unsafe { self.header_ptr(off).write(header) };
    }

    fn user_ptr(&self, off: u32, user: u32) -> NonNull<u8> {
        unsafe { self.base.add(off as usize + user as usize) }
    }

    /// Reads the header at `off` after bounds, magic, checksum and size checks.
    fn check(&self, off: u32) -> Result<BlockHeader, HeapCorruption> {
        if off >= self.len
            || !off.is_multiple_of(QUANTUM as u32)
            || self.len - off < HEADER
        {
            return Err(HeapCorruption::BadOffset { offset: off });
        }
        let h = self.read(off);
        if h.magic != MAGIC_ALLOCATED && h.magic != MAGIC_FREE {
            return Err(HeapCorruption::BadMagic {
                offset: off,
                magic: h.magic,
            });
        }
        if h.checksum != h.compute_checksum() {
            return Err(HeapCorruption::BadChecksum { offset: off });
        }
        if !h.size.is_multiple_of(QUANTUM as u32) || h.size < MIN_BLOCK_U32 || h.size > self.len - off {
            return Err(HeapCorruption::BadSize {
                offset: off,
                size: h.size,
            });
        }
        Ok(h)
    }

    fn corrupt(&mut self, err: HeapCorruption) -> HeapError {
        self.counters.corruptions += 1;
        error!("heap: {err}");
        HeapError::Corrupted(err)
    }

    fn out_of_memory(&mut self, requested: usize) -> HeapError {
        self.counters.failures += 1;
        error!(
            "heap: cannot satisfy {requested} bytes ({} free in {} blocks)",
            self.counters.free_bytes, self.counters.free_blocks
        );
        HeapError::OutOfMemory { requested }
    }

    /// Finds the header of the block `ptr` was handed out from.
    fn locate(&mut self, ptr: NonNull<u8>) -> Result<(u32, BlockHeader), HeapError> {
        let addr = ptr.as_ptr().addr();
        let Some(rel) = addr
            .checked_sub(self.base.as_ptr().addr())
            .filter(|rel| *rel >= HEADER_SIZE && *rel < self.len as usize && rel.is_multiple_of(QUANTUM))
        else {
            warn!("heap: {ptr:p} is not a heap pointer");
            return Err(HeapError::InvalidPointer(addr));
        };

        let tag = unsafe { self.base.add(rel - TAG_SIZE).cast::<PointerTag>().read() };
        if !tag.is_valid() || tag.back as usize > rel {
            warn!("heap: {ptr:p} carries no valid pointer tag");
            return Err(HeapError::InvalidPointer(addr));
        }

        #[allow(clippy::cast_possible_truncation)]
        let off = (rel - tag.back as usize) as u32;
        let header = self.check(off).map_err(|err| self.corrupt(err))?;
        if !header.is_free() && header.user != tag.back {
            warn!("heap: {ptr:p} does not match the block at {off:#x}");
            return Err(HeapError::InvalidPointer(addr));
        }
        Ok((off, header))
    }

    /// Best fit over the free list; an exact match ends the search.
    fn best_fit(&self, total: u32) -> Result<Option<u32>, HeapCorruption> {
        let mut best: Option<(u32, u32)> = None;
        let mut cur = self.free_head;
        let mut steps = 0;

        while cur != NIL {
            let h = self.check(cur)?;
            steps += 1;
            if !h.is_free() || steps > self.counters.free_blocks {
                return Err(HeapCorruption::FreeList { offset: cur });
            }
            if h.size == total {
                return Ok(Some(cur));
            }
            if h.size > total && best.is_none_or(|(_, size)| h.size < size) {
                best = Some((cur, h.size));
            }
            cur = h.free_next;
        }
        Ok(best.map(|(off, _)| off))
    }

    fn find(&mut self, total: u32, requested: usize) -> Result<u32, HeapError> {
        match self.best_fit(total) {
            Ok(Some(off)) => Ok(off),
            Ok(None) => Err(self.out_of_memory(requested)),
            Err(err) => Err(self.corrupt(err)),
        }
    }

    /// Turns the FREE block at `off` into an allocation of `total` bytes,
    /// splitting off the rest when it can form a block of its own.
    fn carve(&mut self, off: u32, total: u32, user: u32, requested: u32) -> NonNull<u8> {
        self.unlink_free(off);
        let mut h = self.read(off);

        let spare = h.size - total;
        if spare >= MIN_BLOCK_U32 {
            let rest = off + total;
            self.write(rest, BlockHeader::free(spare, off, h.next));
            self.set_prev(h.next, rest);
            self.push_free(rest);
            h.size = total;
            h.next = rest;
            debug!("heap: split {off:#x} at {rest:#x} ({spare} bytes left)");
        } else {
            self.counters.free_blocks -= 1;
        }

        self.counters.free_bytes -= h.size as usize;
        self.counters.used_bytes += h.size as usize;
        self.counters.used_blocks += 1;
        self.counters.allocations += 1;

        h.magic = MAGIC_ALLOCATED;
        h.user = user;
        h.requested = requested;
        h.tag = PointerTag::direct();
        self.write(off, h);
        self.user_ptr(off, user)
    }

    /// Marks the validated, allocated block at `off` FREE and merges it with
    /// its neighbours.
    fn release(&mut self, off: u32) {
        let mut h = self.read(off);
        let size = h.size;
        if self.poison {
            unsafe {
                ptr::write_bytes(
                    self.header_ptr(off).cast::<u8>().add(HEADER_SIZE),
                    POISON_BYTE,
                    (size - HEADER) as usize,
                );
            }
        }

        h.magic = MAGIC_FREE;
        h.user = 0;
        h.requested = 0;
        h.tag = PointerTag::direct();
        h.free_prev = NIL;
        h.free_next = NIL;
        self.write(off, h);

        self.counters.used_bytes -= size as usize;
        self.counters.used_blocks -= 1;
        self.counters.free_bytes += size as usize;
        self.counters.free_blocks += 1;
        self.counters.deallocations += 1;

        self.push_free(off);
        self.coalesce(off);
    }

    /// Shrinks the allocated block at `off` to fit `new_size` payload bytes.
    fn shrink(&mut self, off: u32, new_size: usize) {
        let mut h = self.read(off);
        #[allow(clippy::cast_possible_truncation)]
        let needed = ((h.user as usize + new_size).next_multiple_of(QUANTUM).max(MIN_BLOCK)) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let requested = new_size as u32;
        h.requested = requested;

        let spare = h.size - needed;
        if spare < MIN_BLOCK_U32 {
            self.write(off, h);
            return;
        }

        let rest = off + needed;
        self.write(rest, BlockHeader::free(spare, off, h.next));
        self.set_prev(h.next, rest);
        h.size = needed;
        h.next = rest;
        self.write(off, h);

        if self.poison {
            unsafe {
                ptr::write_bytes(
                    self.header_ptr(rest).cast::<u8>().add(HEADER_SIZE),
                    POISON_BYTE,
                    (spare - HEADER) as usize,
                );
            }
        }

        self.counters.used_bytes -= spare as usize;
        self.counters.free_bytes += spare as usize;
        self.counters.free_blocks += 1;
        debug!("heap: shrunk {off:#x} to {needed} bytes");

        self.push_free(rest);
        self.coalesce(rest);
    }

    /// Merges the FREE block at `off` with FREE neighbours. Neighbours that
    /// fail validation are left alone and counted as corruption.
    fn coalesce(&mut self, off: u32) {
        let h = self.read(off);
        if h.next != NIL {
            match self.check(h.next) {
                Ok(next) if next.is_free() => self.absorb_next(off),
                Ok(_) => {}
                Err(err) => {
                    self.corrupt(err);
                    return;
                }
            }
        }

        let h = self.read(off);
        if h.prev != NIL {
            match self.check(h.prev) {
                Ok(prev) if prev.is_free() => self.absorb_next(h.prev),
                Ok(_) => {}
                Err(err) => {
                    self.corrupt(err);
                }
            }
        }
    }

    /// Folds the FREE block after `off` into the FREE block at `off`.
    fn absorb_next(&mut self, off: u32) {
        let victim = self.read(off).next;
        self.unlink_free(victim);
        let absorbed = self.read(victim);

        let mut h = self.read(off);
        h.size += absorbed.size;
        h.next = absorbed.next;
        self.write(off, h);
        self.set_prev(absorbed.next, off);

        self.counters.free_blocks -= 1;
        debug!("heap: merged {victim:#x} into {off:#x}");
    }

    fn set_prev(&mut self, off: u32, prev: u32) {
        if off != NIL {
            let mut h = self.read(off);
            h.prev = prev;
            self.write(off, h);
        }
    }

    fn push_free(&mut self, off: u32) {
        let head = self.free_head;
        let mut h = self.read(off);
        h.free_prev = NIL;
        h.free_next = head;
        self.write(off, h);

        if head != NIL {
            let mut old = self.read(head);
            old.free_prev = off;
            self.write(head, old);
        }
        self.free_head = off;
    }

    fn unlink_free(&mut self, off: u32) {
        let mut h = self.read(off);
        if h.free_prev == NIL {
            self.free_head = h.free_next;
        } else {
            let mut p = self.read(h.free_prev);
            p.free_next = h.free_next;
            self.write(h.free_prev, p);
        }
        if h.free_next != NIL {
            let mut n = self.read(h.free_next);
            n.free_prev = h.free_prev;
            self.write(h.free_next, n);
        }
        h.free_prev = NIL;
        h.free_next = NIL;
        self.write(off, h);
    }
}

/// Block size for a `payload`-byte request, or `None` when it cannot be
/// represented.
fn block_size_for(payload: usize) -> Option<u32> {
    let total = payload
        .checked_add(HEADER_SIZE)?
        .checked_next_multiple_of(QUANTUM)?
        .max(MIN_BLOCK);
    u32::try_from(total).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostMemory;

    const UNIT: usize = 4096 - HEADER_SIZE;

    fn heap_over(mem: &HostMemory) -> Heap {
        unsafe { Heap::new(mem.base(), mem.len()) }.unwrap()
    }

    fn addr(p: NonNull<u8>) -> usize {
        p.as_ptr().addr()
    }

    #[test]
    fn eight_unit_arena_reuses_freed_slot() {
        let mem = HostMemory::with_frames(8);
        let mut heap = heap_over(&mem);

        let a = heap.alloc(UNIT).unwrap();
        let b = heap.alloc(UNIT).unwrap();
        let c = heap.alloc(UNIT).unwrap();
        assert_eq!(addr(b) - addr(a), 4096);
        assert_eq!(addr(c) - addr(b), 4096);

        unsafe { heap.free(b) }.unwrap();
        let d = heap.alloc(UNIT).unwrap();
        assert_eq!(d, b);

        for p in [a, c, d] {
            unsafe { heap.free(p) }.unwrap();
            heap.validate().unwrap();
        }
        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.free_bytes, 8 * 4096);
        assert_eq!(stats.largest_free, 8 * 4096);
        assert_eq!((stats.allocations, stats.deallocations), (4, 4));
    }

    #[test]
    fn zero_size_and_exhaustion() {
        let mem = HostMemory::with_frames(1);
        let mut heap = heap_over(&mem);

        assert_eq!(heap.alloc(0), Err(HeapError::ZeroSize));
        assert_eq!(
            heap.alloc(4096),
            Err(HeapError::OutOfMemory { requested: 4096 })
        );
        assert_eq!(
            heap.alloc(usize::MAX),
            Err(HeapError::OutOfMemory {
                requested: usize::MAX
            })
        );
        let stats = heap.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.free_bytes, 4096);

        let whole = heap.alloc(4096 - HEADER_SIZE).unwrap();
        assert!(matches!(heap.alloc(1), Err(HeapError::OutOfMemory { .. })));
        unsafe { heap.free(whole) }.unwrap();
        heap.validate().unwrap();
    }

    #[test]
    fn best_fit_picks_the_smallest_sufficient_block() {
        let mem = HostMemory::with_frames(4);
        let mut heap = heap_over(&mem);

        let big = heap.alloc(256 - HEADER_SIZE).unwrap();
        let _sep1 = heap.alloc(16).unwrap();
        let small = heap.alloc(128 - HEADER_SIZE).unwrap();
        let _sep2 = heap.alloc(16).unwrap();
        unsafe {
            heap.free(big).unwrap();
            heap.free(small).unwrap();
        }

        // Exact fit for the 128-byte hole.
        assert_eq!(heap.alloc(128 - HEADER_SIZE).unwrap(), small);
        // 160-byte block: the 256-byte hole beats the large tail.
        assert_eq!(heap.alloc(100).unwrap(), big);
        heap.validate().unwrap();
    }

    #[test]
    fn adjacent_frees_coalesce_in_either_order() {
        let mem = HostMemory::with_frames(2);
        for reverse in [false, true] {
            let mut heap = heap_over(&mem);
            let x = heap.alloc(100).unwrap();
            let y = heap.alloc(100).unwrap();
            let guard = heap.alloc(100).unwrap();
            let free_blocks = heap.stats().free_blocks;

            let order = if reverse { [y, x] } else { [x, y] };
            for p in order {
                unsafe { heap.free(p) }.unwrap();
            }
            assert_eq!(heap.stats().free_blocks, free_blocks + 1);
            heap.validate().unwrap();

            unsafe { heap.free(guard) }.unwrap();
            assert_eq!(heap.stats().free_blocks, 1);
            heap.validate().unwrap();
        }
    }

    #[test]
    fn double_free_is_reported_and_ignored() {
        let mem = HostMemory::with_frames(1);
        let mut heap = heap_over(&mem);
        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        let _c = heap.alloc(32).unwrap();

        unsafe { heap.free(b) }.unwrap();
        let before = heap.stats();
        assert_eq!(unsafe { heap.free(b) }, Err(HeapError::DoubleFree(addr(b))));

        let after = heap.stats();
        assert_eq!(after.double_frees, 1);
        assert_eq!(after.free_bytes, before.free_bytes);
        assert_eq!(after.deallocations, before.deallocations);
        heap.validate().unwrap();

        // Merged into its predecessor, the stale header still flags it.
        unsafe { heap.free(a) }.unwrap();
        assert_eq!(unsafe { heap.free(b) }, Err(HeapError::DoubleFree(addr(b))));
        heap.validate().unwrap();
    }

    #[test]
    fn damaged_headers_abort_free() {
        let mem = HostMemory::with_frames(1);
        let mut heap = heap_over(&mem);
        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(64).unwrap();

        let header = unsafe { a.as_ptr().sub(HEADER_SIZE) };
        unsafe { header.write(0x42) };
        assert!(matches!(
            unsafe { heap.free(a) },
            Err(HeapError::Corrupted(HeapCorruption::BadMagic { offset: 0, .. }))
        ));

        // Size field, magic intact.
        let header = unsafe { b.as_ptr().sub(HEADER_SIZE) };
        unsafe { header.add(8).write(0xFF) };
        assert!(matches!(
            unsafe { heap.free(b) },
            Err(HeapError::Corrupted(HeapCorruption::BadChecksum { .. }))
        ));

        assert_eq!(heap.stats().corruptions, 2);
        assert_eq!(heap.stats().deallocations, 0);
        assert!(heap.validate().is_err());
    }

    #[test]
    fn foreign_pointers_are_rejected() {
        let mem = HostMemory::with_frames(1);
        let mut heap = heap_over(&mem);
        let p = heap.zalloc(64).unwrap();

        let mut outside = [0u8; 64];
        let outside = NonNull::new(outside.as_mut_ptr()).unwrap();
        assert!(matches!(
            unsafe { heap.free(outside) },
            Err(HeapError::InvalidPointer(_))
        ));
        let inner = unsafe { p.add(16) };
        assert_eq!(
            unsafe { heap.free(inner) },
            Err(HeapError::InvalidPointer(addr(inner)))
        );
        assert_eq!(heap.stats().corruptions, 0);
        unsafe { heap.free(p) }.unwrap();
    }

    #[test]
    fn realloc_grows_shrinks_and_fails_cleanly() {
        let mem = HostMemory::with_frames(2);
        let mut heap = heap_over(&mem);

        let p = unsafe { heap.realloc(None, 40) }.unwrap().unwrap();
        unsafe { ptr::copy_nonoverlapping(b"0123456789".as_ptr(), p.as_ptr(), 10) };
        let _pin = heap.alloc(16).unwrap();

        let grown = unsafe { heap.realloc(Some(p), 400) }.unwrap().unwrap();
        assert_ne!(grown, p);
        assert_eq!(unsafe { core::slice::from_raw_parts(grown.as_ptr(), 10) }, b"0123456789");
        assert_eq!(
            unsafe { heap.free(p) },
            Err(HeapError::DoubleFree(addr(p)))
        );

        let free_before = heap.stats().free_bytes;
        let shrunk = unsafe { heap.realloc(Some(grown), 20) }.unwrap().unwrap();
        assert_eq!(shrunk, grown);
        assert!(heap.stats().free_bytes > free_before);
        assert_eq!(heap.usable_size(shrunk).unwrap(), 80 - HEADER_SIZE);
        heap.validate().unwrap();

        let snapshot = heap.stats();
        assert!(matches!(
            unsafe { heap.realloc(Some(shrunk), 1 << 20) },
            Err(HeapError::OutOfMemory { .. })
        ));
        assert_eq!(unsafe { core::slice::from_raw_parts(shrunk.as_ptr(), 10) }, b"0123456789");
        assert_eq!(heap.stats().used_bytes, snapshot.used_bytes);

        assert_eq!(unsafe { heap.realloc(Some(shrunk), 0) }, Ok(None));
        heap.validate().unwrap();
    }

    #[test]
    fn realloc_moves_every_usable_byte() {
        let mem = HostMemory::with_frames(1);
        let mut heap = heap_over(&mem);

        let p = heap.alloc(1).unwrap();
        let _pin = heap.alloc(16).unwrap();
        let usable = heap.usable_size(p).unwrap();
        assert!(usable > 1);
        unsafe { p.as_ptr().write_bytes(0x5A, usable) };

        let moved = unsafe { heap.realloc(Some(p), 200) }.unwrap().unwrap();
        assert_ne!(moved, p);
        let bytes = unsafe { core::slice::from_raw_parts(moved.as_ptr(), usable) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        heap.validate().unwrap();
    }

    #[test]
    fn aligned_allocations() {
        let mem = HostMemory::with_frames(8);
        let mut heap = heap_over(&mem);
        let _skew = heap.alloc(24).unwrap();

        let mut ptrs = Vec::new();
        for align in [32, 64, 256, 4096] {
            let p = heap.alloc_aligned(100, align).unwrap();
            assert_eq!(addr(p) % align, 0, "align {align}");
            assert!(heap.usable_size(p).unwrap() >= 100);
            unsafe { ptr::write_bytes(p.as_ptr(), 0xAB, 100) };
            ptrs.push(p);
        }
        heap.validate().unwrap();

        let moved = unsafe { heap.realloc(Some(ptrs[1]), 2000) }.unwrap().unwrap();
        assert_eq!(addr(moved) % 64, 0);
        assert_eq!(unsafe { moved.as_ptr().add(99).read() }, 0xAB);
        ptrs[1] = moved;

        for p in ptrs {
            unsafe { heap.free(p) }.unwrap();
        }
        heap.validate().unwrap();

        assert_eq!(heap.alloc_aligned(8, 48), Err(HeapError::InvalidAlignment(48)));
        assert_eq!(heap.alloc_aligned(0, 64), Err(HeapError::ZeroSize));
        assert_eq!(heap.alloc_aligned(usize::MAX, 64), Err(HeapError::Overflow));
    }

    #[test]
    fn zeroing_and_poisoning() {
        let mem = HostMemory::with_frames(1);
        let mut heap = heap_over(&mem);

        let p = heap.alloc(64).unwrap();
        unsafe { ptr::write_bytes(p.as_ptr(), 0xAB, 64) };
        let _pin = heap.alloc(16).unwrap();
        unsafe { heap.free(p) }.unwrap();
        assert_eq!(unsafe { p.as_ptr().add(10).read() }, POISON_BYTE);

        let q = heap.calloc(8, 8).unwrap();
        assert_eq!(q, p);
        assert!(unsafe { core::slice::from_raw_parts(q.as_ptr(), 64) }.iter().all(|b| *b == 0));
        assert_eq!(heap.calloc(usize::MAX, 2), Err(HeapError::Overflow));

        heap.set_poison(false);
        unsafe { ptr::write_bytes(q.as_ptr(), 0x11, 64) };
        unsafe { heap.free(q) }.unwrap();
        assert_eq!(unsafe { q.as_ptr().add(10).read() }, 0x11);
    }

    #[test]
    fn strdup_copies_and_terminates() {
        let mem = HostMemory::with_frames(1);
        let mut heap = heap_over(&mem);
        let s = heap.strdup("kernel").unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(s.as_ptr(), 7) };
        assert_eq!(bytes, b"kernel\0");
    }

    #[test]
    fn free_block_extremes() {
        let mem = HostMemory::with_frames(2);
        let mut heap = heap_over(&mem);
        let a = heap.alloc(200).unwrap();
        let _b = heap.alloc(16).unwrap();
        unsafe { heap.free(a) }.unwrap();

        let stats = heap.stats();
        assert_eq!(stats.free_blocks, 2);
        assert_eq!(stats.smallest_free, 256);
        assert_eq!(stats.largest_free, 8192 - 256 - 64);
        assert_eq!(stats.used_bytes + stats.free_bytes, stats.total_bytes);
    }

    #[test]
    fn mixed_workload_keeps_invariants() {
        let mem = HostMemory::with_frames(16);
        let mut heap = heap_over(&mem);
        let mut live: Vec<NonNull<u8>> = Vec::new();
        let mut seed = 0x2545_F491_u32;

        for _ in 0..2000 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let size = (seed % 700) as usize + 1;

            if seed % 3 == 0 && !live.is_empty() {
                let p = live.swap_remove(seed as usize % live.len());
                unsafe { heap.free(p) }.unwrap();
            } else if seed % 7 == 0 && !live.is_empty() {
                let i = seed as usize % live.len();
                if let Ok(Some(p)) = unsafe { heap.realloc(Some(live[i]), size * 2) } {
                    live[i] = p;
                }
            } else if let Ok(p) = heap.alloc_aligned(size, 1 << (seed % 8)) {
                live.push(p);
            }

            heap.validate().unwrap();
            let s = heap.stats();
            assert_eq!(s.used_bytes + s.free_bytes, s.total_bytes);
            assert_eq!(s.used_blocks, live.len());
        }

        for p in live {
            unsafe { heap.free(p) }.unwrap();
        }
        assert_eq!(heap.stats().free_blocks, 1);
    }
}
