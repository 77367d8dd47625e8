//! # Bitmap Physical Frame Allocator
//!
//! One bit per 4 KiB frame of the boot memory map, `1` meaning USED. The
//! bitmap starts out all-USED; only frames lying completely inside a usable
//! region are cleared, so holes in the map and partial frames at region
//! edges are never handed out. The kernel image, the bitmap's own storage
//! and any extra reservations are set again afterwards.
//!
//! Allocation is next-fit: the scan starts at the word holding the cursor,
//! skips fully used words and wraps around once before giving up.
//!
//! ```text
//!  word 0                     word 1
//! ┌────────────────────────┐ ┌────────────────────────┐
//! │ 1111 1111 1111 1111 ...│ │ 0000 0000 0011 1111 ...│
//! └────────────────────────┘ └────────────────────────┘
//!   frames 0..64 (reserved)    frames 64..70 used, 70.. free
//! ```

use core::fmt;
use kernel_info::boot::{BootMemoryInfo, PhysicalRange};
use kernel_info::memory::FRAME_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, align_down, align_up};
use kernel_vmem::{PhysFrameAlloc, PhysMapper};
use log::{debug, info, warn};

const BITS_PER_WORD: u64 = u64::BITS as u64;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("{0:?} is not frame aligned")]
    Unaligned(PhysicalAddress),
    #[error("{address:?} lies outside the {total} managed frames")]
    OutOfRange { address: PhysicalAddress, total: u64 },
    #[error("frame {0:?} is already free")]
    DoubleFree(PhysicalAddress),
    #[error("bitmap needs {needed} words but only {provided} were provided")]
    BitmapTooSmall { needed: usize, provided: usize },
    #[error("no usable region can hold the {bytes} byte bitmap")]
    NoRoomForBitmap { bytes: u64 },
    #[error("the memory map contains no usable memory")]
    NoUsableMemory,
}

/// Frame counters. `used + free == total` always holds.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FrameStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// Number of `u64` words needed to track `total_frames` frames.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn bitmap_words(total_frames: u64) -> usize {
    total_frames.div_ceil(BITS_PER_WORD) as usize
}

/// Number of frames a bitmap for `info` has to cover.
#[inline]
#[must_use]
pub fn frames_for(info: &BootMemoryInfo<'_>) -> u64 {
    info.highest_address() / FRAME_SIZE
}

pub struct BitmapFrameAlloc<'a> {
    bitmap: &'a mut [u64],
    total: u64,
    used: u64,
    /// Frame number the next scan starts at.
    cursor: u64,
    /// Physical location of `bitmap` when it was placed by [`init_in_place`](Self::init_in_place).
    placement: Option<PhysicalRange>,
}

impl fmt::Debug for BitmapFrameAlloc<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapFrameAlloc")
            .field("total", &self.total)
            .field("used", &self.used)
            .field("cursor", &self.cursor)
            .field("placement", &self.placement)
            .finish_non_exhaustive()
    }
}

impl<'a> BitmapFrameAlloc<'a> {
    /// Builds the allocator over caller-provided bitmap storage.
    ///
    /// `reserved` lists additional physical ranges that must never be handed
    /// out (e.g. where `storage` itself lives, or boot modules).
    ///
    /// # Errors
    /// [`FrameAllocError::NoUsableMemory`] for an empty map,
    /// [`FrameAllocError::BitmapTooSmall`] if `storage` cannot cover it.
    pub fn new(
        storage: &'a mut [u64],
        info: &BootMemoryInfo<'_>,
        reserved: &[PhysicalRange],
    ) -> Result<Self, FrameAllocError> {
        let total = frames_for(info);
        if total == 0 || info.usable_bytes() == 0 {
            return Err(FrameAllocError::NoUsableMemory);
        }

        let needed = bitmap_words(total);
        if storage.len() < needed {
            return Err(FrameAllocError::BitmapTooSmall {
                needed,
                provided: storage.len(),
            });
        }

        let bitmap = &mut storage[..needed];
        bitmap.fill(u64::MAX);

        let mut pmm = Self {
            bitmap,
            total,
            used: total,
            cursor: 0,
            placement: None,
        };

        for region in info.regions.iter().filter(|r| r.kind.is_usable()) {
            let Some(start) = align_up(region.base, FRAME_SIZE) else {
                continue;
            };
            let end = align_down(region.end(), FRAME_SIZE);
            pmm.release_frames(start / FRAME_SIZE, end / FRAME_SIZE);
        }

        // Overlapping non-usable entries win over usable ones.
        for region in info.regions.iter().filter(|r| !r.kind.is_usable()) {
            pmm.mark_used(PhysicalRange::from_len(region.base, region.length));
        }

        pmm.mark_used(info.kernel_image);
        for range in reserved {
            pmm.mark_used(*range);
        }

        info!(
            "pmm: {} frames ({} KiB), {} free, {} used",
            pmm.total,
            pmm.total * FRAME_SIZE / 1024,
            pmm.free_frames(),
            pmm.used
        );
        Ok(pmm)
    }

    /// Builds the allocator with its bitmap stored inside the first usable
    /// region that can hold it without touching the kernel image or any of
    /// the `reserved` ranges. The bitmap's frames are marked USED.
    ///
    /// # Errors
    /// As [`new`](Self::new), plus [`FrameAllocError::NoRoomForBitmap`].
    ///
    /// # Safety
    /// `mapper` must make the chosen physical range writable for `'a`, and
    /// nothing else may access that memory while the allocator lives.
    pub unsafe fn init_in_place<M: PhysMapper>(
        info: &BootMemoryInfo<'_>,
        reserved: &[PhysicalRange],
        mapper: &M,
    ) -> Result<Self, FrameAllocError> {
        let total = frames_for(info);
        if total == 0 || info.usable_bytes() == 0 {
            return Err(FrameAllocError::NoUsableMemory);
        }

        let words = bitmap_words(total);
        let bytes = (words as u64) * 8;
        let Some(span) = align_up(bytes, FRAME_SIZE) else {
            return Err(FrameAllocError::NoRoomForBitmap { bytes });
        };

        let placement = find_placement(info, reserved, span)
            .ok_or(FrameAllocError::NoRoomForBitmap { bytes })?;
        debug!(
            "pmm: bitmap of {bytes} bytes placed at {:?}",
            placement.start
        );

        let storage = unsafe {
            core::slice::from_raw_parts_mut(mapper.phys_to_ptr(placement.start).cast::<u64>(), words)
        };

        let mut pmm = Self::new(storage, info, reserved)?;
        pmm.mark_used(placement);
        pmm.placement = Some(placement);
        Ok(pmm)
    }

    /// Where the bitmap lives, if it was placed by [`init_in_place`](Self::init_in_place).
    #[inline]
    #[must_use]
    pub const fn placement(&self) -> Option<PhysicalRange> {
        self.placement
    }

    /// Allocates one frame, or `None` when every frame is USED.
    pub fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        if self.used >= self.total {
            return None;
        }

        let words = self.bitmap.len();
        let first = Self::word_of(self.cursor);

        // `..=words` revisits the first word so bits below the cursor in it
        // are seen after the wrap.
        for step in 0..=words {
            let w = (first + step) % words;
            let word = self.bitmap[w];
            if word == u64::MAX {
                continue;
            }

            let frame = (w as u64) * BITS_PER_WORD + u64::from((!word).trailing_zeros());
            if frame >= self.total {
                continue;
            }

            self.set_bit(frame);
            self.used += 1;
            self.cursor = (frame + 1) % self.total;
            return Some(PhysicalAddress::new(frame * FRAME_SIZE));
        }

        None
    }

    /// Returns a frame to the pool.
    ///
    /// # Errors
    /// Misaligned, unmanaged and already free frames are rejected, logged,
    /// and leave the counters untouched.
    pub fn free_frame(&mut self, address: PhysicalAddress) -> Result<(), FrameAllocError> {
        let frame = self.frame_number(address).inspect_err(|err| {
            warn!("pmm: rejected free of {address:?}: {err}");
        })?;

        if !self.bit(frame) {
            warn!("pmm: double free of {address:?}");
            return Err(FrameAllocError::DoubleFree(address));
        }

        self.clear_bit(frame);
        self.used -= 1;
        Ok(())
    }

    /// Allocates `count` physically contiguous frames (first fit). Returns
    /// the address of the first one.
    pub fn alloc_contiguous(&mut self, count: u64) -> Option<PhysicalAddress> {
        if count == 0 || count > self.free_frames() {
            return None;
        }
        if count == 1 {
            return self.alloc_frame();
        }

        let mut run_start = 0;
        let mut run_len = 0;
        let mut frame = 0;
        while frame < self.total {
            let w = Self::word_of(frame);
            if run_len == 0 && frame % BITS_PER_WORD == 0 && self.bitmap[w] == u64::MAX {
                frame += BITS_PER_WORD;
                continue;
            }

            if self.bit(frame) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = frame;
                }
                run_len += 1;
                if run_len == count {
                    for f in run_start..run_start + count {
                        self.set_bit(f);
                    }
                    self.used += count;
                    debug!("pmm: {count} contiguous frames at frame {run_start}");
                    return Some(PhysicalAddress::new(run_start * FRAME_SIZE));
                }
            }
            frame += 1;
        }

        None
    }

    /// Frees `count` frames starting at `address`. Nothing is released unless
    /// every frame in the run is currently USED.
    ///
    /// # Errors
    /// As [`free_frame`](Self::free_frame), for the first offending frame.
    pub fn free_contiguous(
        &mut self,
        address: PhysicalAddress,
        count: u64,
    ) -> Result<(), FrameAllocError> {
        let first = self.frame_number(address)?;
        for frame in first..first.saturating_add(count) {
            let at = PhysicalAddress::new(frame * FRAME_SIZE);
            if frame >= self.total {
                return Err(FrameAllocError::OutOfRange {
                    address: at,
                    total: self.total,
                });
            }
            if !self.bit(frame) {
                warn!("pmm: double free of {at:?} in a run of {count}");
                return Err(FrameAllocError::DoubleFree(at));
            }
        }

        for frame in first..first + count {
            self.clear_bit(frame);
        }
        self.used -= count;
        Ok(())
    }

    /// Marks every frame overlapping `range` as USED. Returns how many frames
    /// changed state.
    pub fn mark_used(&mut self, range: PhysicalRange) -> u64 {
        if range.is_empty() {
            return 0;
        }
        let first = align_down(range.start.as_u64(), FRAME_SIZE) / FRAME_SIZE;
        let last = range.end.as_u64().div_ceil(FRAME_SIZE).min(self.total);

        let mut changed = 0;
        for frame in first..last {
            if !self.bit(frame) {
                self.set_bit(frame);
                changed += 1;
            }
        }
        self.used += changed;
        changed
    }

    /// Whether the frame containing `address` is managed and FREE.
    #[must_use]
    pub fn is_frame_free(&self, address: PhysicalAddress) -> bool {
        let frame = address.as_u64() / FRAME_SIZE;
        frame < self.total && !self.bit(frame)
    }

    #[must_use]
    pub const fn stats(&self) -> FrameStats {
        FrameStats {
            total: self.total,
            used: self.used,
            free: self.total - self.used,
        }
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total
    }

    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> u64 {
        self.used
    }

    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.total - self.used
    }

    fn frame_number(&self, address: PhysicalAddress) -> Result<u64, FrameAllocError> {
        if !address.is_aligned::<Size4K>() {
            return Err(FrameAllocError::Unaligned(address));
        }
        let frame = address.as_u64() / FRAME_SIZE;
        if frame >= self.total {
            return Err(FrameAllocError::OutOfRange {
                address,
                total: self.total,
            });
        }
        Ok(frame)
    }

    fn release_frames(&mut self, first: u64, end: u64) {
        for frame in first..end.min(self.total) {
            if self.bit(frame) {
                self.clear_bit(frame);
                self.used -= 1;
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn word_of(frame: u64) -> usize {
        (frame / BITS_PER_WORD) as usize
    }

    const fn mask_of(frame: u64) -> u64 {
        1 << (frame % BITS_PER_WORD)
    }

    fn bit(&self, frame: u64) -> bool {
        self.bitmap[Self::word_of(frame)] & Self::mask_of(frame) != 0
    }

    fn set_bit(&mut self, frame: u64) {
        self.bitmap[Self::word_of(frame)] |= Self::mask_of(frame);
    }

    fn clear_bit(&mut self, frame: u64) {
        self.bitmap[Self::word_of(frame)] &= !Self::mask_of(frame);
    }
}

impl PhysFrameAlloc for BitmapFrameAlloc<'_> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_frame().map(PhysicalPage::containing_address)
    }

    fn free_4k(&mut self, frame: PhysicalPage<Size4K>) {
        // Rejections are logged by `free_frame`.
        let _ = self.free_frame(frame.base());
    }
}

/// First frame-aligned `span` bytes inside a usable region that overlap
/// neither the kernel image, `reserved`, nor any non-usable map entry.
fn find_placement(
    info: &BootMemoryInfo<'_>,
    reserved: &[PhysicalRange],
    span: u64,
) -> Option<PhysicalRange> {
    let unusable = info
        .regions
        .iter()
        .filter(|r| !r.kind.is_usable())
        .map(|r| PhysicalRange::from_len(r.base, r.length));

    for region in info.regions.iter().filter(|r| r.kind.is_usable()) {
        let end = align_down(region.end(), FRAME_SIZE);
        let mut start = align_up(region.base, FRAME_SIZE)?;

        while start.checked_add(span).is_some_and(|e| e <= end) {
            let candidate = PhysicalRange::from_len(start, span);
            let blocked_until = core::iter::once(info.kernel_image)
                .chain(reserved.iter().copied())
                .chain(unusable.clone())
                .filter(|b| !b.is_empty() && candidate.start < b.end && b.start < candidate.end)
                .map(|b| b.end.as_u64())
                .max();

            match blocked_until {
                None => return Some(candidate),
                Some(until) => start = align_up(until, FRAME_SIZE)?,
            }
        }
    }
    None
}
