//! Physical page arenas backing the translation tables.

use arrayvec::ArrayVec;
use log::{trace, warn};

use crate::{GRANULE_SIZE, PhysAddr};

/// The arena could not satisfy an allocation.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Out of memory")]
pub struct OutOfMemory;

/// Supplies the pages translation tables live in.
///
/// Counts are in units of [`GRANULE_SIZE`] pages.
pub trait PageArena {
    /// Allocates `count` physically contiguous pages.
    fn allocate(&mut self, count: usize) -> Result<PhysAddr, OutOfMemory>;

    /// Returns pages to the arena.
    ///
    /// # Safety
    /// `base..base + count` must have been handed out by this arena and must no longer be
    /// referenced by anything, including a hardware table walker.
    unsafe fn free(&mut self, base: PhysAddr, count: usize);

    /// Returns a pointer software can use to reach the page at `base`.
    fn translate(&self, base: PhysAddr) -> *mut u8;

    /// Allocates `count` pages whose base is a multiple of `align`.
    ///
    /// The default over-allocates and gives the slack back, so the arena must accept frees of
    /// partial allocations.
    fn allocate_aligned(&mut self, count: usize, align: u64) -> Result<PhysAddr, OutOfMemory> {
        if align <= GRANULE_SIZE {
            return self.allocate(count);
        }
        let slack = (align / GRANULE_SIZE) as usize - 1;
        let base = self.allocate(count + slack)?;
        let aligned = base.align_up(align);
        let head = ((aligned - base) / GRANULE_SIZE) as usize;
        let tail = slack - head;
        // SAFETY: Both pieces come from the allocation above and nobody has seen them yet.
        unsafe {
            if head != 0 {
                self.free(base, head);
            }
            if tail != 0 {
                self.free(aligned + (count as u64) * GRANULE_SIZE, tail);
            }
        }
        Ok(aligned)
    }
}

/// A range of physical addresses. This is used to represent a contiguous block of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysRange {
    start: PhysAddr,
    end: PhysAddr,
}

impl PhysRange {
    /// Creates a new physical address range with the given start and end addresses.
    /// The start address must be less than the end address.
    pub fn new(start: PhysAddr, end: PhysAddr) -> Self {
        assert!(start < end, "Start address must be less than end address");
        Self { start, end }
    }

    /// Check if this range contains the given physical address.
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    /// The size of this range in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Returns the start address of this range.
    pub fn start(&self) -> PhysAddr {
        self.start
    }

    /// Returns the end address of this range.
    pub fn end(&self) -> PhysAddr {
        self.end
    }
}

const FREE_LIST_CAPACITY: usize = 64;

/// A bump arena over a list of free physical ranges, for use before any real allocator exists.
///
/// Pages are reachable by software at `physical + offset` (0 for an identity mapped boot
/// environment). Freed runs go to a small free list and are handed out again first.
pub struct RangeArena<I>
where
    I: Iterator<Item = PhysRange>,
{
    ranges: I,
    current: Option<(PhysAddr, PhysAddr)>,
    offset: u64,
    free: ArrayVec<(PhysAddr, usize), FREE_LIST_CAPACITY>,
}

impl<I> RangeArena<I>
where
    I: Iterator<Item = PhysRange>,
{
    /// Creates an arena over `ranges`, software visible at `physical + offset`.
    pub fn new(ranges: I, offset: u64) -> Self {
        Self {
            ranges,
            current: None,
            offset,
            free: ArrayVec::new(),
        }
    }

    fn take_free(&mut self, count: usize) -> Option<PhysAddr> {
        let slot = self.free.iter().position(|&(_, len)| len >= count)?;
        let (base, len) = self.free[slot];
        if len == count {
            self.free.swap_remove(slot);
        } else {
            self.free[slot] = (base + (count as u64) * GRANULE_SIZE, len - count);
        }
        Some(base)
    }

    fn recycle(&mut self, base: PhysAddr, count: usize) {
        if count == 0 {
            return;
        }
        if self.free.try_push((base, count)).is_err() {
            warn!(
                "RangeArena: free list is full, leaking {} pages at {:?}",
                count, base
            );
        }
    }
}

impl<I> PageArena for RangeArena<I>
where
    I: Iterator<Item = PhysRange>,
{
    fn allocate(&mut self, count: usize) -> Result<PhysAddr, OutOfMemory> {
        if let Some(base) = self.take_free(count) {
            return Ok(base);
        }
        let bytes = (count as u64) * GRANULE_SIZE;
        loop {
            if let Some((cursor, end)) = self.current {
                if end.as_u64() - cursor.as_u64() >= bytes {
                    self.current = Some((cursor + bytes, end));
                    return Ok(cursor);
                }
                // Whatever is left of this range is too short, keep it for smaller requests.
                self.recycle(cursor, ((end - cursor) / GRANULE_SIZE) as usize);
            }
            let next = self.ranges.next().ok_or(OutOfMemory)?;
            let start = next.start().align_up(GRANULE_SIZE);
            let end = next.end().align_down(GRANULE_SIZE);
            trace!("RangeArena: moving on to {:?}..{:?}", start, end);
            self.current = (start < end).then_some((start, end));
        }
    }

    unsafe fn free(&mut self, base: PhysAddr, count: usize) {
        self.recycle(base, count);
    }

    fn translate(&self, base: PhysAddr) -> *mut u8 {
        base.as_u64().wrapping_add(self.offset) as *mut u8
    }
}

impl<I> core::fmt::Debug for RangeArena<I>
where
    I: Iterator<Item = PhysRange>,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RangeArena")
            .field("current", &self.current)
            .field("offset", &self.offset)
            .field("free", &self.free.len())
            .finish()
    }
}
