//! Translation tables: the entry model, the [`Mapper`] that edits them, and the root handle.
//!
//! Tables live in arena pages and are only ever addressed by their physical address; software
//! reaches them through [`PageArena::translate`]. Edges run strictly parent to child, and the
//! builder never links a table that is already linked, so the hierarchy is always a tree.

mod build;
mod mutate;
mod reserve;
mod walk;

use core::fmt;

use bitflags::Flags;
use log::{error, trace};

pub use walk::Leaf;

use crate::{
    Architecture, AttributeResolver, GRANULE_SIZE, Mmu, PageArena, PhysAddr, VirtAddr,
    error::{XlatError, XlatResult},
    region::{MemorySpaceDescriptor, identity_regions},
};
use reserve::Reservation;

/// A decoded descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry<F> {
    /// Nothing mapped; the walker faults.
    Invalid,
    /// Maps a whole block (or page, at the deepest level) to `phys`.
    Block {
        /// Output address, aligned to the block size.
        phys: PhysAddr,
        /// Attribute bits.
        flags: F,
    },
    /// Points at the next level table.
    Table {
        /// Physical address of the table.
        next: PhysAddr,
    },
}

/// A table as seen while planning: one that exists, or one the call would have to create.
#[derive(Debug, Clone, Copy)]
enum PlanNode {
    Existing(PhysAddr),
    Fresh,
}

/// A change to leaf flags: `(flags & !clear) | set`, in deepest-level format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation<F> {
    /// Bits to set.
    pub set: F,
    /// Bits to clear first.
    pub clear: F,
}

impl<F: Flags<Bits = u64> + Copy> Mutation<F> {
    /// A mutation that only sets `flags`.
    pub fn set(flags: F) -> Self {
        Self {
            set: flags,
            clear: F::empty(),
        }
    }

    /// A mutation that only clears `flags`.
    pub fn clear(flags: F) -> Self {
        Self {
            set: F::empty(),
            clear: flags,
        }
    }

    /// A mutation with the effect of `self` followed by `then`.
    pub fn and(self, then: Self) -> Self {
        Self {
            set: F::from_bits_retain((self.set.bits() & !then.clear.bits()) | then.set.bits()),
            clear: F::from_bits_retain(self.clear.bits() | then.clear.bits()),
        }
    }

    /// Applies the mutation to `flags`.
    pub fn apply(&self, flags: F) -> F {
        F::from_bits_retain((flags.bits() & !self.clear.bits()) | self.set.bits())
    }
}

/// Architecture independent access permission changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Refuse writes.
    ReadOnly,
    /// Allow writes.
    ReadWrite,
    /// Refuse instruction fetches.
    ExecuteNever,
    /// Allow instruction fetches.
    Executable,
}

/// The root of a table hierarchy.
///
/// Owned by the caller. `live` flips once the hierarchy has been installed, and from then on
/// every write into it is followed by TLB maintenance.
#[derive(Debug, PartialEq, Eq)]
pub struct RootTable {
    base: PhysAddr,
    live: bool,
}

impl RootTable {
    /// Physical address of the root table.
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    /// Returns true once the hierarchy has been activated.
    pub const fn is_live(&self) -> bool {
        self.live
    }

    pub(crate) fn mark_live(&mut self) {
        self.live = true;
    }
}

/// Builds and edits the table hierarchies of one architecture configuration.
pub struct Mapper<'a, A, P, M>
where
    A: Architecture,
    P: PageArena,
    M: Mmu,
{
    arch: &'a A,
    arena: &'a mut P,
    mmu: &'a mut M,
    resolver: Option<&'a dyn AttributeResolver>,
}

impl<'a, A, P, M> Mapper<'a, A, P, M>
where
    A: Architecture,
    P: PageArena,
    M: Mmu,
{
    /// Creates a mapper without an attribute resolver.
    pub fn new(arch: &'a A, arena: &'a mut P, mmu: &'a mut M) -> Self {
        Self {
            arch,
            arena,
            mmu,
            resolver: None,
        }
    }

    /// Consults `resolver` before committing blocks, and for the cache policy of every leaf.
    pub fn with_resolver(mut self, resolver: &'a dyn AttributeResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// The architecture configuration this mapper builds for.
    pub fn arch(&self) -> &A {
        self.arch
    }

    /// Allocates an empty root table.
    pub fn create_root(&mut self) -> XlatResult<RootTable> {
        let pages = self.table_pages(0);
        let base = self
            .arena
            .allocate_aligned(pages, self.arch.table_align(0))?;
        // SAFETY: The arena just handed us these pages.
        unsafe {
            self.arena
                .translate(base)
                .write_bytes(0, pages * GRANULE_SIZE as usize)
        };
        let bytes = self.arch.table_bytes(0) as usize;
        self.mmu.clean_table(self.arena.translate(base), bytes);
        trace!("{}: new root table at {:?}", A::NAME, base);
        Ok(RootTable { base, live: false })
    }

    /// Frees every table of a hierarchy that was never activated.
    pub fn release(&mut self, root: RootTable) -> XlatResult<()> {
        if root.live {
            return Err(XlatError::InvalidParameter("cannot release a live root table"));
        }
        self.free_subtree(root.base, 0)
    }

    fn free_subtree(&mut self, table: PhysAddr, level: usize) -> XlatResult<()> {
        if level != self.arch.deepest() {
            for index in 0..self.arch.entries(level) {
                if let Entry::Table { next } = self.entry(table, level, index)? {
                    self.free_subtree(next, level + 1)?;
                }
            }
        }
        let pages = self.table_pages(level);
        // SAFETY: Never-live tables aren't referenced by a walker, and the parent goes next.
        unsafe { self.arena.free(table, pages) };
        Ok(())
    }

    /// Identity maps a platform memory space map into `root`.
    pub fn map_memory_space(
        &mut self,
        root: &RootTable,
        space: &[MemorySpaceDescriptor],
    ) -> XlatResult<()> {
        for region in identity_regions(space) {
            self.build(root, &region)?;
        }
        Ok(())
    }

    /// Installs `root` and turns translation on. See [`crate::activate()`].
    ///
    /// # Safety
    /// As [`crate::activate()`].
    pub unsafe fn activate(&mut self, root: &mut RootTable) -> XlatResult<()> {
        // SAFETY: Forwarded to the caller.
        unsafe { crate::activate(self.arch, &mut *self.mmu, root) }
    }

    fn table_pages(&self, level: usize) -> usize {
        self.arch.table_bytes(level).div_ceil(GRANULE_SIZE) as usize
    }

    /// Boundary of the block after the one `cursor` is in, capped at `end`.
    fn boundary(&self, level: usize, cursor: u64, end: u64) -> u64 {
        ((cursor | (self.arch.block_size(level) - 1)) + 1).min(end)
    }

    fn entry_ptr(&self, table: PhysAddr, index: usize) -> *mut u8 {
        // SAFETY: `index` is below the table's entry count, which keeps it inside the table.
        unsafe { self.arena.translate(table).add(index * A::ENTRY_BYTES) }
    }

    fn read_raw(&self, table: PhysAddr, index: usize) -> u64 {
        let ptr = self.entry_ptr(table, index);
        // SAFETY: Tables are arena pages, aligned to at least the entry size. Volatile because
        // the hardware walker may update accessed/dirty bits behind our back.
        unsafe {
            match A::ENTRY_BYTES {
                4 => (ptr as *const u32).read_volatile() as u64,
                _ => (ptr as *const u64).read_volatile(),
            }
        }
    }

    fn write_raw(&mut self, table: PhysAddr, index: usize, raw: u64) {
        let ptr = self.entry_ptr(table, index);
        // SAFETY: As in `read_raw`. A single store of the native width, so the walker never sees
        // half a descriptor.
        unsafe {
            match A::ENTRY_BYTES {
                4 => (ptr as *mut u32).write_volatile(raw as u32),
                _ => (ptr as *mut u64).write_volatile(raw),
            }
        }
    }

    fn entry(&self, table: PhysAddr, level: usize, index: usize) -> XlatResult<Entry<A::Flags>> {
        let raw = self.read_raw(table, index);
        self.arch.decode(level, raw).ok_or_else(|| {
            error!(
                "{}: corrupted entry {:#x} at level {}, index {} of table {:?}",
                A::NAME,
                raw,
                level,
                index,
                table
            );
            XlatError::CorruptedState { level, index, raw }
        })
    }

    /// The slot `va` lands in, as planning sees it: fresh tables are empty.
    fn planned_entry(
        &self,
        node: PlanNode,
        level: usize,
        va: u64,
    ) -> XlatResult<Entry<A::Flags>> {
        match node {
            PlanNode::Existing(table) => self.entry(table, level, self.arch.entry_index(level, va)),
            PlanNode::Fresh => Ok(Entry::Invalid),
        }
    }

    /// Writes `entry` and, if anyone could be caching the old one, invalidates the span it
    /// covers.
    fn publish(
        &mut self,
        table: PhysAddr,
        level: usize,
        index: usize,
        entry: Entry<A::Flags>,
        va: u64,
        live: bool,
    ) {
        let raw = self.arch.encode(level, entry);
        self.write_raw(table, index, raw);
        let ptr = self.entry_ptr(table, index);
        self.mmu.clean_entry(ptr);
        if live || A::INVALIDATE_OFFLINE {
            let size = self.arch.block_size(level);
            self.mmu.barrier();
            self.mmu.invalidate_range(VirtAddr::new(va & !(size - 1)), size);
        }
    }

    /// Takes a reserved page and turns it into the next level table for `slot`: empty for an
    /// invalid slot, or a replica of the block it is about to replace.
    fn new_child(
        &mut self,
        level: usize,
        slot: Entry<A::Flags>,
        reservation: &mut Reservation,
    ) -> XlatResult<PhysAddr> {
        let child = reservation.take(&*self.arena)?;
        // SAFETY: The page is ours until it is linked, and child tables fit in one page.
        unsafe {
            self.arena
                .translate(child)
                .write_bytes(0, GRANULE_SIZE as usize)
        };
        if let Entry::Block { phys, flags } = slot {
            let child_level = level + 1;
            let flags = self.arch.split_flags(level, flags);
            let size = self.arch.block_size(child_level);
            for index in 0..self.arch.entries(child_level) {
                let entry = Entry::Block {
                    phys: phys + index as u64 * size,
                    flags,
                };
                let raw = self.arch.encode(child_level, entry);
                self.write_raw(child, index, raw);
            }
            trace!(
                "{}: splitting level {} block {:?} into {:?}",
                A::NAME,
                level,
                phys,
                child
            );
        } else {
            trace!("{}: new level {} table at {:?}", A::NAME, level + 1, child);
        }
        let bytes = self.arch.table_bytes(level + 1) as usize;
        self.mmu.clean_table(self.arena.translate(child), bytes);
        Ok(child)
    }
}

impl<A, P, M> fmt::Debug for Mapper<'_, A, P, M>
where
    A: Architecture + fmt::Debug,
    P: PageArena,
    M: Mmu,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapper")
            .field("arch", self.arch)
            .field("resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}
