//! Software table walks.

use crate::{
    Architecture, Attribute, Mmu, PageArena, PhysAddr, VirtAddr, error::XlatResult,
};

use super::{Entry, Mapper, RootTable};

/// A leaf entry found by a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Leaf<F> {
    /// First virtual address the leaf maps.
    pub virt: VirtAddr,
    /// Where `virt` goes.
    pub phys: PhysAddr,
    /// Bytes mapped.
    pub size: u64,
    /// Level the leaf sits at.
    pub level: usize,
    /// Attribute bits, in the format of `level`.
    pub flags: F,
}

impl<F> Leaf<F> {
    /// Physical address of `va`, if the leaf covers it.
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        let offset = va.as_u64().checked_sub(self.virt.as_u64())?;
        (offset < self.size).then(|| self.phys + offset)
    }
}

impl<A, P, M> Mapper<'_, A, P, M>
where
    A: Architecture,
    P: PageArena,
    M: Mmu,
{
    /// The leaf mapping `va`, or `None` if the walk ends at an invalid entry.
    pub fn leaf_at(&self, root: &RootTable, va: VirtAddr) -> XlatResult<Option<Leaf<A::Flags>>> {
        let va = va.as_u64();
        let mut table = root.base();
        for level in 0..self.arch.levels() {
            let index = self.arch.entry_index(level, va);
            match self.entry(table, level, index)? {
                Entry::Invalid => return Ok(None),
                Entry::Table { next } => table = next,
                Entry::Block { phys, flags } => {
                    let size = self.arch.block_size(level);
                    return Ok(Some(Leaf {
                        virt: VirtAddr::new(va & !(size - 1)),
                        phys,
                        size,
                        level,
                        flags,
                    }));
                }
            }
        }
        // Only a table at the deepest level gets us here, and `decode` never produces one.
        Ok(None)
    }

    /// Translates `va` the way the hardware walker would.
    pub fn translate(&self, root: &RootTable, va: VirtAddr) -> XlatResult<Option<PhysAddr>> {
        Ok(self
            .leaf_at(root, va)?
            .and_then(|leaf| leaf.translate(va)))
    }

    /// The attribute `va` is mapped with.
    pub fn attribute_at(&self, root: &RootTable, va: VirtAddr) -> XlatResult<Option<Attribute>> {
        Ok(self
            .leaf_at(root, va)?
            .and_then(|leaf| self.arch.attribute_of(leaf.level, leaf.flags)))
    }

    /// Calls `f` with every leaf under `root`, in ascending virtual address order.
    pub fn for_each_leaf<F>(&self, root: &RootTable, mut f: F) -> XlatResult<()>
    where
        F: FnMut(Leaf<A::Flags>),
    {
        self.walk_leaves(root.base(), 0, 0, &mut f)
    }

    fn walk_leaves<F>(&self, table: PhysAddr, level: usize, prefix: u64, f: &mut F) -> XlatResult<()>
    where
        F: FnMut(Leaf<A::Flags>),
    {
        let size = self.arch.block_size(level);
        for index in 0..self.arch.entries(level) {
            let virt = prefix + index as u64 * size;
            match self.entry(table, level, index)? {
                Entry::Invalid => {}
                Entry::Table { next } => self.walk_leaves(next, level + 1, virt, f)?,
                Entry::Block { phys, flags } => f(Leaf {
                    virt: VirtAddr::new(virt),
                    phys,
                    size,
                    level,
                    flags,
                }),
            }
        }
        Ok(())
    }
}
