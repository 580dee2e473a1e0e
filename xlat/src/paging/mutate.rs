//! Permission and attribute changes on tables that may already be live.

use log::debug;

use crate::{
    Architecture, Attribute, GRANULE_SIZE, Mmu, PageArena, PhysAddr, VirtAddr,
    addr::is_aligned,
    error::{XlatError, XlatResult},
};

use super::{Entry, Mapper, Mutation, Permission, PlanNode, RootTable, reserve::Reservation};

impl<A, P, M> Mapper<'_, A, P, M>
where
    A: Architecture,
    P: PageArena,
    M: Mmu,
{
    /// Applies `mutation` to every page in `[virt, virt + length)`.
    ///
    /// Blocks the range touches are split down to pages first, so the change always lands on
    /// page leaves; a split child is complete, mutation included, before it replaces its block.
    /// The hierarchy is treated as live whether or not it has been activated. Every page in the
    /// range has to be mapped, otherwise nothing is changed and `InvalidParameter` is returned.
    pub fn mutate(
        &mut self,
        root: &RootTable,
        virt: VirtAddr,
        length: u64,
        mutation: Mutation<A::Flags>,
    ) -> XlatResult<()> {
        let start = virt.as_u64();
        if length == 0 || !is_aligned(start, GRANULE_SIZE) || !is_aligned(length, GRANULE_SIZE) {
            return Err(XlatError::InvalidParameter(
                "mutation range is empty or not granule aligned",
            ));
        }
        let va_bits = self.arch.va_bits();
        let end = start
            .checked_add(length)
            .filter(|&end| va_bits >= 64 || end <= 1 << va_bits)
            .ok_or(XlatError::InvalidParameter(
                "mutation range exceeds the input address space",
            ))?;

        let needed = self.plan_mutate(PlanNode::Existing(root.base()), 0, start, end)?;
        debug!(
            "{}: mutating {:?}..{:#x} with {:?}, {} splits",
            A::NAME,
            virt,
            end,
            mutation,
            needed
        );
        let mut reservation = Reservation::reserve(&mut *self.arena, needed)?;
        let result =
            self.apply_mutate(root.base(), 0, start, end, &mutation, true, &mut reservation);
        reservation.release(&mut *self.arena);
        result
    }

    /// Changes the access permissions of `[virt, virt + length)`.
    pub fn protect(
        &mut self,
        root: &RootTable,
        virt: VirtAddr,
        length: u64,
        permission: Permission,
    ) -> XlatResult<()> {
        let mutation = self.arch.permission_change(permission);
        self.mutate(root, virt, length, mutation)
    }

    /// Remaps `[virt, virt + length)` with `attribute`, keeping the physical addresses.
    pub fn set_attribute(
        &mut self,
        root: &RootTable,
        virt: VirtAddr,
        length: u64,
        attribute: Attribute,
    ) -> XlatResult<()> {
        let mutation = self.arch.attribute_change(attribute);
        self.mutate(root, virt, length, mutation)
    }

    /// Counts the tables splitting needs below `node`, checking that everything is mapped.
    /// A fresh node is a block being split, so all of its slots are blocks.
    fn plan_mutate(&self, node: PlanNode, level: usize, start: u64, end: u64) -> XlatResult<usize> {
        let deepest = level == self.arch.deepest();
        if deepest && matches!(node, PlanNode::Fresh) {
            return Ok(0);
        }
        let mut needed = 0;
        let mut cursor = start;
        while cursor < end {
            let boundary = self.boundary(level, cursor, end);
            let slot = match node {
                PlanNode::Existing(table) => {
                    Some(self.entry(table, level, self.arch.entry_index(level, cursor))?)
                }
                PlanNode::Fresh => None,
            };
            needed += match slot {
                Some(Entry::Invalid) => {
                    return Err(XlatError::InvalidParameter(
                        "mutation range is not fully mapped",
                    ));
                }
                Some(Entry::Table { next }) => {
                    self.plan_mutate(PlanNode::Existing(next), level + 1, cursor, boundary)?
                }
                Some(Entry::Block { .. }) if deepest => 0,
                Some(Entry::Block { .. }) | None => {
                    1 + self.plan_mutate(PlanNode::Fresh, level + 1, cursor, boundary)?
                }
            };
            cursor = boundary;
        }
        Ok(needed)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_mutate(
        &mut self,
        table: PhysAddr,
        level: usize,
        start: u64,
        end: u64,
        mutation: &Mutation<A::Flags>,
        live: bool,
        reservation: &mut Reservation,
    ) -> XlatResult<()> {
        let mut cursor = start;
        while cursor < end {
            let boundary = self.boundary(level, cursor, end);
            let index = self.arch.entry_index(level, cursor);
            let slot = self.entry(table, level, index)?;
            match slot {
                // Planning already turned these away.
                Entry::Invalid => {
                    return Err(XlatError::InvalidParameter(
                        "mutation range is not fully mapped",
                    ));
                }
                Entry::Table { next } => {
                    self.apply_mutate(next, level + 1, cursor, boundary, mutation, live, reservation)?
                }
                Entry::Block { phys, flags } if level == self.arch.deepest() => {
                    let flags = mutation.apply(flags);
                    self.publish(table, level, index, Entry::Block { phys, flags }, cursor, live);
                }
                Entry::Block { .. } => {
                    let child = self.new_child(level, slot, reservation)?;
                    self.apply_mutate(child, level + 1, cursor, boundary, mutation, false, reservation)?;
                    // Invalidates the whole span of the old block, so every new leaf with it.
                    self.publish(table, level, index, Entry::Table { next: child }, cursor, live);
                }
            }
            cursor = boundary;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        MemoryRegionDescriptor,
        arch::{aarch64::Aarch64, arm::ArmV7, x86_64::X86_64},
        caps::Capabilities,
        test_util::*,
    };

    fn identity(base: u64, length: u64, attribute: Attribute) -> MemoryRegionDescriptor {
        MemoryRegionDescriptor::identity(PhysAddr::new(base), length, attribute)
    }

    #[test]
    fn test_protect_splits_block() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &identity(0x20_0000, 0x20_0000, Attribute::WriteBack))
            .unwrap();
        assert_eq!(
            mapper.leaf_at(&root, VirtAddr::new(0x20_0000)).unwrap().map(|l| l.level),
            Some(2)
        );

        mapper
            .protect(&root, VirtAddr::new(0x20_0000), 0x20_0000, Permission::ReadOnly)
            .unwrap();

        let mut count = 0;
        mapper
            .for_each_leaf(&root, |leaf| {
                assert_eq!(leaf.level, 3);
                assert_eq!(leaf.phys.as_u64(), leaf.virt.as_u64());
                assert_eq!(
                    arch.attribute_of(leaf.level, leaf.flags),
                    Some(Attribute::WriteBackReadOnly)
                );
                count += 1;
            })
            .unwrap();
        assert_eq!(count, 512);
        // The swap goes in live, and takes the old 2MiB translation with it.
        assert_eq!(
            mapper.mmu.ops,
            [
                MmuOp::Barrier,
                MmuOp::InvalidateRange(VirtAddr::new(0x20_0000), 0x20_0000)
            ]
        );
    }

    #[test]
    fn test_partial_mutation() {
        let arch = Aarch64::new(39, Capabilities::BASELINE).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &identity(0x4000_0000, 0x4000_0000, Attribute::WriteBack))
            .unwrap();
        let outstanding = mapper.arena.outstanding();

        mapper
            .protect(&root, VirtAddr::new(0x4060_3000), 0x1000, Permission::ExecuteNever)
            .unwrap();
        // 1GiB -> 2MiB -> 4KiB.
        assert_eq!(mapper.arena.outstanding(), outstanding + 2);
        assert_eq!(
            mapper.attribute_at(&root, VirtAddr::new(0x4060_3000)),
            Ok(Some(Attribute::WriteBackExecuteNever))
        );
        for va in [0x4000_0000u64, 0x4060_2000, 0x4060_4000, 0x4080_0000] {
            assert_eq!(
                mapper.attribute_at(&root, VirtAddr::new(va)),
                Ok(Some(Attribute::WriteBack))
            );
            assert_eq!(
                mapper.translate(&root, VirtAddr::new(va)),
                Ok(Some(PhysAddr::new(va)))
            );
        }

        // Back again; the tables stay split.
        mapper
            .protect(&root, VirtAddr::new(0x4060_3000), 0x1000, Permission::Executable)
            .unwrap();
        assert_eq!(
            mapper.attribute_at(&root, VirtAddr::new(0x4060_3000)),
            Ok(Some(Attribute::WriteBack))
        );
        assert_eq!(mapper.arena.outstanding(), outstanding + 2);
    }

    #[test]
    fn test_set_attribute() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &identity(0xFEE0_0000, 0x4000, Attribute::WriteBack))
            .unwrap();
        mapper
            .set_attribute(&root, VirtAddr::new(0xFEE0_1000), 0x2000, Attribute::Device)
            .unwrap();
        let attributes = [0xFEE0_0000u64, 0xFEE0_1000, 0xFEE0_2000, 0xFEE0_3000]
            .map(|va| mapper.attribute_at(&root, VirtAddr::new(va)).unwrap());
        assert_eq!(
            attributes,
            [
                Some(Attribute::WriteBack),
                Some(Attribute::Device),
                Some(Attribute::Device),
                Some(Attribute::WriteBack),
            ]
        );
        assert_eq!(
            mapper.translate(&root, VirtAddr::new(0xFEE0_2040)),
            Ok(Some(PhysAddr::new(0xFEE0_2040)))
        );
    }

    #[test]
    fn test_execute_never_without_nx_leaves_pages_alone() {
        use crate::arch::x86_64::PageTableFlags;

        let caps = Capabilities {
            execute_disable: false,
            ..x86_caps()
        };
        let arch = X86_64::new(4, caps).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &identity(0x1000, 0x1000, Attribute::WriteBack))
            .unwrap();

        mapper
            .protect(&root, VirtAddr::new(0x1000), 0x1000, Permission::ExecuteNever)
            .unwrap();
        let leaf = mapper.leaf_at(&root, VirtAddr::new(0x1000)).unwrap().unwrap();
        assert!(!leaf.flags.contains(PageTableFlags::NO_EXECUTE));
        assert!(leaf.flags.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn test_short_descriptor_section_split() {
        let arch = ArmV7::new(Capabilities::BASELINE);
        let mut arena = TestArena::new(16);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &identity(0x8000_0000, 0x10_0000, Attribute::WriteBack))
            .unwrap();
        assert_eq!(
            mapper.leaf_at(&root, VirtAddr::new(0x8000_0000)).unwrap().map(|l| l.size),
            Some(0x10_0000)
        );
        let seen = mapper.mmu.ops.len();
        let cleans = mapper.mmu.cleans();
        let tables = mapper.mmu.table_cleans();

        mapper
            .protect(&root, VirtAddr::new(0x8000_1000), 0x1000, Permission::ReadOnly)
            .unwrap();

        // The page inside the unlinked child is invalidated on its own, then the section's
        // whole span once the child replaces it.
        assert_eq!(
            mapper.mmu.ops[seen..],
            [
                MmuOp::Barrier,
                MmuOp::InvalidateRange(VirtAddr::new(0x8000_1000), 0x1000),
                MmuOp::Barrier,
                MmuOp::InvalidateRange(VirtAddr::new(0x8000_0000), 0x10_0000),
            ]
        );
        assert_eq!(mapper.mmu.cleans(), cleans + 2);
        assert_eq!(mapper.mmu.table_cleans(), tables + 1);

        let mut leaves = 0;
        mapper
            .for_each_leaf(&root, |leaf| {
                assert_eq!(leaf.size, 0x1000);
                assert_eq!(leaf.phys.as_u64(), leaf.virt.as_u64());
                leaves += 1;
            })
            .unwrap();
        assert_eq!(leaves, 256);
        let attributes = [0x8000_0000u64, 0x8000_1000, 0x8000_2000]
            .map(|va| mapper.attribute_at(&root, VirtAddr::new(va)).unwrap());
        assert_eq!(
            attributes,
            [
                Some(Attribute::WriteBack),
                Some(Attribute::WriteBackReadOnly),
                Some(Attribute::WriteBack),
            ]
        );
    }

    #[test]
    fn test_unmapped_range_is_rejected() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &identity(0x20_0000, 0x20_0000, Attribute::WriteBack))
            .unwrap();
        let outstanding = mapper.arena.outstanding();

        // The block is mapped, the page after it isn't.
        assert!(matches!(
            mapper.protect(&root, VirtAddr::new(0x3F_F000), 0x2000, Permission::ReadOnly),
            Err(XlatError::InvalidParameter(_))
        ));
        assert!(matches!(
            mapper.protect(&root, VirtAddr::new(0x1_0000_0000), 0x1000, Permission::ReadOnly),
            Err(XlatError::InvalidParameter(_))
        ));
        assert_eq!(mapper.arena.outstanding(), outstanding);
        assert!(mapper.mmu.ops.is_empty());
        assert_eq!(
            mapper.leaf_at(&root, VirtAddr::new(0x3F_F000)).unwrap().map(|l| l.level),
            Some(2)
        );
        assert_eq!(
            mapper.attribute_at(&root, VirtAddr::new(0x3F_F000)),
            Ok(Some(Attribute::WriteBack))
        );
    }

    #[test]
    fn test_bad_ranges() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        for (va, length) in [(0x1000, 0), (0x1800, 0x1000), (0x1000, 0x800), (1 << 48, 0x1000)] {
            assert!(matches!(
                mapper.protect(&root, VirtAddr::new(va), length, Permission::ReadOnly),
                Err(XlatError::InvalidParameter(_))
            ));
        }
    }

    #[test]
    fn test_mutation_rolls_back_when_out_of_pages() {
        let arch = Aarch64::new(39, Capabilities::BASELINE).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &identity(0x4000_0000, 0x4000_0000, Attribute::WriteBack))
            .unwrap();
        let outstanding = mapper.arena.outstanding();

        mapper.arena.fail_after(1);
        assert_eq!(
            mapper.protect(&root, VirtAddr::new(0x4000_0000), 0x1000, Permission::ReadOnly),
            Err(XlatError::OutOfResources)
        );
        assert_eq!(mapper.arena.outstanding(), outstanding);
        assert!(mapper.mmu.ops.is_empty());
        let leaf = mapper.leaf_at(&root, VirtAddr::new(0x4000_0000)).unwrap().unwrap();
        assert_eq!(leaf.level, 0);
        assert_eq!(arch.attribute_of(0, leaf.flags), Some(Attribute::WriteBack));
    }
}
