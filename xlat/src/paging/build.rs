//! Compiles a region into tables.

use log::debug;

use crate::{
    Architecture, Attribute, Mmu, PageArena, PhysAddr, addr::is_aligned,
    error::XlatResult, region::MemoryRegionDescriptor,
};

use super::{Entry, Mapper, PlanNode, RootTable, reserve::Reservation};

/// The region being built, in the form the recursion wants it.
#[derive(Debug, Clone, Copy)]
struct Job {
    /// `phys - virt`, wrapping.
    offset: u64,
    attribute: Attribute,
}

impl<A, P, M> Mapper<'_, A, P, M>
where
    A: Architecture,
    P: PageArena,
    M: Mmu,
{
    /// Maps `region` into the hierarchy under `root`.
    ///
    /// Blocks are used wherever the region, the architecture and the attribute resolver allow
    /// them. Either the whole region ends up mapped, or the call fails and the hierarchy is
    /// exactly as it was: tables are counted and reserved before anything is written.
    pub fn build(&mut self, root: &RootTable, region: &MemoryRegionDescriptor) -> XlatResult<()> {
        region.validate(self.arch)?;
        let job = Job {
            offset: region
                .phys_base
                .as_u64()
                .wrapping_sub(region.virt_base.as_u64()),
            attribute: region.attribute,
        };
        let (start, end) = (region.virt_base.as_u64(), region.virt_end());

        let needed = self.plan_build(PlanNode::Existing(root.base()), 0, &job, start, end)?;
        debug!(
            "{}: mapping {:?}..{:#x} -> {:?} as {:?}, {} new tables",
            A::NAME,
            region.virt_base,
            end,
            region.phys_base,
            region.attribute,
            needed
        );
        let mut reservation = Reservation::reserve(&mut *self.arena, needed)?;
        let result = self.apply_build(
            root.base(),
            0,
            &job,
            start,
            end,
            root.is_live(),
            &mut reservation,
        );
        reservation.release(&mut *self.arena);
        result
    }

    /// Counts the tables `[start, end)` needs below `node`. Reads only.
    fn plan_build(
        &self,
        node: PlanNode,
        level: usize,
        job: &Job,
        start: u64,
        end: u64,
    ) -> XlatResult<usize> {
        let mut needed = 0;
        let mut cursor = start;
        while cursor < end {
            let boundary = self.boundary(level, cursor, end);
            let slot = self.planned_entry(node, level, cursor)?;
            if !self.commits_leaf(level, slot, job, cursor, boundary) {
                needed += match slot {
                    Entry::Table { next } => {
                        self.plan_build(PlanNode::Existing(next), level + 1, job, cursor, boundary)?
                    }
                    Entry::Invalid | Entry::Block { .. } => {
                        1 + self.plan_build(PlanNode::Fresh, level + 1, job, cursor, boundary)?
                    }
                };
            }
            cursor = boundary;
        }
        Ok(needed)
    }

    /// Maps `[start, end)` into `table`, taking new tables from `reservation`.
    #[allow(clippy::too_many_arguments)]
    fn apply_build(
        &mut self,
        table: PhysAddr,
        level: usize,
        job: &Job,
        start: u64,
        end: u64,
        live: bool,
        reservation: &mut Reservation,
    ) -> XlatResult<()> {
        let mut cursor = start;
        while cursor < end {
            let boundary = self.boundary(level, cursor, end);
            let index = self.arch.entry_index(level, cursor);
            let slot = self.entry(table, level, index)?;
            if self.commits_leaf(level, slot, job, cursor, boundary) {
                let leaf = self.leaf(level, job, cursor);
                self.publish(table, level, index, leaf, cursor, live);
            } else {
                match slot {
                    Entry::Table { next } => {
                        self.apply_build(next, level + 1, job, cursor, boundary, live, reservation)?
                    }
                    Entry::Invalid | Entry::Block { .. } => {
                        // The child is complete before the walker can see it.
                        let child = self.new_child(level, slot, reservation)?;
                        self.apply_build(child, level + 1, job, cursor, boundary, false, reservation)?;
                        self.publish(table, level, index, Entry::Table { next: child }, cursor, live);
                    }
                }
            }
            cursor = boundary;
        }
        Ok(())
    }

    /// Whether `[cursor, boundary)` becomes a single leaf at `level`.
    fn commits_leaf(
        &self,
        level: usize,
        slot: Entry<A::Flags>,
        job: &Job,
        cursor: u64,
        boundary: u64,
    ) -> bool {
        match slot {
            // Never replace a linked table; it may hold other mappings.
            Entry::Table { .. } => false,
            _ if level == self.arch.deepest() => true,
            Entry::Invalid | Entry::Block { .. } => {
                let size = self.arch.block_size(level);
                let phys = cursor.wrapping_add(job.offset);
                self.arch.block_allowed(level)
                    && boundary - cursor == size
                    && is_aligned(phys, size)
                    && self
                        .resolver
                        .is_none_or(|resolver| resolver.uniform(PhysAddr::new(phys), size).is_some())
            }
        }
    }

    fn leaf(&self, level: usize, job: &Job, cursor: u64) -> Entry<A::Flags> {
        let phys = PhysAddr::new(cursor.wrapping_add(job.offset));
        let mut cache = job.attribute.cache_type();
        if let Some(resolver) = self.resolver {
            cache = cache.stricter(resolver.resolve(phys).cache_type());
        }
        Entry::Block {
            phys,
            flags: self.arch.leaf_flags(level, job.attribute, cache),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::{
        VirtAddr,
        arch::{aarch64::Aarch64, arm::ArmV7, x86_64::X86_64},
        caps::Capabilities,
        paging::Leaf,
        test_util::*,
    };

    fn region(phys: u64, virt: u64, length: u64, attribute: Attribute) -> MemoryRegionDescriptor {
        MemoryRegionDescriptor::new(PhysAddr::new(phys), VirtAddr::new(virt), length, attribute)
    }

    fn leaves<A: Architecture, P: PageArena, M: Mmu>(
        mapper: &Mapper<'_, A, P, M>,
        root: &RootTable,
    ) -> Vec<Leaf<A::Flags>> {
        let mut leaves = Vec::new();
        mapper.for_each_leaf(root, |leaf| leaves.push(leaf)).unwrap();
        leaves
    }

    #[test]
    fn test_single_page() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0, 0, 0x1000, Attribute::Uncached))
            .unwrap();

        let leaves = leaves(&mapper, &root);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].level, 3);
        assert_eq!(leaves[0].phys, PhysAddr::new(0));
        assert_eq!(
            mapper.attribute_at(&root, VirtAddr::new(0)),
            Ok(Some(Attribute::Uncached))
        );
        // Root, PDPT, PD and PT.
        assert_eq!(mapper.arena.outstanding(), 4);
    }

    #[test]
    fn test_uniform_block() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let resolver = |_: PhysAddr| Attribute::WriteBack;
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu).with_resolver(&resolver);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0x20_0000, 0x20_0000, 0x20_0000, Attribute::WriteBack))
            .unwrap();

        let leaves = leaves(&mapper, &root);
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].level, 2);
        assert_eq!(leaves[0].size, 0x20_0000);
        assert_eq!(
            mapper.attribute_at(&root, VirtAddr::new(0x3F_F000)),
            Ok(Some(Attribute::WriteBack))
        );
    }

    #[test]
    fn test_resolver_forces_split() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let resolver = |pa: PhysAddr| match pa.as_u64() {
            0x20_1000..0x20_2000 => Attribute::Uncached,
            _ => Attribute::WriteBack,
        };
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu).with_resolver(&resolver);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0x20_0000, 0x20_0000, 0x20_0000, Attribute::WriteBack))
            .unwrap();

        let leaves = leaves(&mapper, &root);
        assert_eq!(leaves.len(), 512);
        for (index, leaf) in leaves.iter().enumerate() {
            assert_eq!(leaf.level, 3);
            assert_eq!(leaf.virt, VirtAddr::new(0x20_0000 + index as u64 * 0x1000));
            let expected = if index == 1 {
                Attribute::Uncached
            } else {
                Attribute::WriteBack
            };
            assert_eq!(arch.attribute_of(leaf.level, leaf.flags), Some(expected));
        }
    }

    #[test]
    fn test_mtrr_snapshot_as_resolver() {
        use crate::arch::x86_64::mtrr::{FIXED_MTRR_COUNT, MtrrSnapshot, VariableMtrr};

        // Enabled, write-back by default, one uncached 64KiB range at 6MiB.
        let mtrrs = MtrrSnapshot::from_registers(
            (1 << 11) | 6,
            [0; FIXED_MTRR_COUNT],
            [VariableMtrr {
                base: 0x60_0000,
                mask: 0x000F_FFFF_FFFF_0000 | (1 << 11),
            }],
        );
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu).with_resolver(&mtrrs);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0x40_0000, 0x40_0000, 0x40_0000, Attribute::WriteBack))
            .unwrap();

        let leaves = leaves(&mapper, &root);
        assert_eq!(leaves.len(), 1 + 512);
        assert_eq!((leaves[0].virt, leaves[0].size), (VirtAddr::new(0x40_0000), 0x20_0000));
        assert_eq!(
            arch.attribute_of(leaves[0].level, leaves[0].flags),
            Some(Attribute::WriteBack)
        );
        for leaf in &leaves[1..] {
            assert_eq!(leaf.size, 0x1000);
            let expected = if leaf.virt.as_u64() < 0x61_0000 {
                Attribute::Uncached
            } else {
                Attribute::WriteBack
            };
            assert_eq!(arch.attribute_of(leaf.level, leaf.flags), Some(expected), "{:?}", leaf.virt);
        }
    }

    #[test]
    fn test_existing_block_is_split() {
        let arch = Aarch64::new(39, Capabilities::BASELINE).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0x8000_0000, 0x4000_0000, 0x4000_0000, Attribute::WriteBack))
            .unwrap();
        assert_eq!(leaves(&mapper, &root).len(), 1);

        // Remap one page in the middle of the 1GiB block as a device.
        mapper
            .build(&root, &region(0x1000_0000, 0x4020_1000, 0x1000, Attribute::Device))
            .unwrap();
        let leaves = leaves(&mapper, &root);
        // 511 2MiB blocks, plus 512 pages for the split one.
        assert_eq!(leaves.len(), 511 + 512);
        assert_eq!(
            mapper.translate(&root, VirtAddr::new(0x4020_1008)),
            Ok(Some(PhysAddr::new(0x1000_0008)))
        );
        assert_eq!(
            mapper.attribute_at(&root, VirtAddr::new(0x4020_1000)),
            Ok(Some(Attribute::Device))
        );
        // The rest of the block still maps where it did.
        for va in [0x4000_0000u64, 0x4020_0000, 0x4020_2000, 0x7FFF_F000] {
            assert_eq!(
                mapper.translate(&root, VirtAddr::new(va)),
                Ok(Some(PhysAddr::new(va + 0x4000_0000)))
            );
            assert_eq!(
                mapper.attribute_at(&root, VirtAddr::new(va)),
                Ok(Some(Attribute::WriteBack))
            );
        }
    }

    #[test]
    fn test_misaligned_physical_address_uses_pages() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0x1000, 0x20_0000, 0x20_0000, Attribute::WriteBack))
            .unwrap();
        assert!(leaves(&mapper, &root).iter().all(|leaf| leaf.level == 3));
    }

    #[test]
    fn test_blocks_need_capabilities() {
        let arch = X86_64::new(4, Capabilities::BASELINE).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0, 0, 0x4000_0000, Attribute::WriteBack))
            .unwrap();
        // No 1GiB pages without the capability, so 512 2MiB ones instead.
        let leaves = leaves(&mapper, &root);
        assert_eq!(leaves.len(), 512);
        assert!(leaves.iter().all(|leaf| leaf.level == 2));
    }

    #[test]
    fn test_invalid_regions_touch_nothing() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        let outstanding = mapper.arena.outstanding();
        for bad in [
            region(0, 0, 0, Attribute::WriteBack),
            region(0x800, 0, 0x1000, Attribute::WriteBack),
            region(1 << 50, 0, 0x1000, Attribute::WriteBack),
        ] {
            assert!(matches!(
                mapper.build(&root, &bad),
                Err(crate::XlatError::InvalidParameter(_))
            ));
        }
        assert_eq!(mapper.arena.outstanding(), outstanding);
        assert!(leaves(&mapper, &root).is_empty());
    }

    #[test]
    fn test_rollback_on_every_allocation() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(32);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0x10_0000, 0x10_0000, 0x3000, Attribute::WriteBack))
            .unwrap();
        let before = leaves(&mapper, &root);
        let outstanding = mapper.arena.outstanding();

        // A new PDPT, PD and PT, plus a second PT for the tail.
        let target = region(0x80_0000_0000, 0x80_001F_F000, 0x2000, Attribute::Device);
        for n in 0..4 {
            mapper.arena.fail_after(n);
            assert_eq!(
                mapper.build(&root, &target),
                Err(crate::XlatError::OutOfResources)
            );
            assert_eq!(mapper.arena.outstanding(), outstanding);
            assert_eq!(leaves(&mapper, &root), before);
            assert_eq!(
                mapper.translate(&root, VirtAddr::new(0x10_2000)),
                Ok(Some(PhysAddr::new(0x10_2000)))
            );
        }

        mapper.arena.fail_after(4);
        mapper.build(&root, &target).unwrap();
        assert_eq!(mapper.arena.outstanding(), outstanding + 4);
        assert_eq!(
            mapper.translate(&root, VirtAddr::new(0x80_0020_0000)),
            Ok(Some(PhysAddr::new(0x80_0000_1000)))
        );
    }

    #[test]
    fn test_offline_builds_skip_invalidation() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0, 0, 0x1000, Attribute::WriteBack))
            .unwrap();
        assert_eq!(mapper.mmu.invalidations(), 0);
    }

    #[test]
    fn test_live_builds_invalidate_what_they_link() {
        let arch = X86_64::new(4, x86_caps()).unwrap();
        let mut arena = TestArena::new(8);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let mut root = mapper.create_root().unwrap();
        root.mark_live();
        mapper
            .build(&root, &region(0x5000, 0x5000, 0x1000, Attribute::WriteBack))
            .unwrap();
        // The new PDPT/PD/PT were filled in offline, only the PML4 slot went in live.
        assert_eq!(
            mapper.mmu.ops,
            [
                MmuOp::Barrier,
                MmuOp::InvalidateRange(VirtAddr::new(0), 1 << 39)
            ]
        );

        mapper.mmu.ops.clear();
        mapper
            .build(&root, &region(0x6000, 0x6000, 0x1000, Attribute::WriteBack))
            .unwrap();
        assert_eq!(
            mapper.mmu.ops,
            [
                MmuOp::Barrier,
                MmuOp::InvalidateRange(VirtAddr::new(0x6000), 0x1000)
            ]
        );
    }

    #[test]
    fn test_short_descriptors_invalidate_offline() {
        let arch = ArmV7::new(Capabilities::BASELINE);
        let mut arena = TestArena::new(16);
        let mut mmu = MockMmu::new();
        let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
        let root = mapper.create_root().unwrap();
        mapper
            .build(&root, &region(0x8000_0000, 0x8000_0000, 0x10_2000, Attribute::WriteBack))
            .unwrap();
        // One section, two pages and the table pointer above them.
        assert_eq!(mapper.mmu.invalidations(), 4);
        assert_eq!(mapper.mmu.cleans(), 4);
        assert_eq!(
            mapper.attribute_at(&root, VirtAddr::new(0x8010_1000)),
            Ok(Some(Attribute::WriteBack))
        );
        assert_eq!(
            mapper.leaf_at(&root, VirtAddr::new(0x8000_0000)).unwrap().map(|l| l.size),
            Some(0x10_0000)
        );
    }

    #[derive(Debug, Clone)]
    struct Shape {
        pages: u64,
        gap: u64,
        shift: u64,
        attribute: Attribute,
    }

    fn arb_attribute() -> impl Strategy<Value = Attribute> {
        prop_oneof![
            Just(Attribute::WriteBack),
            Just(Attribute::WriteBackReadOnly),
            Just(Attribute::WriteBackExecuteNever),
            Just(Attribute::Device),
            Just(Attribute::WriteThrough),
            Just(Attribute::Uncached),
        ]
    }

    // Mostly congruent modulo 2MiB, so blocks stay possible.
    const SHIFTS: [u64; 4] = [0, 0x20_0000, 0x1000, 0x40_0000];

    fn arb_regions() -> impl Strategy<Value = Vec<MemoryRegionDescriptor>> {
        let shape = (1u64..1200, 0u64..1100, 0u64..4, arb_attribute()).prop_map(
            |(pages, gap, shift, attribute)| Shape {
                pages,
                gap,
                shift,
                attribute,
            },
        );
        (0u64..0x40_0000, prop::collection::vec(shape, 1..6)).prop_map(|(start, shapes)| {
            let mut virt = start * 0x1000;
            shapes
                .into_iter()
                .map(|shape| {
                    virt += shape.gap * 0x1000;
                    let phys = virt + SHIFTS[shape.shift as usize] + 0x1_0000_0000;
                    let region = region(phys, virt, shape.pages * 0x1000, shape.attribute);
                    virt += shape.pages * 0x1000;
                    region
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn built_regions_walk_back(regions in arb_regions()) {
            let arch = X86_64::new(4, x86_caps()).unwrap();
            let mut arena = TestArena::new(256);
            let mut mmu = MockMmu::new();
            let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
            let root = mapper.create_root().unwrap();
            for region in &regions {
                mapper.build(&root, region).unwrap();
            }
            for region in &regions {
                let last = region.length - 0x1000;
                for offset in [0, last / 2 & !0xFFF, last] {
                    let va = region.virt_base + offset + 0x18;
                    prop_assert_eq!(
                        mapper.translate(&root, va),
                        Ok(Some(region.phys_base + offset + 0x18))
                    );
                    prop_assert_eq!(
                        mapper.attribute_at(&root, va),
                        Ok(arch.canonical(region.attribute))
                    );
                }
            }
        }

        #[test]
        fn building_is_idempotent(regions in arb_regions()) {
            let arch = X86_64::new(4, x86_caps()).unwrap();
            let mut arena = TestArena::new(512);
            let mut mmu = MockMmu::new();
            let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
            let first = mapper.create_root().unwrap();
            let second = mapper.create_root().unwrap();
            for region in &regions {
                mapper.build(&first, region).unwrap();
                mapper.build(&second, region).unwrap();
            }
            let expected = leaves(&mapper, &first);
            prop_assert_eq!(leaves(&mapper, &second), expected.clone());

            // Again on top of itself: same leaves, no new tables.
            let outstanding = mapper.arena.outstanding();
            for region in &regions {
                mapper.build(&first, region).unwrap();
            }
            prop_assert_eq!(leaves(&mapper, &first), expected);
            prop_assert_eq!(mapper.arena.outstanding(), outstanding);
        }

        #[test]
        fn misaligned_regions_never_get_root_blocks(
            gigabyte in 0u64..256,
            misalign in 1u64..0x4_0000,
            pages in 1u64..0x4_0000,
        ) {
            let arch = Aarch64::new(39, x86_caps()).unwrap();
            let mut arena = TestArena::new(32);
            let mut mmu = MockMmu::new();
            let mut mapper = Mapper::new(&arch, &mut arena, &mut mmu);
            let root = mapper.create_root().unwrap();
            let base = (gigabyte << 30) + misalign * 0x1000;
            mapper
                .build(&root, &region(base, base, pages * 0x1000, Attribute::WriteBack))
                .unwrap();
            let leaf = mapper.leaf_at(&root, VirtAddr::new(base)).unwrap().unwrap();
            prop_assert!(leaf.level > 0);
            prop_assert!(leaves(&mapper, &root).iter().all(|leaf| leaf.level > 0));
        }
    }
}
