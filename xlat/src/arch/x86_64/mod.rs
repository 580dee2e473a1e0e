//! x86_64 long mode paging, 4 or 5 levels.

#[cfg(target_arch = "x86_64")]
pub mod hw;
pub mod mtrr;

use arrayvec::ArrayVec;
use bitflags::bitflags;
use x86_64::registers::{control::Cr4Flags, model_specific::EferFlags};

use super::{Architecture, MAX_REGISTER_UPDATES, RegisterUpdate};
use crate::{
    Attribute, CacheType, Capabilities, PhysAddr, XlatError,
    error::XlatResult,
    mmu::ControlRegister,
    paging::{Entry, Mutation, Permission},
};

/// The width of physical addresses in bits for x86_64 architecture.
pub const PHYSICAL_ADDRESS_WIDTH: u32 = 52;
/// The number of bits used for indexing into page tables at each level.
pub const TABLE_INDEX_BITS: u32 = 9;
/// Physical address bits of a descriptor.
pub const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// IA32_PAT as programmed on activation.
///
/// | index | type |
/// |-------|------|
/// | 0 | WB |
/// | 1 | WT |
/// | 2 | UC- |
/// | 3 | UC |
/// | 4 | WC |
/// | 5 | WP |
/// | 6 | UC- |
/// | 7 | UC |
///
/// The low half is the power-on default, so PWT/PCD keep meaning what they always meant.
pub const PAT_VALUE: u64 = 0x0007_0501_0007_0406;

bitflags! {
    /// Page table entry flags for x86_64 architecture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct PageTableFlags: u64 {
        /// The page is present in memory.
        const PRESENT         = 1 << 0;
        /// The page is writable.
        const WRITABLE        = 1 << 1;
        /// The page is accessible from userspace.
        const USER_ACCESSIBLE = 1 << 2;
        /// Write-through caching enabled.
        const WRITE_THROUGH   = 1 << 3;
        /// Cache disabled for this page.
        const NO_CACHE        = 1 << 4;
        /// The page has been accessed.
        const ACCESSED        = 1 << 5;
        /// The page has been written to.
        const DIRTY           = 1 << 6;
        /// This is a huge page (2MB or 1GB).
        const HUGE_PAGE       = 1 << 7;
        /// PAT index bit 2 of a 4KiB page. Shares its bit with `HUGE_PAGE`.
        const PAGE_PAT        = 1 << 7;
        /// The page is global and not flushed from TLB on CR3 reload.
        const GLOBAL          = 1 << 8;
        /// PAT index bit 2 of a 2MiB or 1GiB page.
        const LARGE_PAT       = 1 << 12;
        /// No-execute flag; if set, code execution is not allowed from this page.
        const NO_EXECUTE      = 1 << 63;
    }
}

/// x86_64 paging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86_64 {
    levels: usize,
    caps: Capabilities,
}

impl X86_64 {
    /// A 4 or 5 level configuration.
    pub fn new(levels: usize, caps: Capabilities) -> XlatResult<Self> {
        if levels != 4 && levels != 5 {
            return Err(XlatError::InvalidParameter("x86_64 paging has 4 or 5 levels"));
        }
        Ok(Self { levels, caps })
    }

    /// The deepest configuration the capabilities allow, followed by the fallback.
    pub fn ladder(caps: Capabilities) -> ArrayVec<Self, 2> {
        let mut ladder = ArrayVec::new();
        if caps.five_level {
            ladder.push(Self { levels: 5, caps });
        }
        ladder.push(Self { levels: 4, caps });
        ladder
    }

    /// How many levels above the deepest `level` is.
    fn height(&self, level: usize) -> usize {
        self.deepest() - level
    }

    fn pat_bits(&self, level: usize, index: u8) -> PageTableFlags {
        let mut flags = PageTableFlags::empty();
        flags.set(PageTableFlags::WRITE_THROUGH, index & 1 != 0);
        flags.set(PageTableFlags::NO_CACHE, index & 2 != 0);
        if index & 4 != 0 {
            flags |= if level == self.deepest() {
                PageTableFlags::PAGE_PAT
            } else {
                PageTableFlags::LARGE_PAT
            };
        }
        flags
    }

    fn pat_index(&self, level: usize, flags: PageTableFlags) -> u8 {
        let high = if level == self.deepest() {
            PageTableFlags::PAGE_PAT
        } else {
            PageTableFlags::LARGE_PAT
        };
        (flags.contains(PageTableFlags::WRITE_THROUGH) as u8)
            | ((flags.contains(PageTableFlags::NO_CACHE) as u8) << 1)
            | ((flags.contains(high) as u8) << 2)
    }
}

impl Architecture for X86_64 {
    type Flags = PageTableFlags;

    const NAME: &'static str = "x86_64";
    const ENTRY_BYTES: usize = 8;
    const BASE_REGISTER: &'static str = "CR3";
    const RETARGET_WHILE_ENABLED: bool = true;

    fn levels(&self) -> usize {
        self.levels
    }

    fn index_bits(&self, _level: usize) -> u32 {
        TABLE_INDEX_BITS
    }

    fn block_allowed(&self, level: usize) -> bool {
        match self.height(level) {
            1 => true,
            2 => self.caps.huge_pages,
            _ => false,
        }
    }

    fn phys_bits(&self) -> u32 {
        (self.caps.phys_addr_bits as u32).min(PHYSICAL_ADDRESS_WIDTH)
    }

    fn encode(&self, level: usize, entry: Entry<PageTableFlags>) -> u64 {
        match entry {
            Entry::Invalid => 0,
            Entry::Table { next } => {
                (next.as_u64() & ADDRESS_MASK)
                    | (PageTableFlags::PRESENT | PageTableFlags::WRITABLE).bits()
            }
            Entry::Block { phys, flags } if level == self.deepest() => {
                (phys.as_u64() & ADDRESS_MASK) | (flags | PageTableFlags::PRESENT).bits()
            }
            Entry::Block { phys, flags } => {
                (phys.as_u64() & ADDRESS_MASK)
                    | (flags | PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE).bits()
            }
        }
    }

    fn decode(&self, level: usize, raw: u64) -> Option<Entry<PageTableFlags>> {
        let flags = PageTableFlags::from_bits_retain(raw & !ADDRESS_MASK);
        if !flags.contains(PageTableFlags::PRESENT) {
            return Some(Entry::Invalid);
        }
        if level == self.deepest() {
            return Some(Entry::Block {
                phys: PhysAddr::new(raw & ADDRESS_MASK),
                flags: flags - PageTableFlags::PRESENT,
            });
        }
        if !flags.contains(PageTableFlags::HUGE_PAGE) {
            return Some(Entry::Table {
                next: PhysAddr::new(raw & ADDRESS_MASK),
            });
        }
        // PS is reserved in the PML4 and PML5.
        if self.height(level) > 2 {
            return None;
        }
        let pat = PageTableFlags::from_bits_retain(raw & PageTableFlags::LARGE_PAT.bits());
        Some(Entry::Block {
            phys: PhysAddr::new(raw & ADDRESS_MASK & !(self.block_size(level) - 1)),
            flags: (flags - PageTableFlags::PRESENT - PageTableFlags::HUGE_PAGE) | pat,
        })
    }

    fn leaf_flags(&self, level: usize, attribute: Attribute, cache: CacheType) -> PageTableFlags {
        let index = match cache {
            CacheType::WriteBack => 0,
            CacheType::WriteThrough => 1,
            CacheType::Uncacheable => 3,
            CacheType::WriteCombining => 4,
            CacheType::WriteProtected => 5,
        };
        let mut flags = self.pat_bits(level, index);
        flags.set(PageTableFlags::WRITABLE, !attribute.is_read_only());
        flags.set(
            PageTableFlags::NO_EXECUTE,
            attribute.is_execute_never() && self.caps.execute_disable,
        );
        flags
    }

    fn attribute_of(&self, level: usize, flags: PageTableFlags) -> Option<Attribute> {
        let index = self.pat_index(level, flags);
        let cache = CacheType::from_x86((PAT_VALUE >> (index * 8)) as u8);
        Some(match cache {
            CacheType::WriteBack if !flags.contains(PageTableFlags::WRITABLE) => {
                Attribute::WriteBackReadOnly
            }
            CacheType::WriteBack if flags.contains(PageTableFlags::NO_EXECUTE) => {
                Attribute::WriteBackExecuteNever
            }
            CacheType::Uncacheable if flags.contains(PageTableFlags::NO_EXECUTE) => {
                Attribute::Device
            }
            other => other.attribute(),
        })
    }

    fn split_flags(&self, level: usize, flags: PageTableFlags) -> PageTableFlags {
        if level + 1 == self.deepest() && flags.contains(PageTableFlags::LARGE_PAT) {
            (flags - PageTableFlags::LARGE_PAT) | PageTableFlags::PAGE_PAT
        } else {
            flags
        }
    }

    fn permission_change(&self, permission: Permission) -> Mutation<PageTableFlags> {
        match permission {
            Permission::ReadOnly => Mutation::clear(PageTableFlags::WRITABLE),
            Permission::ReadWrite => Mutation::set(PageTableFlags::WRITABLE),
            // Bit 63 is reserved unless EFER.NXE is on, and everything is executable then.
            Permission::ExecuteNever | Permission::Executable if !self.caps.execute_disable => {
                Mutation::set(PageTableFlags::empty())
            }
            Permission::ExecuteNever => Mutation::set(PageTableFlags::NO_EXECUTE),
            Permission::Executable => Mutation::clear(PageTableFlags::NO_EXECUTE),
        }
    }

    fn translation_base(&self, root: PhysAddr) -> u64 {
        // PWT/PCD clear: table walks are write-back.
        root.as_u64() & ADDRESS_MASK
    }

    fn global_state(&self) -> ArrayVec<RegisterUpdate, MAX_REGISTER_UPDATES> {
        let mut updates = ArrayVec::new();
        updates.push(RegisterUpdate {
            register: ControlRegister::MemoryAttributes,
            name: "IA32_PAT",
            set: PAT_VALUE,
            clear: u64::MAX,
            verify: u64::MAX,
            frozen: 0,
        });
        if self.caps.execute_disable {
            let nxe = EferFlags::NO_EXECUTE_ENABLE.bits();
            updates.push(RegisterUpdate {
                register: ControlRegister::Extended,
                name: "IA32_EFER",
                set: nxe,
                clear: 0,
                verify: nxe,
                frozen: 0,
            });
        }
        let pae = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
        let la57 = Cr4Flags::L5_PAGING.bits();
        updates.push(RegisterUpdate {
            register: ControlRegister::TranslationControl,
            name: "CR4",
            set: pae | if self.levels == 5 { la57 } else { 0 },
            clear: la57,
            verify: pae | la57,
            // Toggling LA57 with paging on is a #GP, not a clamp.
            frozen: la57,
        });
        updates
    }
}
