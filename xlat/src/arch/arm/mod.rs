//! ARMv7-A short-descriptor translation: 1MiB sections and 4KiB small pages.
//!
//! The first level has 4096 entries of 4 bytes (16KiB, 16KiB aligned). Second level tables only
//! need 1KiB, but each gets its own page.

#[cfg(target_arch = "arm")]
pub mod hw;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use super::{Architecture, MAX_REGISTER_UPDATES, RegisterUpdate};
use crate::{
    Attribute, CacheType, Capabilities, PhysAddr,
    mmu::ControlRegister,
    paging::{Entry, Mutation, Permission},
};

const L1_TYPE_TABLE: u64 = 0b01;
const L1_TYPE_SECTION: u64 = 0b10;
const L1_SUPERSECTION: u64 = 1 << 18;
const L1_TABLE_ADDRESS: u64 = 0xFFFF_FC00;
const L1_SECTION_ADDRESS: u64 = 0xFFF0_0000;
const L1_SECTION_FLAGS: u64 = 0x0003_FFFC;
const L2_TYPE_LARGE: u64 = 0b01;
const L2_SMALL_ADDRESS: u64 = 0xFFFF_F000;
const L2_SMALL_FLAGS: u64 = 0xFFD;

/// TTBR0 walk attributes: inner and outer write-back write-allocate, shareable.
const TTBR_WALK_ATTRIBUTES: u64 = (1 << 6) | (0b01 << 3) | (1 << 1);
/// Domain 0 is a client, every other domain has no access.
const DACR_VALUE: u64 = 0b01;

bitflags! {
    /// Attribute bits of sections (first level) and small pages (second level).
    ///
    /// The two formats don't share a layout; blocks are built in page format and
    /// converted on the way in and out.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct ShortFlags: u64 {
        /// Bufferable. Same bit in both formats.
        const BUFFERABLE = 1 << 2;
        /// Cacheable. Same bit in both formats.
        const CACHEABLE = 1 << 3;

        /// Section: execute never.
        const SECTION_XN = 1 << 4;
        /// Section: access permissions.
        const SECTION_AP = 0b11 << 10;
        /// Section: AP[0], privileged access only.
        const SECTION_AP0 = 1 << 10;
        /// Section: type extension.
        const SECTION_TEX = 0b111 << 12;
        /// Section: TEX[0].
        const SECTION_TEX0 = 1 << 12;
        /// Section: AP[2], read only.
        const SECTION_AP2 = 1 << 15;
        /// Section: shareable.
        const SECTION_SHAREABLE = 1 << 16;
        /// Section: not global.
        const SECTION_NOT_GLOBAL = 1 << 17;

        /// Small page: execute never.
        const PAGE_XN = 1 << 0;
        /// Small page: access permissions.
        const PAGE_AP = 0b11 << 4;
        /// Small page: AP[0], privileged access only.
        const PAGE_AP0 = 1 << 4;
        /// Small page: type extension.
        const PAGE_TEX = 0b111 << 6;
        /// Small page: TEX[0].
        const PAGE_TEX0 = 1 << 6;
        /// Small page: AP[2], read only.
        const PAGE_AP2 = 1 << 9;
        /// Small page: shareable.
        const PAGE_SHAREABLE = 1 << 10;
        /// Small page: not global.
        const PAGE_NOT_GLOBAL = 1 << 11;
    }
}

/// Converts section attribute bits to small page attribute bits.
const fn section_to_page(section: u64) -> u64 {
    (section & 0xC) | ((section >> 4) & 1) | ((section >> 6) & 0xFF0)
}

/// Converts small page attribute bits to section attribute bits.
const fn page_to_section(page: u64) -> u64 {
    (page & 0xC) | ((page & 1) << 4) | ((page & 0xFF0) << 6)
}

/// ARMv7 short-descriptor configuration. There is only one shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmV7 {
    caps: Capabilities,
}

impl ArmV7 {
    /// The two level, 32 bit configuration.
    pub const fn new(caps: Capabilities) -> Self {
        Self { caps }
    }
}

impl Architecture for ArmV7 {
    type Flags = ShortFlags;

    const NAME: &'static str = "armv7";
    const ENTRY_BYTES: usize = 4;
    const BASE_REGISTER: &'static str = "TTBR0";
    // The walker may hold entries fetched while building, so every write is followed by TLB
    // maintenance even before the table is installed.
    const INVALIDATE_OFFLINE: bool = true;

    fn levels(&self) -> usize {
        2
    }

    fn index_bits(&self, level: usize) -> u32 {
        if level == 0 { 12 } else { 8 }
    }

    fn block_allowed(&self, level: usize) -> bool {
        level == 0
    }

    fn phys_bits(&self) -> u32 {
        (self.caps.phys_addr_bits as u32).min(32)
    }

    fn encode(&self, level: usize, entry: Entry<ShortFlags>) -> u64 {
        match (level, entry) {
            (_, Entry::Invalid) => 0,
            (_, Entry::Table { next }) => (next.as_u64() & L1_TABLE_ADDRESS) | L1_TYPE_TABLE,
            (0, Entry::Block { phys, flags }) => {
                (phys.as_u64() & L1_SECTION_ADDRESS) | (flags.bits() & L1_SECTION_FLAGS) | L1_TYPE_SECTION
            }
            (_, Entry::Block { phys, flags }) => {
                (phys.as_u64() & L2_SMALL_ADDRESS) | (flags.bits() & L2_SMALL_FLAGS) | 0b10
            }
        }
    }

    fn decode(&self, level: usize, raw: u64) -> Option<Entry<ShortFlags>> {
        let raw = raw & 0xFFFF_FFFF;
        if level == 0 {
            match raw & 0b11 {
                0b00 => Some(Entry::Invalid),
                L1_TYPE_TABLE => Some(Entry::Table {
                    next: PhysAddr::new(raw & L1_TABLE_ADDRESS),
                }),
                L1_TYPE_SECTION if raw & L1_SUPERSECTION == 0 => Some(Entry::Block {
                    phys: PhysAddr::new(raw & L1_SECTION_ADDRESS),
                    flags: ShortFlags::from_bits_retain(raw & L1_SECTION_FLAGS),
                }),
                // Supersections and the PXN/reserved encoding are never written by us.
                _ => None,
            }
        } else {
            match raw & 0b11 {
                0b00 => Some(Entry::Invalid),
                // Large pages are never written by us.
                L2_TYPE_LARGE => None,
                _ => Some(Entry::Block {
                    phys: PhysAddr::new(raw & L2_SMALL_ADDRESS),
                    flags: ShortFlags::from_bits_retain(raw & L2_SMALL_FLAGS),
                }),
            }
        }
    }

    fn leaf_flags(&self, level: usize, attribute: Attribute, cache: CacheType) -> ShortFlags {
        // Built in small page format, then lifted.
        let mut page = ShortFlags::PAGE_AP0;
        let normal = match (attribute, cache) {
            (Attribute::Device, _) => {
                // Shareable device: TEX 000, C 0, B 1.
                page |= ShortFlags::BUFFERABLE;
                false
            }
            // Outer and inner write-back write-allocate: TEX 001, C 1, B 1.
            (_, CacheType::WriteBack) => {
                page |= ShortFlags::PAGE_TEX0 | ShortFlags::CACHEABLE | ShortFlags::BUFFERABLE;
                true
            }
            // Write-through, no write allocate: TEX 000, C 1, B 0.
            (_, CacheType::WriteThrough | CacheType::WriteProtected) => {
                page |= ShortFlags::CACHEABLE;
                true
            }
            // Normal non-cacheable: TEX 001, C 0, B 0.
            (_, CacheType::Uncacheable | CacheType::WriteCombining) => {
                page |= ShortFlags::PAGE_TEX0;
                true
            }
        };
        page.set(ShortFlags::PAGE_SHAREABLE, normal && attribute.is_shareable());
        page.set(ShortFlags::PAGE_AP2, attribute.is_read_only());
        page.set(ShortFlags::PAGE_XN, attribute.is_execute_never());
        if level == 0 {
            ShortFlags::from_bits_retain(page_to_section(page.bits()))
        } else {
            page
        }
    }

    fn attribute_of(&self, level: usize, flags: ShortFlags) -> Option<Attribute> {
        let page = if level == 0 {
            self.split_flags(0, flags)
        } else {
            flags
        };
        let memory = page & (ShortFlags::PAGE_TEX | ShortFlags::CACHEABLE | ShortFlags::BUFFERABLE);
        let write_back = ShortFlags::PAGE_TEX0 | ShortFlags::CACHEABLE | ShortFlags::BUFFERABLE;
        Some(if memory == write_back {
            if page.contains(ShortFlags::PAGE_AP2) {
                Attribute::WriteBackReadOnly
            } else if page.contains(ShortFlags::PAGE_XN) {
                Attribute::WriteBackExecuteNever
            } else if !page.contains(ShortFlags::PAGE_SHAREABLE) {
                Attribute::WriteBackNonShareable
            } else {
                Attribute::WriteBack
            }
        } else if memory == ShortFlags::CACHEABLE {
            Attribute::WriteThrough
        } else if memory == ShortFlags::BUFFERABLE {
            Attribute::Device
        } else if memory == ShortFlags::PAGE_TEX0 {
            Attribute::Uncached
        } else {
            return None;
        })
    }

    fn split_flags(&self, level: usize, flags: ShortFlags) -> ShortFlags {
        if level == 0 {
            ShortFlags::from_bits_retain(section_to_page(flags.bits()))
        } else {
            flags
        }
    }

    fn permission_change(&self, permission: Permission) -> Mutation<ShortFlags> {
        match permission {
            Permission::ReadOnly => Mutation::set(ShortFlags::PAGE_AP2),
            Permission::ReadWrite => Mutation::clear(ShortFlags::PAGE_AP2),
            Permission::ExecuteNever => Mutation::set(ShortFlags::PAGE_XN),
            Permission::Executable => Mutation::clear(ShortFlags::PAGE_XN),
        }
    }

    fn attribute_change(&self, attribute: Attribute) -> Mutation<ShortFlags> {
        Mutation {
            set: self.leaf_flags(1, attribute, attribute.cache_type()),
            clear: ShortFlags::from_bits_retain(L2_SMALL_FLAGS),
        }
    }

    fn translation_base(&self, root: PhysAddr) -> u64 {
        (root.as_u64() & 0xFFFF_C000) | TTBR_WALK_ATTRIBUTES
    }

    fn global_state(&self) -> ArrayVec<RegisterUpdate, MAX_REGISTER_UPDATES> {
        let mut updates = ArrayVec::new();
        updates.push(RegisterUpdate {
            register: ControlRegister::DomainAccess,
            name: "DACR",
            set: DACR_VALUE,
            clear: 0xFFFF_FFFF,
            verify: 0xFFFF_FFFF,
            frozen: 0,
        });
        // N = 0: TTBR0 covers the whole address space. Short descriptors (EAE = 0).
        updates.push(RegisterUpdate {
            register: ControlRegister::TranslationControl,
            name: "TTBCR",
            set: 0,
            clear: 0xFFFF_FFFF,
            verify: 0x8000_0007,
            frozen: 0,
        });
        updates
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPS: Capabilities = Capabilities {
        phys_addr_bits: 32,
        huge_pages: false,
        execute_disable: true,
        five_level: false,
    };

    const ARCH: ArmV7 = ArmV7::new(CAPS);

    #[test]
    fn test_geometry() {
        assert_eq!(ARCH.va_bits(), 32);
        assert_eq!(ARCH.block_size(0), 0x10_0000);
        assert_eq!(ARCH.block_size(1), 0x1000);
        assert_eq!(ARCH.entries(0), 4096);
        assert_eq!(ARCH.entries(1), 256);
        assert_eq!(ARCH.table_bytes(0), 0x4000);
        assert_eq!(ARCH.table_align(0), 0x4000);
        assert_eq!(ARCH.table_bytes(1), 0x400);
        assert_eq!(ARCH.entry_index(1, 0x0012_3000), 0x23);
    }

    #[test]
    fn test_decode() {
        assert_eq!(ARCH.decode(0, 0), Some(Entry::Invalid));
        assert_eq!(
            ARCH.decode(0, 0x8000_0401),
            Some(Entry::Table { next: PhysAddr::new(0x8000_0400) })
        );
        // Supersection and the reserved type.
        assert_eq!(ARCH.decode(0, 0x0004_0002), None);
        assert_eq!(ARCH.decode(0, 0x0000_0003), None);
        // Large page.
        assert_eq!(ARCH.decode(1, 0x0001_0001), None);
        assert_eq!(
            ARCH.decode(1, 0x0000_3033),
            Some(Entry::Block {
                phys: PhysAddr::new(0x3000),
                flags: ShortFlags::PAGE_XN | ShortFlags::PAGE_AP0 | ShortFlags::PAGE_AP,
            })
        );
    }

    #[test]
    fn test_section_encoding() {
        let flags = ARCH.leaf_flags(0, Attribute::WriteBack, CacheType::WriteBack);
        // TEX 001, C, B, AP[0], S.
        assert_eq!(flags.bits(), (1 << 12) | (1 << 3) | (1 << 2) | (1 << 10) | (1 << 16));
        let raw = ARCH.encode(0, Entry::Block { phys: PhysAddr::new(0x8010_0000), flags });
        assert_eq!(raw, 0x8010_0000 | flags.bits() | 0b10);
        assert_eq!(
            ARCH.decode(0, raw),
            Some(Entry::Block { phys: PhysAddr::new(0x8010_0000), flags })
        );
    }

    #[test]
    fn test_section_page_conversion() {
        for attr in [
            Attribute::WriteBack,
            Attribute::WriteBackReadOnly,
            Attribute::WriteBackExecuteNever,
            Attribute::Device,
            Attribute::WriteThrough,
        ] {
            let section = ARCH.leaf_flags(0, attr, attr.cache_type());
            let page = ARCH.leaf_flags(1, attr, attr.cache_type());
            assert_eq!(ARCH.split_flags(0, section), page, "Failed for {:?}", attr);
            assert_eq!(page_to_section(page.bits()), section.bits(), "Failed for {:?}", attr);
        }
    }

    #[test]
    fn test_attributes_read_back() {
        let cases = [
            (Attribute::WriteBack, Attribute::WriteBack),
            (Attribute::WriteBackNonShareable, Attribute::WriteBackNonShareable),
            (Attribute::WriteBackReadOnly, Attribute::WriteBackReadOnly),
            (Attribute::WriteBackExecuteNever, Attribute::WriteBackExecuteNever),
            (Attribute::WriteThrough, Attribute::WriteThrough),
            (Attribute::WriteCombining, Attribute::Uncached),
            (Attribute::WriteProtected, Attribute::WriteThrough),
            (Attribute::Device, Attribute::Device),
            (Attribute::Uncached, Attribute::Uncached),
        ];
        for level in [0, 1] {
            for (attr, expected) in cases {
                let flags = ARCH.leaf_flags(level, attr, attr.cache_type());
                assert_eq!(ARCH.attribute_of(level, flags), Some(expected), "Failed for {:?}", attr);
            }
        }
    }

    #[test]
    fn test_global_state() {
        let updates = ARCH.global_state();
        assert_eq!(updates[0].apply(0x5555_5555), 0b01);
        assert_eq!(updates[1].apply(0x7), 0);
        assert_eq!(ARCH.translation_base(PhysAddr::new(0x8000_4000)), 0x8000_404A);
    }
}
