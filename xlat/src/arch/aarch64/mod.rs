//! VMSAv8-64 stage 1 translation with a 4KiB granule.

#[cfg(target_arch = "aarch64")]
pub mod hw;

use arrayvec::ArrayVec;
use bitflags::bitflags;

use super::{Architecture, MAX_REGISTER_UPDATES, RegisterUpdate};
use crate::{
    Attribute, CacheType, Capabilities, GRANULE_SHIFT, PhysAddr, XlatError,
    error::XlatResult,
    mmu::ControlRegister,
    paging::{Entry, Mutation, Permission},
};

/// Output address bits 47:12 of a descriptor.
pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;
/// Smallest input address space a 4KiB granule can describe (T0SZ = 39).
pub const MIN_VA_BITS: u32 = 25;
/// Largest input address space without LPA2 (T0SZ = 16).
pub const MAX_VA_BITS: u32 = 48;

/// MAIR_EL1 as programmed on activation; the index is the descriptor's AttrIndx.
pub const MAIR_VALUE: u64 = (MAIR_WRITE_BACK << 24)
    | (MAIR_WRITE_THROUGH << 16)
    | (MAIR_NON_CACHEABLE << 8)
    | MAIR_DEVICE;
const MAIR_DEVICE: u64 = 0x00;
const MAIR_NON_CACHEABLE: u64 = 0x44;
const MAIR_WRITE_THROUGH: u64 = 0xBB;
const MAIR_WRITE_BACK: u64 = 0xFF;

const ATTR_DEVICE: u64 = 0;
const ATTR_NON_CACHEABLE: u64 = 1;
const ATTR_WRITE_THROUGH: u64 = 2;
const ATTR_WRITE_BACK: u64 = 3;

const DESC_VALID: u64 = 1 << 0;
const DESC_TABLE: u64 = 0b11;
const DESC_BLOCK: u64 = 0b01;
const DESC_PAGE: u64 = 0b11;

const TCR_T0SZ_MASK: u64 = 0x3F;
const TCR_IRGN0_WBWA: u64 = 0b01 << 8;
const TCR_ORGN0_WBWA: u64 = 0b01 << 10;
const TCR_SH0_INNER: u64 = 0b11 << 12;
const TCR_TG0_4K: u64 = 0b00 << 14;
const TCR_EPD1: u64 = 1 << 23;
const TCR_IPS_SHIFT: u64 = 32;
const TCR_MASK: u64 = TCR_T0SZ_MASK
    | (0b11 << 8)
    | (0b11 << 10)
    | (0b11 << 12)
    | (0b11 << 14)
    | TCR_EPD1
    | (0b111 << TCR_IPS_SHIFT);

bitflags! {
    /// Lower and upper attributes of block and page descriptors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct DescriptorFlags: u64 {
        /// MAIR index, 3 bits.
        const ATTR_INDEX = 0b111 << 2;
        /// Output address is in the non-secure state.
        const NON_SECURE = 1 << 5;
        /// Accessible from EL0.
        const AP_EL0 = 1 << 6;
        /// Read only.
        const AP_READ_ONLY = 1 << 7;
        /// Outer shareable.
        const OUTER_SHAREABLE = 0b10 << 8;
        /// Inner shareable.
        const INNER_SHAREABLE = 0b11 << 8;
        /// Access flag. A clear flag faults on first access.
        const ACCESSED = 1 << 10;
        /// Not global: tagged with the current ASID.
        const NOT_GLOBAL = 1 << 11;
        /// Part of a contiguous run of descriptors.
        const CONTIGUOUS = 1 << 52;
        /// Privileged execute never.
        const PXN = 1 << 53;
        /// Unprivileged execute never.
        const UXN = 1 << 54;
    }
}

impl DescriptorFlags {
    const EXECUTE_NEVER: Self = Self::PXN.union(Self::UXN);

    fn with_attr_index(self, index: u64) -> Self {
        (self - Self::ATTR_INDEX) | Self::from_bits_retain(index << 2)
    }

    fn attr_index(self) -> u64 {
        (self & Self::ATTR_INDEX).bits() >> 2
    }
}

/// aarch64 configuration: an input address space of `va_bits` bits through TTBR0_EL1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aarch64 {
    va_bits: u32,
    caps: Capabilities,
}

impl Aarch64 {
    /// Configuration for a `va_bits` wide input address space.
    pub fn new(va_bits: u32, caps: Capabilities) -> XlatResult<Self> {
        if !(MIN_VA_BITS..=MAX_VA_BITS).contains(&va_bits) {
            return Err(XlatError::InvalidParameter("aarch64 input address size out of range"));
        }
        Ok(Self { va_bits, caps })
    }

    /// The usual descending ladder: 48 bit (4 levels), then 39 bit (3 levels).
    pub fn ladder(caps: Capabilities) -> [Self; 2] {
        [Self { va_bits: 48, caps }, Self { va_bits: 39, caps }]
    }

    /// The architectural level (0..=3) of table `level`.
    fn hw_level(&self, level: usize) -> usize {
        4 - self.levels() + level
    }

    fn ips(&self) -> u64 {
        match self.phys_bits() {
            52.. => 6,
            48..52 => 5,
            44..48 => 4,
            42..44 => 3,
            40..42 => 2,
            36..40 => 1,
            _ => 0,
        }
    }
}

impl Architecture for Aarch64 {
    type Flags = DescriptorFlags;

    const NAME: &'static str = "aarch64";
    const ENTRY_BYTES: usize = 8;
    const BASE_REGISTER: &'static str = "TTBR0_EL1";

    fn levels(&self) -> usize {
        (self.va_bits - GRANULE_SHIFT).div_ceil(9) as usize
    }

    fn index_bits(&self, level: usize) -> u32 {
        if level == 0 {
            // The root takes whatever is left over.
            self.va_bits - GRANULE_SHIFT - 9 * (self.levels() as u32 - 1)
        } else {
            9
        }
    }

    fn block_allowed(&self, level: usize) -> bool {
        matches!(self.hw_level(level), 1 | 2)
    }

    fn phys_bits(&self) -> u32 {
        (self.caps.phys_addr_bits as u32).min(48)
    }

    fn encode(&self, level: usize, entry: Entry<DescriptorFlags>) -> u64 {
        match entry {
            Entry::Invalid => 0,
            Entry::Table { next } => (next.as_u64() & ADDRESS_MASK) | DESC_TABLE,
            Entry::Block { phys, flags } => {
                let kind = if level == self.deepest() {
                    DESC_PAGE
                } else {
                    DESC_BLOCK
                };
                (phys.as_u64() & ADDRESS_MASK) | flags.bits() | kind
            }
        }
    }

    fn decode(&self, level: usize, raw: u64) -> Option<Entry<DescriptorFlags>> {
        if raw & DESC_VALID == 0 {
            return Some(Entry::Invalid);
        }
        let address = raw & ADDRESS_MASK;
        let flags = DescriptorFlags::from_bits_truncate(raw);
        match (raw & 0b11, level == self.deepest()) {
            (DESC_PAGE, true) => Some(Entry::Block {
                phys: PhysAddr::new(address),
                flags,
            }),
            (DESC_TABLE, false) => Some(Entry::Table {
                next: PhysAddr::new(address),
            }),
            (DESC_BLOCK, false) if self.block_allowed(level) => Some(Entry::Block {
                phys: PhysAddr::new(address & !(self.block_size(level) - 1)),
                flags,
            }),
            // Reserved at level 3, or a block where the granule doesn't allow one.
            _ => None,
        }
    }

    fn leaf_flags(&self, _level: usize, attribute: Attribute, cache: CacheType) -> DescriptorFlags {
        let index = match (attribute, cache) {
            (Attribute::Device, _) => ATTR_DEVICE,
            (_, CacheType::Uncacheable | CacheType::WriteCombining) => ATTR_NON_CACHEABLE,
            (_, CacheType::WriteThrough | CacheType::WriteProtected) => ATTR_WRITE_THROUGH,
            (_, CacheType::WriteBack) => ATTR_WRITE_BACK,
        };
        let mut flags = DescriptorFlags::ACCESSED.with_attr_index(index);
        if index != ATTR_DEVICE && attribute.is_shareable() {
            flags |= DescriptorFlags::INNER_SHAREABLE;
        }
        flags.set(DescriptorFlags::AP_READ_ONLY, attribute.is_read_only());
        flags.set(DescriptorFlags::EXECUTE_NEVER, attribute.is_execute_never());
        flags
    }

    fn attribute_of(&self, _level: usize, flags: DescriptorFlags) -> Option<Attribute> {
        Some(match flags.attr_index() {
            ATTR_DEVICE => Attribute::Device,
            ATTR_NON_CACHEABLE => Attribute::Uncached,
            ATTR_WRITE_THROUGH => Attribute::WriteThrough,
            ATTR_WRITE_BACK if flags.contains(DescriptorFlags::AP_READ_ONLY) => {
                Attribute::WriteBackReadOnly
            }
            ATTR_WRITE_BACK if flags.intersects(DescriptorFlags::EXECUTE_NEVER) => {
                Attribute::WriteBackExecuteNever
            }
            ATTR_WRITE_BACK if !flags.contains(DescriptorFlags::INNER_SHAREABLE) => {
                Attribute::WriteBackNonShareable
            }
            ATTR_WRITE_BACK => Attribute::WriteBack,
            _ => return None,
        })
    }

    fn split_flags(&self, _level: usize, flags: DescriptorFlags) -> DescriptorFlags {
        // Blocks and pages share a layout; a contiguous hint doesn't survive a split.
        flags - DescriptorFlags::CONTIGUOUS
    }

    fn permission_change(&self, permission: Permission) -> Mutation<DescriptorFlags> {
        match permission {
            Permission::ReadOnly => Mutation::set(DescriptorFlags::AP_READ_ONLY),
            Permission::ReadWrite => Mutation::clear(DescriptorFlags::AP_READ_ONLY),
            Permission::ExecuteNever => Mutation::set(DescriptorFlags::EXECUTE_NEVER),
            Permission::Executable => Mutation::clear(DescriptorFlags::EXECUTE_NEVER),
        }
    }

    fn translation_base(&self, root: PhysAddr) -> u64 {
        // ASID 0, CnP clear.
        root.as_u64() & ADDRESS_MASK
    }

    fn global_state(&self) -> ArrayVec<RegisterUpdate, MAX_REGISTER_UPDATES> {
        let mut updates = ArrayVec::new();
        updates.push(RegisterUpdate {
            register: ControlRegister::MemoryAttributes,
            name: "MAIR_EL1",
            set: MAIR_VALUE,
            clear: u64::MAX,
            verify: u64::MAX,
            frozen: 0,
        });
        let t0sz = 64 - self.va_bits as u64;
        updates.push(RegisterUpdate {
            register: ControlRegister::TranslationControl,
            name: "TCR_EL1",
            set: t0sz
                | TCR_IRGN0_WBWA
                | TCR_ORGN0_WBWA
                | TCR_SH0_INNER
                | TCR_TG0_4K
                | TCR_EPD1
                | (self.ips() << TCR_IPS_SHIFT),
            clear: TCR_MASK,
            verify: TCR_T0SZ_MASK,
            frozen: 0,
        });
        updates
    }
}
