//! Architecture back ends.
//!
//! Each back end describes one translation regime: its table geometry, how descriptors are
//! encoded, how an [`Attribute`] becomes descriptor bits, and what global state has to be
//! programmed before translation can be switched on. Everything here is pure, so every back end
//! builds (and is tested) on any host; only the `hw` modules touch registers.

use core::fmt::Debug;

use arrayvec::ArrayVec;
use bitflags::Flags;

use crate::{
    Attribute, CacheType, GRANULE_SHIFT, PhysAddr,
    mmu::ControlRegister,
    paging::{Entry, Mutation, Permission},
};

#[cfg(feature = "aarch64")]
pub mod aarch64;
#[cfg(feature = "arm")]
pub mod arm;
#[cfg(feature = "x86_64")]
pub mod x86_64;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "x86_64", target_arch = "x86_64"))] {
        /// The regime of the compilation target.
        pub type Native = x86_64::X86_64;
        /// The MMU of the compilation target.
        pub type NativeMmu = x86_64::hw::X86Mmu;
    } else if #[cfg(all(feature = "aarch64", target_arch = "aarch64"))] {
        /// The regime of the compilation target.
        pub type Native = aarch64::Aarch64;
        /// The MMU of the compilation target.
        pub type NativeMmu = aarch64::hw::Aarch64Mmu;
    } else if #[cfg(all(feature = "arm", target_arch = "arm"))] {
        /// The regime of the compilation target.
        pub type Native = arm::ArmV7;
        /// The MMU of the compilation target.
        pub type NativeMmu = arm::hw::ArmV7Mmu;
    }
}

/// Upper bound on the register updates an architecture needs for activation.
pub const MAX_REGISTER_UPDATES: usize = 4;

/// A read-modify-write of one control register: `(old & !clear) | set`.
///
/// After the write, `(read_back & verify)` must equal `(new & verify)`; anything else means the
/// hardware clamped the value and the configuration is unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterUpdate {
    /// The register to update.
    pub register: ControlRegister,
    /// Architectural name, for diagnostics.
    pub name: &'static str,
    /// Bits to set.
    pub set: u64,
    /// Bits to clear before setting.
    pub clear: u64,
    /// Bits that have to read back exactly as written.
    pub verify: u64,
    /// Bits the hardware refuses to change while translation is on.
    pub frozen: u64,
}

impl RegisterUpdate {
    /// The value to write given the current contents.
    pub const fn apply(&self, old: u64) -> u64 {
        (old & !self.clear) | self.set
    }

    /// Returns true if applying the update to `old` would change a frozen bit.
    pub const fn changes_frozen(&self, old: u64) -> bool {
        (self.apply(old) ^ old) & self.frozen != 0
    }
}

/// A translation regime.
///
/// Levels are numbered from the root (`0`) to the deepest level (`levels() - 1`). Tables below
/// the root must fit in a single granule.
pub trait Architecture {
    /// Descriptor attribute bits, without the address and type fields.
    type Flags: Flags<Bits = u64> + Copy + Debug + PartialEq;

    /// Human readable regime name.
    const NAME: &'static str;
    /// Size of one descriptor in bytes.
    const ENTRY_BYTES: usize;
    /// Name of the translation base register.
    const BASE_REGISTER: &'static str;
    /// Invalidate after every descriptor write, even while the hierarchy isn't live yet.
    const INVALIDATE_OFFLINE: bool = false;
    /// The translation base and global state may be replaced while translation is on.
    ///
    /// Otherwise the regime's global state also describes the live tables (memory attribute
    /// indices, input size), and a new hierarchy can only be installed with translation off.
    const RETARGET_WHILE_ENABLED: bool = false;

    /// Number of table levels.
    fn levels(&self) -> usize;
    /// Number of virtual address bits indexing a table at `level`.
    fn index_bits(&self, level: usize) -> u32;
    /// Whether a block descriptor may be placed at `level`. The deepest level always maps pages
    /// and isn't asked.
    fn block_allowed(&self, level: usize) -> bool;
    /// Width of physical addresses this configuration can express.
    fn phys_bits(&self) -> u32;

    /// Size of a table at `level` in bytes.
    fn table_bytes(&self, level: usize) -> u64 {
        (self.entries(level) * Self::ENTRY_BYTES) as u64
    }

    /// Required alignment of a table at `level`.
    fn table_align(&self, level: usize) -> u64 {
        self.table_bytes(level).max(crate::GRANULE_SIZE)
    }

    /// The deepest level.
    fn deepest(&self) -> usize {
        self.levels() - 1
    }

    /// log2 of the span one entry at `level` covers.
    fn block_shift(&self, level: usize) -> u32 {
        GRANULE_SHIFT
            + (level + 1..self.levels())
                .map(|l| self.index_bits(l))
                .sum::<u32>()
    }

    /// Span one entry at `level` covers, in bytes.
    fn block_size(&self, level: usize) -> u64 {
        1 << self.block_shift(level)
    }

    /// Entries in a table at `level`.
    fn entries(&self, level: usize) -> usize {
        1 << self.index_bits(level)
    }

    /// Index of the entry covering `va` in a table at `level`.
    fn entry_index(&self, level: usize, va: u64) -> usize {
        ((va >> self.block_shift(level)) as usize) & (self.entries(level) - 1)
    }

    /// Width of the input address space.
    fn va_bits(&self) -> u32 {
        self.block_shift(0) + self.index_bits(0)
    }

    /// Encodes a descriptor for a table at `level`.
    fn encode(&self, level: usize, entry: Entry<Self::Flags>) -> u64;

    /// Decodes a raw descriptor read from a table at `level`.
    ///
    /// Returns `None` for encodings this regime never produces.
    fn decode(&self, level: usize, raw: u64) -> Option<Entry<Self::Flags>>;

    /// Leaf attribute bits at `level`: permissions from `attribute`, caching from `cache`.
    fn leaf_flags(&self, level: usize, attribute: Attribute, cache: CacheType) -> Self::Flags;

    /// The attribute a leaf at `level` carrying `flags` maps with, if it is one we produce.
    fn attribute_of(&self, level: usize, flags: Self::Flags) -> Option<Attribute>;

    /// What `attribute` reads back as once written, since not every regime can tell all the
    /// attributes apart.
    fn canonical(&self, attribute: Attribute) -> Option<Attribute> {
        let deepest = self.deepest();
        self.attribute_of(
            deepest,
            self.leaf_flags(deepest, attribute, attribute.cache_type()),
        )
    }

    /// Converts the flags of a block at `level` to those of the entries that replace it one
    /// level down.
    fn split_flags(&self, level: usize, flags: Self::Flags) -> Self::Flags;

    /// The flag change that applies `permission`, in deepest-level format.
    fn permission_change(&self, permission: Permission) -> Mutation<Self::Flags>;

    /// The flag change that remaps a leaf with `attribute`, in deepest-level format.
    fn attribute_change(&self, attribute: Attribute) -> Mutation<Self::Flags> {
        Mutation {
            set: self.leaf_flags(self.deepest(), attribute, attribute.cache_type()),
            clear: Self::Flags::all(),
        }
    }

    /// Value of the translation base register for a hierarchy rooted at `root`.
    fn translation_base(&self, root: PhysAddr) -> u64;

    /// Register updates that have to be in place before translation is enabled.
    fn global_state(&self) -> ArrayVec<RegisterUpdate, MAX_REGISTER_UPDATES>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_update_apply() {
        let update = RegisterUpdate {
            register: ControlRegister::TranslationControl,
            name: "TCR",
            set: 0x10,
            clear: 0x3F,
            verify: 0x3F,
            frozen: 0,
        };
        assert_eq!(update.apply(0xFF19), 0xFF10);
        assert!(!update.changes_frozen(0xFF19));
    }

    #[test]
    fn test_frozen_bits() {
        let update = RegisterUpdate {
            register: ControlRegister::TranslationControl,
            name: "CR4",
            set: 0x20,
            clear: 0x1000,
            verify: 0x1020,
            frozen: 0x1000,
        };
        assert!(!update.changes_frozen(0x20));
        assert!(!update.changes_frozen(0));
        assert!(update.changes_frozen(0x1020));
    }
}
