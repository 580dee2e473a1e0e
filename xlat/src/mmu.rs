//! The MMU control surface the builder and activation drive.
//!
//! Real implementations live next to their architecture (`arch::*::hw`), and only build for the
//! matching target.

use crate::{GRANULE_SIZE, VirtAddr};

/// Pages past which hardware back ends flush the whole TLB instead of walking a range.
pub const RANGE_INVALIDATE_PAGES: u64 = 256;

/// Returns true if invalidating `len` bytes page by page costs more than one full flush.
///
/// Splitting or linking a table high up in the hierarchy invalidates its whole span, which can
/// be hundreds of gigabytes.
pub const fn prefers_full_flush(len: u64) -> bool {
    len > RANGE_INVALIDATE_PAGES * GRANULE_SIZE
}

/// The architecture control registers activation programs.
///
/// Each back end maps these onto its own registers; a register an architecture doesn't have reads
/// as zero and ignores writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlRegister {
    /// Table format and depth: CR4 on x86_64, TCR_EL1 on aarch64, TTBCR on ARMv7.
    TranslationControl,
    /// Memory attribute indirection: the PAT MSR on x86_64, MAIR_EL1 on aarch64.
    MemoryAttributes,
    /// Domain access control (DACR), ARMv7 only.
    DomainAccess,
    /// Extended feature enables: EFER on x86_64.
    Extended,
}

impl ControlRegister {
    /// Every register, in a stable order.
    pub const ALL: [ControlRegister; 4] = [
        ControlRegister::TranslationControl,
        ControlRegister::MemoryAttributes,
        ControlRegister::DomainAccess,
        ControlRegister::Extended,
    ];

    /// Position of this register in [`ControlRegister::ALL`].
    pub const fn index(self) -> usize {
        match self {
            ControlRegister::TranslationControl => 0,
            ControlRegister::MemoryAttributes => 1,
            ControlRegister::DomainAccess => 2,
            ControlRegister::Extended => 3,
        }
    }
}

/// Barriers, TLB maintenance and the registers that control translation.
pub trait Mmu {
    /// Full memory and instruction ordering barrier.
    fn barrier(&mut self);

    /// Drops any cached translations for `[va, va + len)`.
    fn invalidate_range(&mut self, va: VirtAddr, len: u64);

    /// Drops every cached translation.
    fn invalidate_all(&mut self);

    /// Makes a freshly written descriptor visible to a table walker that doesn't snoop the data
    /// cache. Most architectures don't need this.
    fn clean_entry(&mut self, _entry: *const u8) {}

    /// As [`Mmu::clean_entry`], for a whole table of `len` bytes written before it was linked.
    fn clean_table(&mut self, _table: *const u8, _len: usize) {}

    /// Current value of the translation base register.
    fn translation_base(&self) -> u64;

    /// Writes the translation base register.
    ///
    /// # Safety
    /// If translation is enabled, `value` must point at a table hierarchy that maps the running
    /// code.
    unsafe fn set_translation_base(&mut self, value: u64);

    /// Reads a control register.
    fn control(&self, register: ControlRegister) -> u64;

    /// Writes a control register.
    ///
    /// # Safety
    /// The new value must keep the running code mapped and executable.
    unsafe fn set_control(&mut self, register: ControlRegister, value: u64);

    /// Returns true if instruction and data caching are both on.
    fn caches_enabled(&self) -> bool;

    /// Turns instruction and data caching on.
    ///
    /// # Safety
    /// Any memory used with caches off must have been kept coherent by the caller.
    unsafe fn enable_caches(&mut self);

    /// Returns true if address translation is on.
    fn translation_enabled(&self) -> bool;

    /// Turns address translation on.
    ///
    /// # Safety
    /// The installed hierarchy must map the running code, or execution faults immediately.
    unsafe fn enable_translation(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_large_ranges_flush_everything() {
        assert!(!prefers_full_flush(GRANULE_SIZE));
        assert!(!prefers_full_flush(0x10_0000));
        // A single 2MiB block already crosses over, let alone a level 0 slot.
        assert!(prefers_full_flush(0x20_0000));
        assert!(prefers_full_flush(1 << 39));
    }
}
