//! Memory type range registers.
//!
//! The MTRRs decide the cache type of physical memory independently of the page tables; the
//! effective type of a mapping is the stricter of the two. [`MtrrSnapshot`] captures them once so
//! the builder can avoid committing a large page across a type boundary.

use arrayvec::ArrayVec;

use crate::{Attribute, AttributeResolver, CacheType, PhysAddr};

/// IA32_MTRRCAP.
pub const MTRR_CAP_MSR: u32 = 0xFE;
/// IA32_MTRR_DEF_TYPE.
pub const MTRR_DEF_TYPE_MSR: u32 = 0x2FF;
/// IA32_MTRR_PHYSBASE0; PHYSMASKn follows each PHYSBASEn.
pub const MTRR_PHYS_BASE0_MSR: u32 = 0x200;
/// The fixed range MSRs, in address order.
pub const FIXED_MTRR_MSRS: [u32; FIXED_MTRR_COUNT] = [
    0x250, 0x258, 0x259, 0x268, 0x269, 0x26A, 0x26B, 0x26C, 0x26D, 0x26E, 0x26F,
];
/// Number of fixed range MSRs.
pub const FIXED_MTRR_COUNT: usize = 11;
/// The most variable ranges we keep track of.
pub const MAX_VARIABLE_MTRRS: usize = 32;

const DEF_TYPE_ENABLE: u64 = 1 << 11;
const DEF_TYPE_FIXED_ENABLE: u64 = 1 << 10;
const CAP_FIXED: u64 = 1 << 8;
const PHYS_MASK_VALID: u64 = 1 << 11;
const RANGE_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
const FIXED_RANGE_END: u64 = 0x10_0000;

/// One variable range, as the PHYSBASE/PHYSMASK pair reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariableMtrr {
    /// PHYSBASE: base address and type.
    pub base: u64,
    /// PHYSMASK: address mask and valid bit.
    pub mask: u64,
}

impl VariableMtrr {
    /// Returns true if the valid bit is set.
    pub const fn is_valid(&self) -> bool {
        self.mask & PHYS_MASK_VALID != 0
    }

    /// The memory type of the range.
    pub const fn memory_type(&self) -> CacheType {
        CacheType::from_x86(self.base as u8)
    }

    /// Returns true if the range covers `address`.
    pub const fn contains(&self, address: u64) -> bool {
        let mask = self.mask & RANGE_ADDRESS_MASK;
        address & mask == self.base & mask
    }
}

/// A point-in-time copy of the MTRRs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtrrSnapshot {
    enabled: bool,
    fixed_enabled: bool,
    default_type: CacheType,
    fixed: [u64; FIXED_MTRR_COUNT],
    variable: ArrayVec<VariableMtrr, MAX_VARIABLE_MTRRS>,
}

impl MtrrSnapshot {
    /// A snapshot with the MTRRs turned off, which makes everything uncached.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            fixed_enabled: false,
            default_type: CacheType::Uncacheable,
            fixed: [0; FIXED_MTRR_COUNT],
            variable: ArrayVec::new(),
        }
    }

    /// Builds a snapshot from raw register contents.
    ///
    /// Ranges beyond [`MAX_VARIABLE_MTRRS`] are dropped with a warning.
    pub fn from_registers(
        def_type: u64,
        fixed: [u64; FIXED_MTRR_COUNT],
        variable: impl IntoIterator<Item = VariableMtrr>,
    ) -> Self {
        let mut ranges = ArrayVec::new();
        for range in variable {
            if ranges.try_push(range).is_err() {
                log::warn!("MTRR: more than {} variable ranges, ignoring the rest", MAX_VARIABLE_MTRRS);
                break;
            }
        }
        Self {
            enabled: def_type & DEF_TYPE_ENABLE != 0,
            fixed_enabled: def_type & DEF_TYPE_FIXED_ENABLE != 0,
            default_type: CacheType::from_x86(def_type as u8),
            fixed,
            variable: ranges,
        }
    }

    /// Reads the MTRRs of the current processor.
    ///
    /// # Safety
    /// Must run at CPL 0.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn read() -> Self {
        use x86_64::registers::model_specific::Msr;

        let has_mtrr = raw_cpuid::CpuId::with_cpuid_reader(raw_cpuid::CpuIdReaderNative)
            .get_feature_info()
            .is_some_and(|info| info.has_mtrr());
        if !has_mtrr {
            return Self::disabled();
        }

        // SAFETY: MTRRs are architectural once CPUID reports them, and the caller runs at CPL 0.
        let (cap, def_type) = unsafe {
            (
                Msr::new(MTRR_CAP_MSR).read(),
                Msr::new(MTRR_DEF_TYPE_MSR).read(),
            )
        };
        let mut fixed = [0; FIXED_MTRR_COUNT];
        if cap & CAP_FIXED != 0 {
            for (value, msr) in fixed.iter_mut().zip(FIXED_MTRR_MSRS) {
                // SAFETY: MTRRCAP.FIX says the fixed range MSRs exist.
                *value = unsafe { Msr::new(msr).read() };
            }
        }
        let count = (cap & 0xFF) as u32;
        let variable = (0..count).map(|n| {
            let base = MTRR_PHYS_BASE0_MSR + 2 * n;
            // SAFETY: MTRRCAP.VCNT says this pair exists.
            unsafe {
                VariableMtrr {
                    base: Msr::new(base).read(),
                    mask: Msr::new(base + 1).read(),
                }
            }
        });
        let snapshot = Self::from_registers(def_type, fixed, variable);
        log::debug!(
            "MTRR: enabled={} fixed={} default={:?} variable ranges={}",
            snapshot.enabled,
            snapshot.fixed_enabled,
            snapshot.default_type,
            snapshot.variable.len()
        );
        snapshot
    }

    /// The memory type the MTRRs assign to `address`.
    pub fn memory_type(&self, address: PhysAddr) -> CacheType {
        if !self.enabled {
            return CacheType::Uncacheable;
        }
        let address = address.as_u64();
        if self.fixed_enabled && address < FIXED_RANGE_END {
            return self.fixed_type(address);
        }

        let mut found: Option<CacheType> = None;
        for range in self.variable.iter().filter(|r| r.is_valid() && r.contains(address)) {
            let current = range.memory_type();
            found = Some(match (found, current) {
                (_, CacheType::Uncacheable) => return CacheType::Uncacheable,
                (Some(CacheType::WriteThrough), CacheType::WriteBack)
                | (Some(CacheType::WriteBack), CacheType::WriteThrough) => CacheType::WriteThrough,
                // Anything else overlapping is undefined; the last one wins.
                _ => current,
            });
        }
        found.unwrap_or(self.default_type)
    }

    fn fixed_type(&self, address: u64) -> CacheType {
        let (msr, slot) = match address {
            // 8 x 64KiB
            0..0x8_0000 => (0, address >> 16),
            // 2 MSRs of 8 x 16KiB
            0x8_0000..0xC_0000 => {
                let offset = address - 0x8_0000;
                (1 + (offset >> 17) as usize, (offset >> 14) & 7)
            }
            // 8 MSRs of 8 x 4KiB
            _ => {
                let offset = address - 0xC_0000;
                (3 + (offset >> 15) as usize, (offset >> 12) & 7)
            }
        };
        CacheType::from_x86((self.fixed[msr] >> (slot * 8)) as u8)
    }
}

impl AttributeResolver for MtrrSnapshot {
    fn resolve(&self, address: PhysAddr) -> Attribute {
        self.memory_type(address).attribute()
    }
}
