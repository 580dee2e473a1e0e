//! The CP15 MMU of the running ARMv7-A processor.

use core::arch::asm;

use crate::{ControlRegister, GRANULE_SIZE, Mmu, VirtAddr, mmu::prefers_full_flush};

/// Smallest data cache line of an ARMv7-A core.
const CACHE_LINE: usize = 32;

const SCTLR_M: u32 = 1 << 0;
const SCTLR_C: u32 = 1 << 2;
const SCTLR_Z: u32 = 1 << 11;
const SCTLR_I: u32 = 1 << 12;

macro_rules! read_cp15 {
    ($crn: literal, $op1: literal, $crm: literal, $op2: literal) => {{
        let value: u32;
        // SAFETY: Reading a CP15 register has no side effects.
        unsafe {
            asm!(
                concat!("mrc p15, ", $op1, ", {}, ", $crn, ", ", $crm, ", ", $op2),
                out(reg) value,
                options(nomem, nostack, preserves_flags)
            );
        }
        value
    }};
}

macro_rules! write_cp15 {
    ($crn: literal, $op1: literal, $crm: literal, $op2: literal, $value: expr) => {
        asm!(
            concat!("mcr p15, ", $op1, ", {}, ", $crn, ", ", $crm, ", ", $op2),
            "isb",
            in(reg) $value,
            options(nostack, preserves_flags)
        )
    };
}

/// The ARMv7 MMU.
#[derive(Debug)]
pub struct ArmV7Mmu {
    _private: (),
}

impl ArmV7Mmu {
    /// Takes control of the MMU.
    ///
    /// # Safety
    /// Must run in a privileged mode, and only one `ArmV7Mmu` may exist at a time.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn sctlr(&self) -> u32 {
        read_cp15!("c1", "0", "c0", "0")
    }
}

impl Mmu for ArmV7Mmu {
    fn barrier(&mut self) {
        // SAFETY: Barriers only order memory accesses.
        unsafe { asm!("dsb", "isb", options(nostack, preserves_flags)) };
    }

    fn invalidate_range(&mut self, va: VirtAddr, len: u64) {
        if prefers_full_flush(len) {
            // SAFETY: TLBIALLIS only drops cached translations.
            unsafe { asm!("mcr p15, 0, {}, c8, c3, 0", in(reg) 0u32, options(nostack, preserves_flags)) };
        } else {
            let mut offset = 0;
            while offset < len {
                let mva = (va.as_u64() + offset) as u32 & !0xFFF;
                // SAFETY: TLBIMVAIS only drops cached translations.
                unsafe { asm!("mcr p15, 0, {}, c8, c3, 1", in(reg) mva, options(nostack, preserves_flags)) };
                offset += GRANULE_SIZE;
            }
        }
        // Branch predictor too, since it may hold targets from the old mapping.
        // SAFETY: BPIALL only drops predictions.
        unsafe {
            asm!(
                "mcr p15, 0, {}, c7, c5, 6",
                "dsb",
                "isb",
                in(reg) 0u32,
                options(nostack, preserves_flags)
            )
        };
    }

    fn invalidate_all(&mut self) {
        // SAFETY: TLBIALLIS only drops cached translations.
        unsafe {
            asm!(
                "mcr p15, 0, {}, c8, c3, 0",
                "dsb",
                "isb",
                in(reg) 0u32,
                options(nostack, preserves_flags)
            )
        };
    }

    fn clean_entry(&mut self, entry: *const u8) {
        // SAFETY: DCCMVAC writes the line back without changing its contents.
        unsafe {
            asm!(
                "mcr p15, 0, {}, c7, c10, 1",
                "dsb",
                in(reg) entry,
                options(nostack, preserves_flags)
            )
        };
    }

    fn clean_table(&mut self, table: *const u8, len: usize) {
        let mut offset = 0;
        while offset < len {
            // SAFETY: As `clean_entry`.
            unsafe {
                asm!(
                    "mcr p15, 0, {}, c7, c10, 1",
                    in(reg) table.wrapping_add(offset),
                    options(nostack, preserves_flags)
                )
            };
            offset += CACHE_LINE;
        }
        // SAFETY: Barriers only order memory accesses.
        unsafe { asm!("dsb", options(nostack, preserves_flags)) };
    }

    fn translation_base(&self) -> u64 {
        read_cp15!("c2", "0", "c0", "0") as u64
    }

    unsafe fn set_translation_base(&mut self, value: u64) {
        // SAFETY: The caller guarantees the hierarchy maps the running code.
        unsafe { write_cp15!("c2", "0", "c0", "0", value as u32) };
    }

    fn control(&self, register: ControlRegister) -> u64 {
        match register {
            ControlRegister::TranslationControl => read_cp15!("c2", "0", "c0", "2") as u64,
            ControlRegister::DomainAccess => read_cp15!("c3", "0", "c0", "0") as u64,
            ControlRegister::MemoryAttributes | ControlRegister::Extended => 0,
        }
    }

    unsafe fn set_control(&mut self, register: ControlRegister, value: u64) {
        // SAFETY: The caller guarantees the value keeps the running code mapped.
        unsafe {
            match register {
                ControlRegister::TranslationControl => write_cp15!("c2", "0", "c0", "2", value as u32),
                ControlRegister::DomainAccess => write_cp15!("c3", "0", "c0", "0", value as u32),
                ControlRegister::MemoryAttributes | ControlRegister::Extended => {}
            }
        }
    }

    fn caches_enabled(&self) -> bool {
        self.sctlr() & (SCTLR_C | SCTLR_I) == SCTLR_C | SCTLR_I
    }

    unsafe fn enable_caches(&mut self) {
        let sctlr = self.sctlr() | SCTLR_C | SCTLR_I | SCTLR_Z;
        // SAFETY: The caller keeps memory used with caches off coherent.
        unsafe { write_cp15!("c1", "0", "c0", "0", sctlr) };
    }

    fn translation_enabled(&self) -> bool {
        self.sctlr() & SCTLR_M != 0
    }

    unsafe fn enable_translation(&mut self) {
        let sctlr = self.sctlr() | SCTLR_M;
        // SAFETY: The caller guarantees TTBR0 maps the running code.
        unsafe { write_cp15!("c1", "0", "c0", "0", sctlr) };
    }
}
