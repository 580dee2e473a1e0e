//! The EL1 MMU of the running aarch64 processor.

use core::arch::asm;

use crate::{ControlRegister, GRANULE_SIZE, Mmu, VirtAddr, mmu::prefers_full_flush};

const SCTLR_M: u64 = 1 << 0;
const SCTLR_C: u64 = 1 << 2;
const SCTLR_I: u64 = 1 << 12;

macro_rules! read_sysreg {
    ($reg: literal) => {{
        let value: u64;
        // SAFETY: Reading an EL1 system register has no side effects.
        unsafe {
            asm!(concat!("mrs {}, ", $reg), out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value
    }};
}

macro_rules! write_sysreg {
    ($reg: literal, $value: expr) => {
        asm!(
            concat!("msr ", $reg, ", {}"),
            "isb",
            in(reg) $value,
            options(nostack, preserves_flags)
        )
    };
}

/// The EL1 MMU.
#[derive(Debug)]
pub struct Aarch64Mmu {
    _private: (),
}

impl Aarch64Mmu {
    /// Takes control of the MMU.
    ///
    /// # Safety
    /// Must run at EL1, and only one `Aarch64Mmu` may exist at a time.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }
}

impl Mmu for Aarch64Mmu {
    fn barrier(&mut self) {
        // SAFETY: Barriers only order memory accesses.
        unsafe { asm!("dsb sy", "isb", options(nostack, preserves_flags)) };
    }

    fn invalidate_range(&mut self, va: VirtAddr, len: u64) {
        if prefers_full_flush(len) {
            self.invalidate_all();
            return;
        }
        // SAFETY: TLB maintenance by VA only drops cached translations.
        unsafe { asm!("dsb ishst", options(nostack, preserves_flags)) };
        let mut offset = 0;
        while offset < len {
            let page = (va.as_u64() + offset) >> 12;
            // SAFETY: As above.
            unsafe { asm!("tlbi vaae1is, {}", in(reg) page, options(nostack, preserves_flags)) };
            offset += GRANULE_SIZE;
        }
        // SAFETY: As above.
        unsafe { asm!("dsb ish", "isb", options(nostack, preserves_flags)) };
    }

    fn invalidate_all(&mut self) {
        // SAFETY: Dropping every EL1 translation is always allowed.
        unsafe {
            asm!(
                "dsb ishst",
                "tlbi vmalle1is",
                "dsb ish",
                "isb",
                options(nostack, preserves_flags)
            )
        };
    }

    fn translation_base(&self) -> u64 {
        read_sysreg!("ttbr0_el1")
    }

    unsafe fn set_translation_base(&mut self, value: u64) {
        // SAFETY: The caller guarantees the hierarchy maps the running code.
        unsafe { write_sysreg!("ttbr0_el1", value) };
    }

    fn control(&self, register: ControlRegister) -> u64 {
        match register {
            ControlRegister::TranslationControl => read_sysreg!("tcr_el1"),
            ControlRegister::MemoryAttributes => read_sysreg!("mair_el1"),
            ControlRegister::DomainAccess | ControlRegister::Extended => 0,
        }
    }

    unsafe fn set_control(&mut self, register: ControlRegister, value: u64) {
        // SAFETY: The caller guarantees the value keeps the running code mapped.
        unsafe {
            match register {
                ControlRegister::TranslationControl => write_sysreg!("tcr_el1", value),
                ControlRegister::MemoryAttributes => write_sysreg!("mair_el1", value),
                ControlRegister::DomainAccess | ControlRegister::Extended => {}
            }
        }
    }

    fn caches_enabled(&self) -> bool {
        read_sysreg!("sctlr_el1") & (SCTLR_C | SCTLR_I) == SCTLR_C | SCTLR_I
    }

    unsafe fn enable_caches(&mut self) {
        let sctlr = read_sysreg!("sctlr_el1") | SCTLR_C | SCTLR_I;
        // SAFETY: The caller keeps memory used with caches off coherent.
        unsafe { write_sysreg!("sctlr_el1", sctlr) };
    }

    fn translation_enabled(&self) -> bool {
        read_sysreg!("sctlr_el1") & SCTLR_M != 0
    }

    unsafe fn enable_translation(&mut self) {
        let sctlr = read_sysreg!("sctlr_el1") | SCTLR_M;
        // SAFETY: The caller guarantees TTBR0_EL1 maps the running code.
        unsafe { write_sysreg!("sctlr_el1", sctlr) };
    }
}
