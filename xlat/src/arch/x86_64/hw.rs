//! The x86_64 MMU, through the `x86_64` crate.

use core::sync::atomic::{Ordering, fence};

use x86_64::{
    instructions::tlb,
    registers::{
        control::{Cr0, Cr0Flags, Cr3, Cr4},
        model_specific::{Efer, Msr},
    },
    structures::paging::PhysFrame,
};

use super::mtrr::MtrrSnapshot;
use crate::{ControlRegister, Mmu, VirtAddr};

/// IA32_PAT.
const PAT_MSR: u32 = 0x277;

/// The MMU of the running x86_64 processor.
#[derive(Debug)]
pub struct X86Mmu {
    _private: (),
}

impl X86Mmu {
    /// Takes control of the MMU.
    ///
    /// # Safety
    /// Must run at CPL 0, and only one `X86Mmu` may exist at a time.
    pub unsafe fn new() -> Self {
        Self { _private: () }
    }

    /// Snapshots the MTRRs, for use as the builder's attribute resolver.
    pub fn mtrrs(&self) -> MtrrSnapshot {
        // SAFETY: Holding an `X86Mmu` means we are at CPL 0.
        unsafe { MtrrSnapshot::read() }
    }
}

impl Mmu for X86Mmu {
    fn barrier(&mut self) {
        fence(Ordering::SeqCst);
    }

    fn invalidate_range(&mut self, va: VirtAddr, len: u64) {
        if crate::mmu::prefers_full_flush(len) {
            self.invalidate_all();
            return;
        }
        let mut offset = 0;
        while offset < len {
            tlb::flush(x86_64::VirtAddr::new_truncate(va.as_u64() + offset));
            offset += crate::GRANULE_SIZE;
        }
    }

    fn invalidate_all(&mut self) {
        tlb::flush_all();
    }

    fn translation_base(&self) -> u64 {
        let (frame, flags) = Cr3::read_raw();
        frame.start_address().as_u64() | flags as u64
    }

    unsafe fn set_translation_base(&mut self, value: u64) {
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new_truncate(value));
        // SAFETY: The caller guarantees the new hierarchy maps the running code.
        unsafe { Cr3::write_raw(frame, (value & 0xFFF) as u16) };
    }

    fn control(&self, register: ControlRegister) -> u64 {
        match register {
            ControlRegister::TranslationControl => Cr4::read_raw(),
            // SAFETY: IA32_PAT exists on every long mode capable processor.
            ControlRegister::MemoryAttributes => unsafe { Msr::new(PAT_MSR).read() },
            ControlRegister::Extended => Efer::read_raw(),
            ControlRegister::DomainAccess => 0,
        }
    }

    unsafe fn set_control(&mut self, register: ControlRegister, value: u64) {
        // SAFETY: The caller guarantees the value keeps the running code mapped.
        unsafe {
            match register {
                ControlRegister::TranslationControl => Cr4::write_raw(value),
                ControlRegister::MemoryAttributes => Msr::new(PAT_MSR).write(value),
                ControlRegister::Extended => Efer::write_raw(value),
                ControlRegister::DomainAccess => {}
            }
        }
    }

    fn caches_enabled(&self) -> bool {
        !Cr0::read().intersects(Cr0Flags::CACHE_DISABLE | Cr0Flags::NOT_WRITE_THROUGH)
    }

    unsafe fn enable_caches(&mut self) {
        let flags = Cr0::read() - Cr0Flags::CACHE_DISABLE - Cr0Flags::NOT_WRITE_THROUGH;
        // SAFETY: Clearing CD/NW only changes caching, which the caller allowed.
        unsafe { Cr0::write(flags) };
    }

    fn translation_enabled(&self) -> bool {
        Cr0::read().contains(Cr0Flags::PAGING)
    }

    unsafe fn enable_translation(&mut self) {
        // SAFETY: The caller guarantees CR3 points at a hierarchy that maps the running code.
        unsafe { Cr0::update(|flags| flags.insert(Cr0Flags::PAGING)) };
    }
}
