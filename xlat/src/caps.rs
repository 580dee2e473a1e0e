//! Platform capability snapshot.

/// What the processor supports, captured once and handed to the architecture configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Width of physical addresses in bits.
    pub phys_addr_bits: u8,
    /// Whether the coarsest optional block size is available (1GiB pages on x86_64).
    pub huge_pages: bool,
    /// Whether execute-never bits are honoured.
    pub execute_disable: bool,
    /// Whether 5-level paging (LA57) is available on x86_64.
    pub five_level: bool,
}

impl Capabilities {
    /// The least a 64-bit platform is allowed to have.
    pub const BASELINE: Capabilities = Capabilities {
        phys_addr_bits: 36,
        huge_pages: false,
        execute_disable: false,
        five_level: false,
    };

    /// Reads the capabilities of the processor we're running on.
    #[cfg(target_arch = "x86_64")]
    pub fn detect() -> Self {
        // INFO: `CpuId::new()` confuses RA on non-x86_64 hosts, so spell the reader out.
        let cpuid = raw_cpuid::CpuId::with_cpuid_reader(raw_cpuid::CpuIdReaderNative);
        let extended = cpuid.get_extended_processor_and_feature_identifiers();
        Capabilities {
            phys_addr_bits: cpuid
                .get_processor_capacity_feature_info()
                .map_or(36, |info| info.physical_address_bits()),
            huge_pages: extended.as_ref().is_some_and(|ext| ext.has_1gib_pages()),
            execute_disable: extended.as_ref().is_some_and(|ext| ext.has_execute_disable()),
            five_level: cpuid
                .get_extended_feature_info()
                .is_some_and(|info| info.has_la57()),
        }
    }

    /// Reads the capabilities of the processor we're running on.
    #[cfg(target_arch = "aarch64")]
    pub fn detect() -> Self {
        let mmfr0: u64;
        // SAFETY: ID_AA64MMFR0_EL1 is a read-only identification register, readable at EL1 and up.
        unsafe {
            core::arch::asm!("mrs {}, id_aa64mmfr0_el1", out(reg) mmfr0, options(nomem, nostack));
        }
        let phys_addr_bits = match mmfr0 & 0xF {
            0 => 32,
            1 => 36,
            2 => 40,
            3 => 42,
            4 => 44,
            5 => 48,
            _ => 52,
        };
        Capabilities {
            phys_addr_bits,
            // L1 blocks always exist with a 4KiB granule.
            huge_pages: true,
            execute_disable: true,
            five_level: false,
        }
    }

    /// Reads the capabilities of the processor we're running on.
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    pub fn detect() -> Self {
        // Short descriptors: 32 bit physical addresses, no supersections.
        Capabilities {
            phys_addr_bits: 32,
            huge_pages: false,
            execute_disable: true,
            five_level: false,
        }
    }
}
