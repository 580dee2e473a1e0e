//! What to map: region descriptors, and the platform memory space map they are seeded from.

use log::{debug, warn};

use crate::{
    Architecture, Attribute, GRANULE_SIZE, PhysAddr, VirtAddr,
    addr::align_down,
    error::{XlatError, XlatResult},
};

/// One contiguous range to map.
///
/// `length` must be non-zero and all three of `phys_base`, `virt_base` and `length` granule
/// aligned. The builder checks this, see [`MemoryRegionDescriptor::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegionDescriptor {
    /// First physical address.
    pub phys_base: PhysAddr,
    /// Where `phys_base` shows up.
    pub virt_base: VirtAddr,
    /// Length in bytes.
    pub length: u64,
    /// Access and cache attribute of the whole range.
    pub attribute: Attribute,
}

impl MemoryRegionDescriptor {
    /// Maps `[phys_base, phys_base + length)` at `virt_base`.
    pub const fn new(
        phys_base: PhysAddr,
        virt_base: VirtAddr,
        length: u64,
        attribute: Attribute,
    ) -> Self {
        Self {
            phys_base,
            virt_base,
            length,
            attribute,
        }
    }

    /// Maps `[base, base + length)` onto itself.
    pub const fn identity(base: PhysAddr, length: u64, attribute: Attribute) -> Self {
        Self::new(base, VirtAddr::new(base.as_u64()), length, attribute)
    }

    /// Checks the region against its own invariants and what `arch` can express.
    pub fn validate<A: Architecture>(&self, arch: &A) -> XlatResult<()> {
        if self.length == 0 {
            return Err(XlatError::InvalidParameter("region length is zero"));
        }
        if !self.phys_base.is_aligned(GRANULE_SIZE)
            || !self.virt_base.is_aligned(GRANULE_SIZE)
            || self.length % GRANULE_SIZE != 0
        {
            return Err(XlatError::InvalidParameter("region is not granule aligned"));
        }
        let fits = |base: u64, bits: u32| {
            base.checked_add(self.length)
                .is_some_and(|end| bits >= 64 || end <= 1 << bits)
        };
        if !fits(self.phys_base.as_u64(), arch.phys_bits()) {
            return Err(XlatError::InvalidParameter(
                "physical address exceeds the supported width",
            ));
        }
        if !fits(self.virt_base.as_u64(), arch.va_bits()) {
            return Err(XlatError::InvalidParameter(
                "virtual address exceeds the input address space",
            ));
        }
        Ok(())
    }

    pub(crate) fn virt_end(&self) -> u64 {
        self.virt_base.as_u64() + self.length
    }
}

/// What the platform says lives in a range of the physical address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySpaceKind {
    /// Device registers.
    MemoryMappedIo,
    /// RAM.
    SystemMemory,
    /// Nothing; left unmapped.
    Unmapped,
}

impl MemorySpaceKind {
    const fn attribute(self) -> Option<Attribute> {
        match self {
            MemorySpaceKind::MemoryMappedIo => Some(Attribute::Device),
            MemorySpaceKind::SystemMemory => Some(Attribute::WriteBack),
            MemorySpaceKind::Unmapped => None,
        }
    }
}

/// One entry of the platform memory space map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySpaceDescriptor {
    /// First address. Doesn't need to be aligned.
    pub base: PhysAddr,
    /// Length in bytes.
    pub length: u64,
    /// What lives there.
    pub kind: MemorySpaceKind,
}

impl MemorySpaceDescriptor {
    /// Creates a descriptor.
    pub const fn new(base: PhysAddr, length: u64, kind: MemorySpaceKind) -> Self {
        Self { base, length, kind }
    }

    fn end(&self) -> u64 {
        self.base.as_u64().saturating_add(self.length)
    }
}

/// Turns a memory space map, sorted by base, into identity mapping regions.
///
/// Adjacent entries of the same kind are merged, every range is widened to granule boundaries,
/// `Unmapped` entries are dropped, MMIO maps as [`Attribute::Device`] and system memory as
/// [`Attribute::WriteBack`].
pub fn identity_regions(space: &[MemorySpaceDescriptor]) -> IdentityRegions<'_> {
    IdentityRegions { space, position: 0 }
}

/// Iterator returned by [`identity_regions`].
#[derive(Debug, Clone)]
pub struct IdentityRegions<'a> {
    space: &'a [MemorySpaceDescriptor],
    position: usize,
}

impl Iterator for IdentityRegions<'_> {
    type Item = MemoryRegionDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let first = *self.space.get(self.position)?;
            self.position += 1;
            let mut end = first.end();
            while let Some(next) = self.space.get(self.position) {
                if next.kind != first.kind || next.base.as_u64() != end {
                    break;
                }
                end = next.end();
                self.position += 1;
            }

            let Some(attribute) = first.kind.attribute() else {
                continue;
            };
            if end == first.base.as_u64() {
                continue;
            }
            let base = align_down(first.base.as_u64(), GRANULE_SIZE);
            // The last page below 2^64 has no exclusive end to express it with.
            let end = align_down(end.saturating_add(GRANULE_SIZE - 1), GRANULE_SIZE);
            if end <= base {
                warn!(
                    "Memory space at {:?} ({:?}) reaches the top of the address space, skipping it",
                    first.base, first.kind
                );
                continue;
            }
            debug!(
                "Memory space {:#x}..{:#x} ({:?}) maps as {:?}",
                base, end, first.kind, attribute
            );
            return Some(MemoryRegionDescriptor::identity(
                PhysAddr::new(base),
                end - base,
                attribute,
            ));
        }
    }
}
