//! Hardware-authoritative attribute lookup.

use crate::{Attribute, GRANULE_SIZE, PhysAddr};

/// Answers "what attribute does the hardware itself enforce at this address?".
///
/// The builder consults it before committing a coarse block: every granule in the block must
/// resolve to the same attribute, otherwise the block is split.
pub trait AttributeResolver {
    /// The attribute the hardware enforces at `address`.
    fn resolve(&self, address: PhysAddr) -> Attribute;

    /// Samples every granule in `[base, base + length)`.
    ///
    /// Returns the shared attribute if they all agree, `None` otherwise.
    fn uniform(&self, base: PhysAddr, length: u64) -> Option<Attribute> {
        let first = self.resolve(base);
        let mut offset = GRANULE_SIZE;
        while offset < length {
            if self.resolve(base + offset) != first {
                return None;
            }
            offset += GRANULE_SIZE;
        }
        Some(first)
    }
}

impl<F> AttributeResolver for F
where
    F: Fn(PhysAddr) -> Attribute,
{
    fn resolve(&self, address: PhysAddr) -> Attribute {
        self(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform() {
        let resolver = |a: PhysAddr| {
            if a.as_u64() == 0x20_1000 {
                Attribute::Uncached
            } else {
                Attribute::WriteBack
            }
        };
        assert_eq!(
            resolver.uniform(PhysAddr::new(0x40_0000), 0x20_0000),
            Some(Attribute::WriteBack)
        );
        assert_eq!(resolver.uniform(PhysAddr::new(0x20_0000), 0x20_0000), None);
        // A single granule is always uniform.
        assert_eq!(
            resolver.uniform(PhysAddr::new(0x20_1000), GRANULE_SIZE),
            Some(Attribute::Uncached)
        );
    }
}
