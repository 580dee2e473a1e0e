//! Falling back through architecture configurations until the hardware takes one.

use log::{info, warn};

use crate::{
    Architecture, AttributeResolver, Mapper, Mmu, PageArena, RootTable,
    error::{XlatError, XlatResult},
    region::MemorySpaceDescriptor,
};

/// Builds an identity map of `space` and activates it, trying each of `configs` in order.
///
/// A configuration the hardware rejects (`ConfigurationUnsupported`) has its tables released
/// before the next one is tried. Any other error ends the ladder. Returns the index of the
/// configuration that stuck, together with its (now live) root.
///
/// # Panics
/// On a corrupted table entry; nothing built from here on could be trusted.
///
/// # Safety
/// As [`crate::activate()`]: every configuration's identity map of `space` has to cover the
/// running code and data.
pub unsafe fn bring_up<A, P, M>(
    configs: &[A],
    arena: &mut P,
    mmu: &mut M,
    resolver: Option<&dyn AttributeResolver>,
    space: &[MemorySpaceDescriptor],
) -> XlatResult<(usize, RootTable)>
where
    A: Architecture,
    P: PageArena,
    M: Mmu,
{
    let mut last = XlatError::InvalidParameter("no architecture configuration to try");
    for (index, arch) in configs.iter().enumerate() {
        let mut mapper = Mapper::new(arch, &mut *arena, &mut *mmu);
        if let Some(resolver) = resolver {
            mapper = mapper.with_resolver(resolver);
        }
        let mut root = mapper.create_root()?;
        let result = match mapper.map_memory_space(&root, space) {
            // SAFETY: Forwarded to the caller.
            Ok(()) => unsafe { mapper.activate(&mut root) },
            Err(err) => Err(err),
        };
        match result {
            Ok(()) => {
                info!(
                    "{}: configuration {} of {} is live",
                    A::NAME,
                    index + 1,
                    configs.len()
                );
                return Ok((index, root));
            }
            Err(err) if err.is_fatal() => panic!("{}: {}", A::NAME, err),
            Err(err @ XlatError::ConfigurationUnsupported { .. }) => {
                warn!(
                    "{}: configuration {} unsupported, trying the next one",
                    A::NAME,
                    index + 1
                );
                mapper.release(root)?;
                last = err;
            }
            Err(err) => {
                mapper.release(root)?;
                return Err(err);
            }
        }
    }
    Err(last)
}
