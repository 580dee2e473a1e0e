//! xlat - translation table builder for early boot.
//!
//! Compiles a list of [`MemoryRegionDescriptor`]s into the hardware translation tables of one of
//! the supported regimes (see [`arch`]), keeps them up to date once they are live, and finally
//! installs them into the MMU.
//!
//! The pieces, leaves first:
//! - [`resolve`]: what the hardware thinks the cache type of an address is (x86 MTRRs).
//! - [`Mapper::build`]: the recursive region-to-table compiler.
//! - [`Mapper::mutate`]: permission/attribute changes on a table that may already be live.
//! - [`Mapper::leaf_at`] and friends: reading a hierarchy back.
//! - [`Mapper::map_memory_space`]: identity maps a platform memory map.
//! - [`activate()`]: installs a root and turns translation on.
//! - [`bring_up()`]: all of the above, falling back through configurations the CPU refuses.
#![cfg_attr(not(test), no_std)]

#[cfg(not(any(feature = "x86_64", feature = "aarch64", feature = "arm")))]
compile_error!("At least one translation regime (x86_64, aarch64, arm) must be enabled.");

pub mod activate;
pub mod addr;
pub mod arch;
pub mod arena;
pub mod attr;
pub mod bring_up;
pub mod caps;
pub mod error;
pub mod mmu;
pub mod paging;
pub mod region;
pub mod resolve;

#[cfg(test)]
mod test_util;

pub use activate::activate;
pub use addr::{PhysAddr, VirtAddr};
pub use arch::Architecture;
pub use arena::{OutOfMemory, PageArena};
pub use attr::{Attribute, CacheType};
pub use bring_up::bring_up;
pub use caps::Capabilities;
pub use error::XlatError;
pub use mmu::{ControlRegister, Mmu};
pub use paging::{Entry, Mapper, Mutation, Permission, RootTable};
pub use region::{MemoryRegionDescriptor, MemorySpaceDescriptor, MemorySpaceKind};
pub use resolve::AttributeResolver;

/// log2 of the translation granule. Every supported regime uses 4KiB pages.
pub const GRANULE_SHIFT: u32 = 12;
/// The smallest mappable unit, in bytes.
pub const GRANULE_SIZE: u64 = 1 << GRANULE_SHIFT;
