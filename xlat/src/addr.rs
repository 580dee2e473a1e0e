//! Address primitives.

use core::fmt;
use core::ops::{Add, Sub};

// These deliberately aren't the x86_64 crate's address types: those enforce canonical form and a
// 52 bit physical width, neither of which holds for the ARM regimes.

/// A physical address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Create a new physical address from a u64.
    pub const fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    /// Get the underlying u64 value of the physical address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if the address is a multiple of `align`, which must be a power of two.
    pub const fn is_aligned(self, align: u64) -> bool {
        is_aligned(self.0, align)
    }

    /// Round the address down to a multiple of `align`, which must be a power of two.
    pub const fn align_down(self, align: u64) -> Self {
        PhysAddr(align_down(self.0, align))
    }

    /// Round the address up to a multiple of `align`, which must be a power of two.
    pub const fn align_up(self, align: u64) -> Self {
        PhysAddr(align_up(self.0, align))
    }
}

/// A virtual (input) address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Create a new virtual address from a u64.
    pub const fn new(addr: u64) -> Self {
        VirtAddr(addr)
    }

    /// Get the underlying u64 value of the virtual address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if the address is a multiple of `align`, which must be a power of two.
    pub const fn is_aligned(self, align: u64) -> bool {
        is_aligned(self.0, align)
    }

    /// Round the address down to a multiple of `align`, which must be a power of two.
    pub const fn align_down(self, align: u64) -> Self {
        VirtAddr(align_down(self.0, align))
    }
}

macro_rules! addr_impls {
    ($ty: ident, $name: literal) => {
        impl Add<u64> for $ty {
            type Output = $ty;

            fn add(self, rhs: u64) -> Self::Output {
                $ty(self.0 + rhs)
            }
        }

        impl Sub<u64> for $ty {
            type Output = $ty;

            fn sub(self, rhs: u64) -> Self::Output {
                $ty(self.0 - rhs)
            }
        }

        impl Sub<$ty> for $ty {
            type Output = u64;

            fn sub(self, rhs: $ty) -> Self::Output {
                self.0 - rhs.0
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($name, "({:#x})"), self.0)
            }
        }
    };
}

addr_impls!(PhysAddr, "PhysAddr");
addr_impls!(VirtAddr, "VirtAddr");

#[inline(always)]
pub(crate) const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

#[inline(always)]
pub(crate) const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

#[inline(always)]
pub(crate) const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
