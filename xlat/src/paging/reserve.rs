//! Up-front page reservation.
//!
//! A build first counts the tables it will need, then reserves them here. Either every page is
//! reserved, or every page reserved so far goes back to the arena and nothing has been written.
//! Reserved pages are chained through their first 8 bytes, so the list needs no storage of its
//! own.

use log::{trace, warn};

use crate::{
    PageArena, PhysAddr,
    error::{XlatError, XlatResult},
};

const END_OF_LIST: u64 = u64::MAX;

#[derive(Debug)]
pub(crate) struct Reservation {
    head: Option<PhysAddr>,
    len: usize,
}

impl Reservation {
    /// Reserves `count` single pages.
    pub(crate) fn reserve<P: PageArena>(arena: &mut P, count: usize) -> XlatResult<Self> {
        let mut reservation = Reservation { head: None, len: 0 };
        for taken in 0..count {
            match arena.allocate(1) {
                Ok(page) => reservation.push(arena, page),
                Err(_) => {
                    warn!(
                        "Page arena exhausted after {} of {} tables, rolling back",
                        taken, count
                    );
                    reservation.release(arena);
                    return Err(XlatError::OutOfResources);
                }
            }
        }
        Ok(reservation)
    }

    fn push<P: PageArena>(&mut self, arena: &P, page: PhysAddr) {
        let link = self.head.map_or(END_OF_LIST, PhysAddr::as_u64);
        // SAFETY: The page was just allocated and nothing else refers to it.
        unsafe { (arena.translate(page) as *mut u64).write(link) };
        self.head = Some(page);
        self.len += 1;
    }

    /// Takes one reserved page. Running dry means the plan undercounted.
    pub(crate) fn take<P: PageArena>(&mut self, arena: &P) -> XlatResult<PhysAddr> {
        let page = self.head.ok_or(XlatError::OutOfResources)?;
        // SAFETY: Every page on the list starts with the link written by `push`.
        let link = unsafe { (arena.translate(page) as *const u64).read() };
        self.head = (link != END_OF_LIST).then_some(PhysAddr::new(link));
        self.len -= 1;
        Ok(page)
    }

    /// Pages still reserved.
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Returns whatever is left to the arena.
    pub(crate) fn release<P: PageArena>(mut self, arena: &mut P) {
        if self.len() != 0 {
            trace!("Reservation: returning {} unused pages", self.len());
        }
        while let Ok(page) = self.take(arena) {
            // SAFETY: Reserved pages are never linked into a table.
            unsafe { arena.free(page, 1) };
        }
    }
}
