//! Host stand-ins for the page arena and the MMU.

use std::alloc::{Layout, alloc_zeroed, dealloc};

use bitvec::vec::BitVec;

use crate::{
    Capabilities, ControlRegister, GRANULE_SIZE, Mmu, OutOfMemory, PageArena, PhysAddr, VirtAddr,
};

/// Where the test arena pretends its pages live.
pub const ARENA_BASE: u64 = 0x4000_0000;
const ARENA_ALIGN: usize = 0x4000;

/// Capabilities of a reasonably modern x86_64 machine.
pub fn x86_caps() -> Capabilities {
    Capabilities {
        phys_addr_bits: 46,
        huge_pages: true,
        execute_disable: true,
        five_level: false,
    }
}

/// A heap backed page arena that tracks every page it hands out.
#[derive(Debug)]
pub struct TestArena {
    memory: *mut u8,
    layout: Layout,
    used: BitVec,
    fail_after: Option<usize>,
}

impl TestArena {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * GRANULE_SIZE as usize, ARENA_ALIGN).unwrap();
        // SAFETY: The layout has a non-zero size.
        let memory = unsafe { alloc_zeroed(layout) };
        assert!(!memory.is_null());
        TestArena {
            memory,
            layout,
            used: BitVec::repeat(false, pages),
            fail_after: None,
        }
    }

    /// Lets the next `n` allocations through and fails every one after that.
    pub fn fail_after(&mut self, n: usize) {
        self.fail_after = Some(n);
    }

    /// Pages currently allocated.
    pub fn outstanding(&self) -> usize {
        self.used.count_ones()
    }

    fn find_free_run(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for (index, used) in self.used.iter().enumerate() {
            if *used {
                run = 0;
                continue;
            }
            run += 1;
            if run == count {
                return Some(index + 1 - count);
            }
        }
        None
    }
}

impl PageArena for TestArena {
    fn allocate(&mut self, count: usize) -> Result<PhysAddr, OutOfMemory> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                return Err(OutOfMemory);
            }
            *remaining -= 1;
        }
        let start = self.find_free_run(count).ok_or(OutOfMemory)?;
        for index in start..start + count {
            self.used.set(index, true);
        }
        Ok(PhysAddr::new(ARENA_BASE + start as u64 * GRANULE_SIZE))
    }

    unsafe fn free(&mut self, base: PhysAddr, count: usize) {
        let start = ((base.as_u64() - ARENA_BASE) / GRANULE_SIZE) as usize;
        for index in start..start + count {
            assert!(self.used[index], "double free of {:?}", base);
            self.used.set(index, false);
        }
    }

    fn translate(&self, base: PhysAddr) -> *mut u8 {
        let offset = (base.as_u64() - ARENA_BASE) as usize;
        assert!(offset < self.layout.size(), "{:?} is outside the arena", base);
        // SAFETY: Checked against the size of the allocation just above.
        unsafe { self.memory.add(offset) }
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        // SAFETY: Allocated in `new` with the same layout.
        unsafe { dealloc(self.memory, self.layout) };
    }
}

/// An operation the mock MMU saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuOp {
    Barrier,
    InvalidateRange(VirtAddr, u64),
    InvalidateAll,
    SetBase(u64),
    SetControl(ControlRegister, u64),
    EnableCaches,
    EnableTranslation,
}

/// Records what it is asked to do. Registers hold whatever is written to them, unless clamped.
#[derive(Debug, Default)]
pub struct MockMmu {
    pub ops: Vec<MmuOp>,
    pub base: u64,
    pub controls: [u64; 4],
    pub caches: bool,
    pub translation: bool,
    cleans: usize,
    table_cleans: usize,
    clamp: Option<(ControlRegister, u64, u64)>,
}

impl MockMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the bits of `register` under `mask` always read back as `value`.
    pub fn clamp(&mut self, register: ControlRegister, mask: u64, value: u64) {
        self.clamp = Some((register, mask, value & mask));
    }

    pub fn invalidations(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, MmuOp::InvalidateRange(..)))
            .count()
    }

    pub fn cleans(&self) -> usize {
        self.cleans
    }

    /// Whole tables cleaned before being linked, the root included.
    pub fn table_cleans(&self) -> usize {
        self.table_cleans
    }
}

impl Mmu for MockMmu {
    fn barrier(&mut self) {
        self.ops.push(MmuOp::Barrier);
    }

    fn invalidate_range(&mut self, va: VirtAddr, len: u64) {
        self.ops.push(MmuOp::InvalidateRange(va, len));
    }

    fn invalidate_all(&mut self) {
        self.ops.push(MmuOp::InvalidateAll);
    }

    fn clean_entry(&mut self, _entry: *const u8) {
        self.cleans += 1;
    }

    fn clean_table(&mut self, _table: *const u8, _len: usize) {
        self.table_cleans += 1;
    }

    fn translation_base(&self) -> u64 {
        self.base
    }

    unsafe fn set_translation_base(&mut self, value: u64) {
        self.ops.push(MmuOp::SetBase(value));
        self.base = value;
    }

    fn control(&self, register: ControlRegister) -> u64 {
        let value = self.controls[register.index()];
        match self.clamp {
            Some((clamped, mask, forced)) if clamped == register => (value & !mask) | forced,
            _ => value,
        }
    }

    unsafe fn set_control(&mut self, register: ControlRegister, value: u64) {
        self.ops.push(MmuOp::SetControl(register, value));
        self.controls[register.index()] = value;
    }

    fn caches_enabled(&self) -> bool {
        self.caches
    }

    unsafe fn enable_caches(&mut self) {
        self.ops.push(MmuOp::EnableCaches);
        self.caches = true;
    }

    fn translation_enabled(&self) -> bool {
        self.translation
    }

    unsafe fn enable_translation(&mut self) {
        self.ops.push(MmuOp::EnableTranslation);
        self.translation = true;
    }
}

#[cfg(unix)]
mod log_internal {
    use ctor::ctor;

    #[ctor]
    static INIT: () = {
        env_logger::builder().is_test(true).init();
    };
}
