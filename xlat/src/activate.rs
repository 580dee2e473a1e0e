//! Installing a hierarchy and switching translation on.

use arrayvec::ArrayVec;
use log::{info, warn};

use crate::{
    Architecture, ControlRegister, Mmu, RootTable,
    arch::{MAX_REGISTER_UPDATES, RegisterUpdate},
    error::{XlatError, XlatResult},
};

/// Registers as they were before activation touched them.
struct Saved {
    base: u64,
    controls: [u64; 4],
    base_written: bool,
    written: ArrayVec<ControlRegister, MAX_REGISTER_UPDATES>,
}

impl Saved {
    fn capture<M: Mmu>(mmu: &M) -> Self {
        Saved {
            base: mmu.translation_base(),
            controls: ControlRegister::ALL.map(|register| mmu.control(register)),
            base_written: false,
            written: ArrayVec::new(),
        }
    }

    /// Puts back everything that was written, newest first.
    ///
    /// # Safety
    /// The saved values must still describe a working configuration.
    unsafe fn restore<M: Mmu>(&self, mmu: &mut M) {
        for register in self.written.iter().rev() {
            // SAFETY: Writing back what was there before.
            unsafe { mmu.set_control(*register, self.controls[register.index()]) };
        }
        if self.base_written {
            // SAFETY: As above.
            unsafe { mmu.set_translation_base(self.base) };
        }
    }
}

unsafe fn install_base<A: Architecture, M: Mmu>(
    arch: &A,
    mmu: &mut M,
    root: &RootTable,
    saved: &mut Saved,
) -> XlatResult<()> {
    let expected = arch.translation_base(root.base());
    saved.base_written = true;
    // SAFETY: Forwarded from `activate`.
    unsafe { mmu.set_translation_base(expected) };
    let actual = mmu.translation_base();
    if actual != expected {
        return Err(XlatError::ConfigurationUnsupported {
            register: A::BASE_REGISTER,
            expected,
            actual,
        });
    }
    Ok(())
}

unsafe fn program<M: Mmu>(
    mmu: &mut M,
    updates: &[RegisterUpdate],
    saved: &mut Saved,
) -> XlatResult<()> {
    for update in updates {
        let value = update.apply(mmu.control(update.register));
        if !saved.written.contains(&update.register) {
            saved.written.push(update.register);
        }
        // SAFETY: Forwarded from `activate`.
        unsafe { mmu.set_control(update.register, value) };
        let actual = mmu.control(update.register);
        if actual & update.verify != value & update.verify {
            return Err(XlatError::ConfigurationUnsupported {
                register: update.name,
                expected: value & update.verify,
                actual: actual & update.verify,
            });
        }
    }
    Ok(())
}

/// Refuses a switch the hardware can't make while translation stays on.
fn check_retarget<A: Architecture, M: Mmu>(mmu: &M, updates: &[RegisterUpdate]) -> XlatResult<()> {
    if !A::RETARGET_WHILE_ENABLED {
        warn!("{}: translation is already on, refusing to retarget", A::NAME);
        return Err(XlatError::InvalidParameter(
            "translation has to be off to install a new hierarchy",
        ));
    }
    for update in updates {
        let current = mmu.control(update.register);
        if update.changes_frozen(current) {
            let err = XlatError::ConfigurationUnsupported {
                register: update.name,
                expected: update.apply(current) & update.frozen,
                actual: current & update.frozen,
            };
            warn!("{}: can't switch under live translation: {}", A::NAME, err);
            return Err(err);
        }
    }
    Ok(())
}

/// Installs `root` and turns translation on.
///
/// The translation base and the architecture's global state are written read-modify-write and
/// read back. If the hardware didn't keep a value, everything written so far is put back,
/// translation is left alone and `ConfigurationUnsupported` is returned. Otherwise the TLBs are
/// flushed, caches and translation are switched on if they weren't already, and `root` becomes
/// live.
///
/// When translation is already on, global state goes in before the new base, so the tables are
/// never walked under the old settings (x86 faults on NX bits while EFER.NXE is clear). Only
/// regimes with [`Architecture::RETARGET_WHILE_ENABLED`] allow that at all, the others return
/// `InvalidParameter`. A configuration that would change a register's frozen bits under live
/// translation (the x86 paging depth) is `ConfigurationUnsupported`. Neither writes anything.
///
/// # Safety
/// The hierarchy under `root` must map the running code, its stack, and everything else the
/// caller touches afterwards, with the permissions it is used with.
pub unsafe fn activate<A, M>(arch: &A, mmu: &mut M, root: &mut RootTable) -> XlatResult<()>
where
    A: Architecture,
    M: Mmu,
{
    let mut saved = Saved::capture(mmu);
    let updates = arch.global_state();
    let enabled = mmu.translation_enabled();
    if enabled {
        check_retarget::<A, M>(mmu, &updates)?;
    }

    // SAFETY: Forwarded to the caller.
    let result = unsafe {
        if enabled {
            program(mmu, &updates, &mut saved).and_then(|_| install_base(arch, mmu, root, &mut saved))
        } else {
            install_base(arch, mmu, root, &mut saved).and_then(|_| program(mmu, &updates, &mut saved))
        }
    };
    if let Err(err) = result {
        warn!("{}: rejected by the hardware: {}", A::NAME, err);
        // SAFETY: Nothing has been switched on, and the old values were in use before.
        unsafe { saved.restore(mmu) };
        return Err(err);
    }

    mmu.barrier();
    mmu.invalidate_all();
    // SAFETY: Forwarded to the caller.
    unsafe {
        if !mmu.caches_enabled() {
            mmu.enable_caches();
        }
        if !enabled {
            mmu.enable_translation();
        }
    }
    root.mark_live();
    info!(
        "{}: translation active, {} = {:#x}",
        A::NAME,
        A::BASE_REGISTER,
        mmu.translation_base()
    );
    Ok(())
}
