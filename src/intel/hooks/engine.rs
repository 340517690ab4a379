//! Engine lifecycle and the breakpoint registration surface.
//!
//! Registration runs in ordinary kernel context. Nothing is programmed
//! into EPT per `install_pre` call; `start` bulk-arms every installed
//! record from VMM context via hypercall once the static set is in
//! place. Post breakpoints are the exception: they are born inside a
//! running Pre handler, already in VMM context, and arm immediately.

use {
    crate::{
        error::HypervisorError,
        global_const::TERMINATE_DRAIN_MILLIS,
        intel::{
            ept::EptTable,
            hooks::{
                patch::{BreakpointTarget, CapturedParameters, PatchRecord},
                registry, shadow, state,
            },
            vmexit::vmcall::VmcallCommand,
        },
        platform::Platform,
    },
    log::{debug, warn},
};

/// Creates the registry lock and the empty breakpoint set. No shadowing
/// is live afterwards.
pub fn initialize() -> Result<(), HypervisorError> {
    registry::init()?;
    debug!("Stealth breakpoint engine initialized");
    Ok(())
}

/// Requests the VMM to arm the execute shadow for every installed
/// breakpoint. Call after all static Pre breakpoints are installed.
pub fn start(platform: &dyn Platform) -> Result<(), HypervisorError> {
    platform.vmcall(VmcallCommand::EnablePageShadowing)
}

/// Bulk-disarms, waits out in-flight single-steps, and destroys the
/// registry together with every shadow page it kept alive.
pub fn terminate(platform: &dyn Platform) {
    if !registry::is_active() {
        return;
    }

    if let Err(error) = platform.vmcall(VmcallCommand::DisablePageShadowing) {
        warn!("Bulk disable hypercall failed: {:?}", error);
    }

    // Another processor may still be between a breakpoint hit and its
    // monitor-trap completion; give those steps time to retire before
    // the shadow pages go away.
    platform.sleep_ms(TERMINATE_DRAIN_MILLIS);

    state::reset();
    registry::teardown();
    debug!("Stealth breakpoint engine terminated");
}

/// Builds a Pre breakpoint for `address` and adds it to the registry.
pub fn install_pre(
    address: u64,
    target: &BreakpointTarget,
    name: &str,
    platform: &dyn Platform,
) -> Result<(), HypervisorError> {
    let reusable = registry::with_registry(|registry| registry.shadow_pair_for_page(address))?;
    let record = PatchRecord::new_pre(address, target, name, reusable, platform)?;
    debug!("Installing pre breakpoint {} at {:#x}", name, address);
    registry::with_registry(|registry| registry.insert(record))
}

/// Builds a Post breakpoint at `address` owned by the current thread,
/// adds it to the registry, and arms it immediately.
///
/// Called from within a Pre handler, so the guest's address-space root
/// is current and `address` (typically a return address read off the
/// guest stack) is dereferenceable. Installing twice for the same
/// (page, thread) does not create a second record: the captured
/// parameters of the existing one are overwritten in place.
pub fn install_and_enable_post(
    address: u64,
    pre: &PatchRecord,
    parameters: CapturedParameters,
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
) -> Result<(), HypervisorError> {
    let thread = platform.current_thread_id();

    if registry::update_duplicate_post(address, thread, parameters)? {
        debug!(
            "Duplicate post breakpoint at {:#x} for thread {:#x}: parameters refreshed",
            address, thread
        );
        return Ok(());
    }

    let reusable = registry::with_registry(|registry| registry.shadow_pair_for_page(address))?;
    let record = PatchRecord::new_post(address, pre, thread, parameters, reusable, platform)?;
    let armed = (*record).clone();
    registry::with_registry(|registry| registry.insert(record))?;
    debug!(
        "Installed post breakpoint {} at {:#x} for thread {:#x}",
        armed.name, address, thread
    );
    shadow::enable_exec(&armed, ept, platform)
}

/// VMM-side bulk arm, reached through the EnablePageShadowing hypercall.
pub(crate) fn enable_all(
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
) -> Result<(), HypervisorError> {
    registry::with_registry(|registry| {
        for record in registry.records() {
            shadow::enable_exec(record, ept, platform)?;
        }
        Ok(())
    })?
}

/// VMM-side bulk disarm, reached through the DisablePageShadowing
/// hypercall.
pub(crate) fn disable_all(
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
) -> Result<(), HypervisorError> {
    registry::with_registry(|registry| {
        for record in registry.records() {
            shadow::disable(record, ept, platform)?;
        }
        Ok(())
    })?
}
