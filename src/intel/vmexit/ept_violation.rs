//! The EPT-violation VM-exit entry point.
//!
//! A tracked page sits execute-only while armed, so any guest read or
//! write of it faults here. The guest gets the pristine read/write copy
//! for exactly one instruction; the monitor-trap exit puts the execute
//! view back.

use {
    crate::{
        error::HypervisorError,
        intel::{
            ept::EptTable,
            hooks::{registry, shadow, state::LastEvent},
            vmexit::{mtf, ExitType},
        },
        platform::Platform,
    },
    log::trace,
};

/// `fault_va` is the guest linear address whose access faulted, as
/// reported by the exit qualification.
pub fn handle_ept_violation(
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
    fault_va: u64,
) -> Result<ExitType, HypervisorError> {
    let Some(info) = registry::snapshot_by_page(fault_va) else {
        // Not a page we shadow; let the dispatcher deal with it.
        return Ok(ExitType::Unhandled);
    };

    trace!(
        "Read/write fault on shadowed page at {:#x} ({})",
        fault_va,
        info.name
    );

    shadow::enable_rw(&info, ept, platform)?;
    mtf::arm_single_step(platform, LastEvent::from_record(&info, platform))?;

    // Resume at the same instruction: it now reads the pristine copy.
    Ok(ExitType::Continue)
}
