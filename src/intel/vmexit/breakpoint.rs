//! The #BP (software breakpoint) VM-exit entry point.
//!
//! Determines whether the exception came from a shadow breakpoint and,
//! if so, runs its handler, switches the page to the read/write view,
//! and arms a single-step so the original instruction executes from the
//! pristine copy before the trap is put back.

use {
    crate::{
        error::HypervisorError,
        global_const::BREAKPOINT_OPCODE,
        intel::{
            capture::GuestRegisters,
            ept::EptTable,
            hooks::{
                patch::{BreakpointKind, HitContext, PatchRecord},
                registry, shadow,
                state::LastEvent,
            },
            vmexit::{mtf, ExitType},
        },
        platform::{GuestAddressSpace, Platform, DISPATCH_LEVEL},
    },
    log::trace,
    x86::vmx::vmcs,
};

pub fn handle_breakpoint(
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
    regs: &mut GuestRegisters,
) -> Result<ExitType, HypervisorError> {
    let guest_ip = regs.rip;

    // Snapshot under the registry lock, act outside it. VM exits are
    // serialized per processor and the only removal path runs on the
    // processor that took the snapshot, so the copy stays authoritative
    // for the duration of this exit.
    let Some(info) = registry::snapshot_by_address(guest_ip) else {
        // Engine inactive or address untracked: likely a breakpoint the
        // guest planted for itself. Have the dispatcher reinject it.
        return Ok(ExitType::ReinjectExceptionToGuest);
    };

    // The trap byte must exist only on the execute view. Seeing it on
    // the read/write copy means the guest wrote an INT3 of its own at
    // the patched address; that one belongs to the guest.
    if info.rw_shadow.read_byte(info.offset()) == BREAKPOINT_OPCODE {
        return Ok(ExitType::ReinjectExceptionToGuest);
    }

    // Handlers take the registry spin lock; above dispatch level that
    // is not survivable, and there is no way to refuse the hit.
    if platform.current_interrupt_level() > DISPATCH_LEVEL {
        return Err(HypervisorError::InterruptLevelTooHigh);
    }

    trace!("Shadow breakpoint hit at {:#x} ({})", guest_ip, info.name);

    match info.kind {
        BreakpointKind::Pre => {
            run_handler(&info, ept, platform, regs);
            shadow::enable_rw(&info, ept, platform)?;
            mtf::arm_single_step(platform, LastEvent::from_record(&info, platform))?;
        }
        BreakpointKind::Post => {
            if info.owner_thread == Some(platform.current_thread_id()) {
                run_handler(&info, ept, platform, regs);
                registry::with_registry(|registry| {
                    registry.erase(info.address, info.owner_thread)
                })?;
                // Shadowing for the page survives as long as any other
                // record still patches it.
                if !registry::page_tracked(guest_ip) {
                    shadow::disable(&info, ept, platform)?;
                }
            } else {
                // Another thread ran into this thread's post breakpoint.
                // Step it over the original byte without consuming the
                // record.
                shadow::enable_rw(&info, ept, platform)?;
                mtf::arm_single_step(platform, LastEvent::from_record(&info, platform))?;
            }
        }
    }

    // Ours; do not deliver the #BP to the guest.
    Ok(ExitType::Continue)
}

/// Runs the record's handler with the guest's address-space root
/// current, so guest pointers (the stack included) dereference safely.
/// The VMM's root is restored on return, unconditionally.
fn run_handler(
    info: &PatchRecord,
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
    regs: &mut GuestRegisters,
) {
    let guest_rsp = platform.vmread(vmcs::guest::RSP);
    let mut ctx = HitContext {
        ept,
        platform,
        regs,
        guest_rsp,
    };

    let _guest_root = GuestAddressSpace::enter(platform);
    (info.handler)(info, &mut ctx);
}
