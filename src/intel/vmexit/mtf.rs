//! Monitor trap flag management and the MTF VM-exit entry point.
//!
//! A shadow single-step is one guest instruction executed on the
//! read/write view. Arming sets the monitor trap flag in the primary
//! processor-based controls and clears the guest's interrupt flag, so
//! the step lands on the next instruction and not inside an interrupt
//! service routine scheduled at VM entry. Both are undone when the step
//! retires.

use {
    crate::{
        error::HypervisorError,
        intel::{
            ept::EptTable,
            hooks::{shadow, state, state::LastEvent},
            vmexit::ExitType,
        },
        platform::Platform,
    },
    log::trace,
    x86::{bits64::rflags::RFlags, vmx::vmcs},
};

/// Handles the MTF VM exit: the single instruction on the read/write
/// view has retired. Restores the execute shadow and disarms.
///
/// An MTF exit with no pending event means the state machine was
/// violated; the dispatcher bug-checks on the error.
pub fn handle_monitor_trap_flag(
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
) -> Result<ExitType, HypervisorError> {
    let event = retire_single_step(platform)?;
    trace!("Single-step retired for {:#x}", event.address);
    shadow::enable_exec_frames(ept, event.patch_pa, event.exec_pa)?;
    Ok(ExitType::Continue)
}

/// Arms a single-step for `event` on the current processor.
pub fn arm_single_step(platform: &dyn Platform, event: LastEvent) -> Result<(), HypervisorError> {
    state::with_cpu(platform, |cpu| {
        if cpu.last_event.is_some() {
            return Err(HypervisorError::MonitorTrapSlotOccupied);
        }

        set_monitor_trap_flag(platform, true);

        let mut rflags = RFlags::from_raw(platform.vmread(vmcs::guest::RFLAGS));
        cpu.saved_interrupt_flag = rflags.contains(RFlags::FLAGS_IF);
        rflags.remove(RFlags::FLAGS_IF);
        platform.vmwrite(vmcs::guest::RFLAGS, rflags.bits());

        cpu.last_event = Some(event);
        Ok(())
    })?
}

/// Takes the pending event, disarms MTF, and puts the saved interrupt
/// flag back.
pub fn retire_single_step(platform: &dyn Platform) -> Result<LastEvent, HypervisorError> {
    state::with_cpu(platform, |cpu| {
        let event = cpu
            .last_event
            .take()
            .ok_or(HypervisorError::MonitorTrapSlotEmpty)?;

        set_monitor_trap_flag(platform, false);

        let mut rflags = RFlags::from_raw(platform.vmread(vmcs::guest::RFLAGS));
        if cpu.saved_interrupt_flag {
            rflags.insert(RFlags::FLAGS_IF);
        } else {
            rflags.remove(RFlags::FLAGS_IF);
        }
        platform.vmwrite(vmcs::guest::RFLAGS, rflags.bits());

        Ok(event)
    })?
}

/// Flips the monitor trap flag in the processor-based VM-execution
/// controls.
pub fn set_monitor_trap_flag(platform: &dyn Platform, enable: bool) {
    let controls = platform.vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS);
    let mut primary_controls =
        unsafe { vmcs::control::PrimaryControls::from_bits_unchecked(controls as u32) };

    if enable {
        primary_controls.insert(vmcs::control::PrimaryControls::MONITOR_TRAP_FLAG);
    } else {
        primary_controls.remove(vmcs::control::PrimaryControls::MONITOR_TRAP_FLAG);
    }

    platform.vmwrite(
        vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        primary_controls.bits() as u64,
    );
}
