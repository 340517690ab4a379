//! Hypercall opcodes and the VMM-side dispatch for bulk shadowing
//! control. Kernel-context callers reach these through
//! `Platform::vmcall`; the VMM's exit dispatcher routes the resulting
//! VMCALL exit here.

use {
    crate::{
        error::HypervisorError,
        intel::{ept::EptTable, hooks::engine, vmexit::ExitType},
        platform::Platform,
    },
    log::debug,
};

/// Represents the VMCALL commands the engine understands.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmcallCommand {
    /// Arm the execute shadow for every installed breakpoint.
    EnablePageShadowing = 0,
    /// Restore identity mappings for every installed breakpoint.
    DisablePageShadowing = 1,
}

impl VmcallCommand {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::EnablePageShadowing),
            1 => Some(Self::DisablePageShadowing),
            _ => None,
        }
    }
}

/// Handles a VMCALL VM exit carrying one of the engine's commands.
pub fn handle_vmcall(
    command: u64,
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
) -> Result<ExitType, HypervisorError> {
    let command = VmcallCommand::from_u64(command).ok_or(HypervisorError::UnknownVmcallCommand)?;
    debug!("Handling VMCALL command {:?}", command);

    match command {
        VmcallCommand::EnablePageShadowing => engine::enable_all(ept, platform)?,
        VmcallCommand::DisablePageShadowing => engine::disable_all(ept, platform)?,
    }

    Ok(ExitType::IncrementRip)
}
