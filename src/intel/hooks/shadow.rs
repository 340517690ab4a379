//! EPT programming for page shadowing.
//!
//! Exactly one leaf entry is touched per call: the one mapping the
//! guest-physical page the patched address lives on. Every mutation is
//! followed by a global invalidation of EPT-derived translations.

use {
    crate::{
        error::HypervisorError,
        intel::{
            addresses::PhysicalAddress,
            ept::{AccessType, EptTable},
            hooks::patch::PatchRecord,
        },
        platform::Platform,
    },
    log::trace,
    x86::bits64::paging::BASE_PAGE_SHIFT,
};

/// Shows the execute shadow to the guest: execute-only permissions force
/// reads and writes onto the EPT-violation path, and the backing frame
/// carries the trap byte. This is the armed state.
pub fn enable_exec(
    record: &PatchRecord,
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
) -> Result<(), HypervisorError> {
    trace!("Arming exec shadow for {:#x} ({})", record.address, record.name);
    program(
        ept,
        platform.pa_from_va(record.address),
        record.exec_pa,
        AccessType::EXECUTE,
    )
}

/// Shows the read/write shadow: full permissions on the pristine copy,
/// good for exactly the one instruction the monitor trap flag bounds.
pub fn enable_rw(
    record: &PatchRecord,
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
) -> Result<(), HypervisorError> {
    trace!("Exposing rw shadow for {:#x} ({})", record.address, record.name);
    program(
        ept,
        platform.pa_from_va(record.address),
        record.rw_pa,
        AccessType::READ_WRITE_EXECUTE,
    )
}

/// Restores the identity mapping: full permissions, frame equal to the
/// guest page itself. Removes all shadowing for the page.
pub fn disable(
    record: &PatchRecord,
    ept: &mut dyn EptTable,
    platform: &dyn Platform,
) -> Result<(), HypervisorError> {
    trace!("Disabling shadowing for {:#x} ({})", record.address, record.name);
    let patch_pa = platform.pa_from_va(record.address);
    let identity = PhysicalAddress::from_pa(patch_pa).frame_base();
    program(ept, patch_pa, identity, AccessType::READ_WRITE_EXECUTE)
}

/// Re-arms the execute shadow from raw frame addresses. The monitor-trap
/// path uses this with its saved event snapshot.
pub fn enable_exec_frames(
    ept: &mut dyn EptTable,
    patch_pa: u64,
    exec_pa: u64,
) -> Result<(), HypervisorError> {
    program(ept, patch_pa, exec_pa, AccessType::EXECUTE)
}

fn program(
    ept: &mut dyn EptTable,
    patch_pa: u64,
    frame_pa: u64,
    access: AccessType,
) -> Result<(), HypervisorError> {
    {
        let entry = ept.leaf_entry(patch_pa)?;
        entry.set_access(access);
        entry.set_pfn(frame_pa >> BASE_PAGE_SHIFT);
    }
    ept.invalidate_all();
    Ok(())
}
