//! Platform abstraction for the services the breakpoint engine consumes.
//!
//! The engine never touches VMX state, control registers, or OS thread
//! identity directly; everything flows through the [`Platform`] trait so
//! the same state machine runs on bare metal (see `intel::support`) and
//! against an emulated guest in tests.

use {
    crate::{error::HypervisorError, intel::vmexit::vmcall::VmcallCommand},
    x86::vmx::vmcs,
};

/// The IRQL at which the registry spin lock is held. A software
/// breakpoint arriving above this level cannot be handled safely.
pub const DISPATCH_LEVEL: u8 = 2;

/// CPU, VMCS, and OS services backing the engine.
pub trait Platform {
    /// Reads a field from the current VMCS.
    fn vmread(&self, field: u32) -> u64;

    /// Writes a field of the current VMCS.
    fn vmwrite(&self, field: u32, value: u64);

    /// Reads the current address-space root.
    fn read_cr3(&self) -> u64;

    /// Loads a new address-space root.
    fn write_cr3(&self, cr3: u64);

    /// Translates a virtual address valid in the current execution
    /// context to a host physical address. Returns 0 when the address
    /// has no translation.
    fn pa_from_va(&self, va: u64) -> u64;

    /// Writes back and invalidates all data caches, system wide. Called
    /// after a trap byte is embedded so instruction fetches through EPT
    /// observe it.
    fn invalidate_caches(&self);

    /// Identity of the guest thread the current processor is running.
    fn current_thread_id(&self) -> u64;

    /// Index of the current logical processor.
    fn current_processor(&self) -> usize;

    /// Current interrupt level (IRQL/TPR) of the processor.
    fn current_interrupt_level(&self) -> u8;

    /// Issues a hypercall into the VMM.
    fn vmcall(&self, command: VmcallCommand) -> Result<(), HypervisorError>;

    /// Stalls the caller for at least `ms` milliseconds. Kernel context
    /// only; never invoked from a VM-exit handler.
    fn sleep_ms(&self, ms: u64);
}

/// Scoped adoption of the guest's address-space root.
///
/// Breakpoint handlers dereference guest pointers, and a guest's user
/// address space is only reachable through the guest CR3 read out of the
/// VMCS. The previous root is restored on drop, on every exit path.
pub struct GuestAddressSpace<'a> {
    platform: &'a dyn Platform,
    saved_cr3: u64,
}

impl<'a> GuestAddressSpace<'a> {
    pub fn enter(platform: &'a dyn Platform) -> Self {
        let saved_cr3 = platform.read_cr3();
        platform.write_cr3(platform.vmread(vmcs::guest::CR3));
        Self { platform, saved_cr3 }
    }
}

impl Drop for GuestAddressSpace<'_> {
    fn drop(&mut self) {
        self.platform.write_cr3(self.saved_cr3);
    }
}
