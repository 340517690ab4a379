use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Breakpoint registry is not initialized")]
    RegistryNotInitialized,

    #[error("Breakpoint registry is already initialized")]
    RegistryAlreadyInitialized,

    #[error("Failed to allocate a shadow page")]
    ShadowPageAllocationFailed,

    #[error("No EPT leaf entry maps the guest physical address")]
    EptLeafEntryNotFound,

    #[error("Monitor trap flag armed while an event is already pending")]
    MonitorTrapSlotOccupied,

    #[error("Monitor trap flag retired with no pending event")]
    MonitorTrapSlotEmpty,

    #[error("Breakpoint taken above dispatch level")]
    InterruptLevelTooHigh,

    #[error("Logical processor index out of range")]
    ProcessorIndexOutOfRange,

    #[error("Pre breakpoint carries no post handler")]
    PostHandlerMissing,

    #[error("Unknown VMCALL command")]
    UnknownVmcallCommand,

    #[error("Hypercall failed")]
    HypercallFailed,
}
