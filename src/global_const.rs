/// The number of logical processors the engine tracks single-step state
/// for. Sized for a high-end desktop system; raise it for larger hosts.
pub const MAX_LOGICAL_PROCESSORS: usize = 64;

/// The software breakpoint opcode (INT3) embedded into execute shadows.
pub const BREAKPOINT_OPCODE: u8 = 0xCC;

/// Capacity of the bounded diagnostic name carried by each breakpoint.
pub const MAX_BREAKPOINT_NAME: usize = 64;

/// How long `terminate` stalls after bulk-disable so that in-flight
/// single-steps retire before the registry is torn down.
pub const TERMINATE_DRAIN_MILLIS: u64 = 500;

/// Conservative TSC frequency estimate used by the busy-wait stall.
/// Overestimating only lengthens the stall, which is harmless here.
pub const TSC_FREQUENCY_MHZ: u64 = 4_000;
