pub mod breakpoint;
pub mod ept_violation;
pub mod mtf;
pub mod vmcall;

/// What the exit dispatcher should do after an entry point returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Resume the guest at the same instruction.
    Continue,
    /// Advance the guest past the exiting instruction.
    IncrementRip,
    /// The event was not ours; deliver the exception to the guest.
    ReinjectExceptionToGuest,
    /// The event was not ours; the dispatcher handles it by other means.
    Unhandled,
}
