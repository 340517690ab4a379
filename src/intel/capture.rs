//! Guest general-purpose register state handed to the VM-exit entry
//! points by the exit dispatcher, and from there to breakpoint handlers.

/// Represents the state of guest general-purpose registers along with
/// RFLAGS, RSP, and RIP at the time of a VM exit.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}
