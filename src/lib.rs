//! This crate implements a stealth breakpoint engine for an Intel VT-x
//! hypervisor. It presents two views of a patched guest page through EPT:
//! an execute-only shadow carrying the 0xCC trap byte and a read/write
//! shadow carrying the pristine bytes, and swaps between them on VM exits
//! so the guest can never read its own breakpoints.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
extern crate static_assertions;

pub mod error;
pub mod global_const;
pub mod intel;
pub mod platform;

pub use crate::{
    error::HypervisorError,
    intel::{
        capture::GuestRegisters,
        ept::{AccessType, Entry, EptTable},
        hooks::{
            engine::{initialize, install_and_enable_post, install_pre, start, terminate},
            patch::{BreakpointKind, BreakpointTarget, CapturedParameters, HitContext, PatchRecord},
        },
        vmexit::{
            breakpoint::handle_breakpoint, ept_violation::handle_ept_violation,
            mtf::handle_monitor_trap_flag, vmcall::handle_vmcall, vmcall::VmcallCommand, ExitType,
        },
    },
    platform::{GuestAddressSpace, Platform},
};
