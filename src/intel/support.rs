//! The bare-metal [`Platform`] implementation, backed by VMX and raw
//! processor state. Runs inside the VMM (exit handlers) and in the
//! virtualized kernel context (registration paths); the guest-emulation
//! harness under `tests/` replaces it entirely.

use {
    crate::{
        error::HypervisorError, global_const::TSC_FREQUENCY_MHZ,
        intel::vmexit::vmcall::VmcallCommand, platform::Platform,
    },
    core::arch::asm,
    log::error,
    x86::vmx::vmcs,
};

/// Byte offset of `Prcb.CurrentThread` from the KPCR base held in the
/// kernel GS base. Stable across x64 Windows builds.
const KPCR_CURRENT_THREAD: u64 = 0x188;

/// Mask selecting the physical frame bits of a paging-structure entry.
const PT_ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;

pub struct VmxPlatform;

impl Platform for VmxPlatform {
    /// Reads a specified field from the current VMCS.
    fn vmread(&self, field: u32) -> u64 {
        unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
    }

    /// Writes to a specified field in the current VMCS.
    fn vmwrite(&self, field: u32, value: u64) {
        unsafe { x86::bits64::vmx::vmwrite(field, value) }.unwrap();
    }

    fn read_cr3(&self) -> u64 {
        unsafe { x86::controlregs::cr3() }
    }

    fn write_cr3(&self, cr3: u64) {
        unsafe { x86::controlregs::cr3_write(cr3) };
    }

    /// VMM allocations live in the identity-mapped low half; patched
    /// guest addresses are kernel-half and walked through the guest's
    /// page tables. Returns 0 when no translation exists.
    fn pa_from_va(&self, va: u64) -> u64 {
        if (va as i64) >= 0 {
            return va;
        }
        match self.walk_guest_tables(va) {
            Some(pa) => pa,
            None => {
                error!("No guest translation for {:#x}", va);
                0
            }
        }
    }

    /// Write back all modified cache contents to memory and invalidate
    /// the caches.
    fn invalidate_caches(&self) {
        unsafe { asm!("wbinvd", options(nostack, nomem)) };
    }

    /// The running guest thread, read out of the KPCR the guest's GS
    /// base points at. The KTHREAD address is the identity key.
    fn current_thread_id(&self) -> u64 {
        let kpcr = self.vmread(vmcs::guest::GS_BASE);
        if kpcr == 0 {
            return 0;
        }
        let pa = self.pa_from_va(kpcr.wrapping_add(KPCR_CURRENT_THREAD));
        if pa == 0 {
            return 0;
        }
        unsafe { core::ptr::read_volatile(pa as *const u64) }
    }

    fn current_processor(&self) -> usize {
        x86::cpuid::CpuId::new()
            .get_feature_info()
            .map(|info| info.initial_local_apic_id() as usize)
            .unwrap_or(0)
    }

    /// IRQL tracks the task-priority register on x64.
    fn current_interrupt_level(&self) -> u8 {
        let cr8: u64;
        unsafe { asm!("mov {}, cr8", out(reg) cr8, options(nomem, nostack)) };
        cr8 as u8
    }

    fn vmcall(&self, command: VmcallCommand) -> Result<(), HypervisorError> {
        let mut status = command as u64;
        unsafe { asm!("vmcall", inout("rax") status, options(nostack)) };
        if status == 0 {
            Ok(())
        } else {
            Err(HypervisorError::HypercallFailed)
        }
    }

    /// TSC busy-wait. The frequency estimate errs high, so the stall
    /// only ever lengthens.
    fn sleep_ms(&self, ms: u64) {
        let deadline = rdtsc() + ms * TSC_FREQUENCY_MHZ * 1_000;
        while rdtsc() < deadline {
            core::hint::spin_loop();
        }
    }
}

impl VmxPlatform {
    /// Translates a guest kernel virtual address through the guest's
    /// 4-level page tables, honoring 1 GiB and 2 MiB large pages. The
    /// tables themselves are reached through the identity mapping.
    fn walk_guest_tables(&self, va: u64) -> Option<u64> {
        let mut table = self.vmread(vmcs::guest::CR3) & PT_ADDRESS_MASK;

        for level in 0..4 {
            let shift = 39 - level * 9;
            let index = (va >> shift) & 0x1FF;
            let entry = unsafe { core::ptr::read_volatile((table + index * 8) as *const u64) };

            // Present bit
            if entry & 1 == 0 {
                return None;
            }

            // Large-page mappings terminate the walk early.
            if level == 1 && entry & (1 << 7) != 0 {
                return Some((entry & 0x000F_FFFF_C000_0000) + (va & 0x3FFF_FFFF));
            }
            if level == 2 && entry & (1 << 7) != 0 {
                return Some((entry & 0x000F_FFFF_FFE0_0000) + (va & 0x1F_FFFF));
            }
            if level == 3 {
                return Some((entry & PT_ADDRESS_MASK) + (va & 0xFFF));
            }

            table = entry & PT_ADDRESS_MASK;
        }

        None
    }
}

/// Returns the timestamp counter value.
fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}
