//! Per-processor single-step state.
//!
//! Each logical processor runs at most one shadow single-step at a time:
//! the slot holds the event awaiting monitor-trap completion, and the
//! saved guest interrupt flag to put back when it retires. The slot is
//! occupied if and only if the monitor trap flag is armed on that
//! processor.

use {
    crate::{
        error::HypervisorError, global_const::MAX_LOGICAL_PROCESSORS,
        intel::hooks::patch::PatchRecord, intel::page::ShadowPage, platform::Platform,
    },
    alloc::sync::Arc,
    spin::Mutex,
};

/// Snapshot of the breakpoint whose single-step is in flight: everything
/// the monitor-trap exit needs to re-arm the execute view. The `Arc`
/// pins the execute shadow even if the record is torn down mid-step.
#[derive(Debug, Clone)]
pub struct LastEvent {
    /// Patched guest virtual address, for diagnostics.
    pub address: u64,
    /// Physical address of the patched byte, locating the EPT leaf.
    pub patch_pa: u64,
    /// Host frame of the execute shadow to restore.
    pub exec_pa: u64,
    pub exec_shadow: Arc<ShadowPage>,
}

impl LastEvent {
    pub fn from_record(record: &PatchRecord, platform: &dyn Platform) -> Self {
        Self {
            address: record.address,
            patch_pa: platform.pa_from_va(record.address),
            exec_pa: record.exec_pa,
            exec_shadow: record.exec_shadow.clone(),
        }
    }
}

/// State the engine keeps per logical processor.
pub struct PerCpuState {
    pub last_event: Option<LastEvent>,
    pub saved_interrupt_flag: bool,
}

impl PerCpuState {
    const fn new() -> Self {
        Self {
            last_event: None,
            saved_interrupt_flag: false,
        }
    }
}

const INIT: Mutex<PerCpuState> = Mutex::new(PerCpuState::new());
static PER_CPU_STATE: [Mutex<PerCpuState>; MAX_LOGICAL_PROCESSORS] = [INIT; MAX_LOGICAL_PROCESSORS];

/// Runs `f` against the current processor's state. The lock is never
/// contended (VM exits are serialized per processor); it exists so the
/// array can be a plain static.
pub fn with_cpu<R>(
    platform: &dyn Platform,
    f: impl FnOnce(&mut PerCpuState) -> R,
) -> Result<R, HypervisorError> {
    let slot = PER_CPU_STATE
        .get(platform.current_processor())
        .ok_or(HypervisorError::ProcessorIndexOutOfRange)?;
    Ok(f(&mut slot.lock()))
}

/// Clears every processor's slot. Teardown only.
pub fn reset() {
    for slot in PER_CPU_STATE.iter() {
        let mut state = slot.lock();
        state.last_event = None;
        state.saved_interrupt_flag = false;
    }
}
