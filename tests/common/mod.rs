//! Guest-emulation harness.
//!
//! Stands in for the hardware underneath the engine: a mock EPT whose
//! leaf entries the engine programs, a mock platform carrying VMCS
//! fields and thread/processor identity, and a tiny guest that fetches,
//! reads, and writes through whatever view the EPT currently maps,
//! raising the same VM exits real hardware would.

use mirage::{
    handle_breakpoint, handle_ept_violation, handle_monitor_trap_flag, handle_vmcall, Entry,
    EptTable, ExitType, GuestRegisters, HypervisorError, Platform, VmcallCommand,
};
use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    rc::Rc,
    sync::{Mutex, MutexGuard, OnceLock},
};
use x86::vmx::vmcs;

pub const PAGE_SIZE: usize = 4096;
pub const HOST_CR3: u64 = 0x0077_7000;
pub const GUEST_CR3: u64 = 0x00AB_C000;

/// Initial guest RFLAGS: reserved bit 1 plus IF.
pub const GUEST_RFLAGS_IF: u64 = 0x202;

/// The engine keeps process-wide state; tests touching it take this
/// lock so they run one at a time.
pub fn serialize() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn page_base(address: u64) -> u64 {
    address & !(PAGE_SIZE as u64 - 1)
}

/// A page-aligned buffer standing in for one page of guest RAM. The
/// harness runs with an identity mapping, so its host virtual address
/// doubles as the guest physical address.
#[repr(C, align(4096))]
pub struct AlignedPage(pub [u8; PAGE_SIZE]);

pub struct GuestPage(Box<AlignedPage>);

impl GuestPage {
    pub fn new(fill: u8) -> Self {
        Self(Box::new(AlignedPage([fill; PAGE_SIZE])))
    }

    /// Each byte holds the low byte of its own offset, so tests can tell
    /// offsets apart when reading through the shadow views.
    pub fn new_patterned() -> Self {
        let mut page = Self::new(0);
        for offset in 0..PAGE_SIZE {
            page.0 .0[offset] = offset as u8;
        }
        page
    }

    pub fn base(&self) -> u64 {
        self.0.as_ref() as *const AlignedPage as u64
    }

    pub fn va(&self, offset: usize) -> u64 {
        self.base() + offset as u64
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.0 .0[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

/// EPT leaves, auto-populated with identity entries on first touch the
/// way a VMM's pre-split tables would present them.
pub struct MockEpt {
    entries: BTreeMap<u64, Entry>,
    pub invalidations: usize,
}

impl MockEpt {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            invalidations: 0,
        }
    }

    pub fn entry(&self, guest_pa: u64) -> Entry {
        let base = page_base(guest_pa);
        self.entries
            .get(&base)
            .copied()
            .unwrap_or_else(|| Entry::identity(base))
    }

    /// Host address the current view maps `guest_pa` to.
    pub fn frame_pa(&self, guest_pa: u64) -> u64 {
        self.entry(guest_pa).frame_pa() + (guest_pa & (PAGE_SIZE as u64 - 1))
    }

    /// Whether the page is back to its own frame with full access.
    pub fn is_identity(&self, guest_pa: u64) -> bool {
        let entry = self.entry(guest_pa);
        entry.frame_pa() == page_base(guest_pa)
            && entry.readable()
            && entry.writable()
            && entry.executable()
    }

    /// Whether the page shows the armed execute-only shadow view.
    pub fn is_exec_shadowed(&self, guest_pa: u64) -> bool {
        let entry = self.entry(guest_pa);
        entry.executable()
            && !entry.readable()
            && !entry.writable()
            && entry.frame_pa() != page_base(guest_pa)
    }
}

impl EptTable for MockEpt {
    fn leaf_entry(&mut self, guest_pa: u64) -> Result<&mut Entry, HypervisorError> {
        let base = page_base(guest_pa);
        Ok(self
            .entries
            .entry(base)
            .or_insert_with(|| Entry::identity(base)))
    }

    fn invalidate_all(&mut self) {
        self.invalidations += 1;
    }
}

pub struct MockPlatform {
    pub ept: Rc<RefCell<MockEpt>>,
    vmcs_fields: RefCell<BTreeMap<u32, u64>>,
    cr3: Cell<u64>,
    /// Every value written to CR3, in order.
    pub cr3_writes: RefCell<Vec<u64>>,
    pub thread_id: Cell<u64>,
    pub processor: Cell<usize>,
    pub irql: Cell<u8>,
    pub slept_ms: Cell<u64>,
    pub cache_flushes: Cell<usize>,
}

impl MockPlatform {
    pub fn new() -> Self {
        let platform = Self {
            ept: Rc::new(RefCell::new(MockEpt::new())),
            vmcs_fields: RefCell::new(BTreeMap::new()),
            cr3: Cell::new(HOST_CR3),
            cr3_writes: RefCell::new(Vec::new()),
            thread_id: Cell::new(1),
            processor: Cell::new(0),
            irql: Cell::new(0),
            slept_ms: Cell::new(0),
            cache_flushes: Cell::new(0),
        };
        platform.vmwrite(vmcs::guest::CR3, GUEST_CR3);
        platform.vmwrite(vmcs::guest::RFLAGS, GUEST_RFLAGS_IF);
        platform
    }

    pub fn set_guest_rsp(&self, rsp: u64) {
        self.vmwrite(vmcs::guest::RSP, rsp);
    }

    pub fn guest_rflags(&self) -> u64 {
        self.vmread(vmcs::guest::RFLAGS)
    }

    pub fn mtf_armed(&self) -> bool {
        let controls = self.vmread(vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS) as u32;
        controls & vmcs::control::PrimaryControls::MONITOR_TRAP_FLAG.bits() != 0
    }
}

impl Platform for MockPlatform {
    fn vmread(&self, field: u32) -> u64 {
        self.vmcs_fields
            .borrow()
            .get(&field)
            .copied()
            .unwrap_or(0)
    }

    fn vmwrite(&self, field: u32, value: u64) {
        self.vmcs_fields.borrow_mut().insert(field, value);
    }

    fn read_cr3(&self) -> u64 {
        self.cr3.get()
    }

    fn write_cr3(&self, cr3: u64) {
        self.cr3.set(cr3);
        self.cr3_writes.borrow_mut().push(cr3);
    }

    fn pa_from_va(&self, va: u64) -> u64 {
        va
    }

    fn invalidate_caches(&self) {
        self.cache_flushes.set(self.cache_flushes.get() + 1);
    }

    fn current_thread_id(&self) -> u64 {
        self.thread_id.get()
    }

    fn current_processor(&self) -> usize {
        self.processor.get()
    }

    fn current_interrupt_level(&self) -> u8 {
        self.irql.get()
    }

    /// Stands in for the hypercall glue: routes the opcode straight into
    /// the VMM-side dispatch against this platform's EPT.
    fn vmcall(&self, command: VmcallCommand) -> Result<(), HypervisorError> {
        let ept = self.ept.clone();
        let result = handle_vmcall(command as u64, &mut *ept.borrow_mut(), self).map(|_| ());
        result
    }

    fn sleep_ms(&self, ms: u64) {
        self.slept_ms.set(self.slept_ms.get() + ms);
    }
}

/// Outcome of a simulated instruction fetch at a guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The instruction byte that actually executed.
    Executed(u8),
    /// The engine disowned the #BP; the guest receives its exception.
    GuestBreakpoint,
}

/// Drives guest-visible memory operations through the current EPT view,
/// raising #BP, EPT-violation, and MTF exits exactly where hardware
/// would.
pub struct Guest<'a> {
    pub platform: &'a MockPlatform,
}

impl<'a> Guest<'a> {
    pub fn new(platform: &'a MockPlatform) -> Self {
        Self { platform }
    }

    pub fn read(&self, va: u64) -> u8 {
        loop {
            let (readable, frame) = {
                let ept = self.platform.ept.borrow();
                let entry = ept.entry(va);
                (entry.readable(), ept.frame_pa(va))
            };
            if readable {
                let byte = unsafe { std::ptr::read_volatile(frame as *const u8) };
                self.retire();
                return byte;
            }
            self.fault(va);
        }
    }

    pub fn write(&self, va: u64, value: u8) {
        loop {
            let (writable, frame) = {
                let ept = self.platform.ept.borrow();
                let entry = ept.entry(va);
                (entry.writable(), ept.frame_pa(va))
            };
            if writable {
                unsafe { std::ptr::write_volatile(frame as *mut u8, value) };
                self.retire();
                return;
            }
            self.fault(va);
        }
    }

    /// Fetches and "executes" one instruction at `va`, dispatching a #BP
    /// exit when the fetched byte is the trap opcode.
    pub fn execute(&self, va: u64, regs: &mut GuestRegisters) -> ExecOutcome {
        regs.rip = va;
        loop {
            let (executable, frame) = {
                let ept = self.platform.ept.borrow();
                let entry = ept.entry(va);
                (entry.executable(), ept.frame_pa(va))
            };
            if !executable {
                self.fault(va);
                continue;
            }

            let byte = unsafe { std::ptr::read_volatile(frame as *const u8) };
            if byte == 0xCC {
                let ept = self.platform.ept.clone();
                let exit =
                    handle_breakpoint(&mut *ept.borrow_mut(), self.platform, regs).unwrap();
                match exit {
                    ExitType::ReinjectExceptionToGuest => return ExecOutcome::GuestBreakpoint,
                    ExitType::Continue => continue,
                    other => panic!("unexpected #BP exit disposition: {other:?}"),
                }
            }

            self.retire();
            return ExecOutcome::Executed(byte);
        }
    }

    fn fault(&self, va: u64) {
        let ept = self.platform.ept.clone();
        let exit = handle_ept_violation(&mut *ept.borrow_mut(), self.platform, va).unwrap();
        assert_eq!(
            exit,
            ExitType::Continue,
            "EPT violation at {va:#x} was not claimed by the engine"
        );
    }

    /// Instruction boundary: if a single-step is armed, the monitor trap
    /// fires now. Interrupts must have been held off for the step.
    fn retire(&self) {
        if self.platform.mtf_armed() {
            assert_eq!(
                self.platform.guest_rflags() & 0x200,
                0,
                "guest IF must be clear while single-stepping"
            );
            let ept = self.platform.ept.clone();
            handle_monitor_trap_flag(&mut *ept.borrow_mut(), self.platform).unwrap();
        }
    }
}
