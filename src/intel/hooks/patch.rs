//! Per-breakpoint state: the patched address, its classification, the
//! handlers to run, and shared handles to the two shadow pages covering
//! the patched page.

use {
    crate::{
        error::HypervisorError,
        global_const::{BREAKPOINT_OPCODE, MAX_BREAKPOINT_NAME},
        intel::{
            addresses::{page_base, page_offset},
            capture::GuestRegisters,
            ept::EptTable,
            page::ShadowPage,
        },
        platform::Platform,
    },
    alloc::{boxed::Box, sync::Arc},
    log::debug,
};

/// Bounded diagnostic identifier carried by every breakpoint.
pub type BreakpointName = heapless::String<MAX_BREAKPOINT_NAME>;

/// Classification of a breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Fires at entry to a monitored function.
    Pre,
    /// Fires when a monitored function returns to its caller, armed from
    /// inside a Pre handler and owned by the thread that entered it.
    Post,
}

/// Everything a handler can reach while its breakpoint is being serviced.
///
/// The engine has already adopted the guest's address-space root, so the
/// handler may dereference guest pointers (the stack at `guest_rsp`
/// included) directly.
pub struct HitContext<'a> {
    pub ept: &'a mut dyn EptTable,
    pub platform: &'a dyn Platform,
    pub regs: &'a mut GuestRegisters,
    pub guest_rsp: u64,
}

/// A breakpoint handler. Pre handlers typically capture arguments and
/// arm a Post breakpoint on the return address; Post handlers inspect
/// `record.parameters` against the guest's visible results.
pub type BreakpointHandler = fn(record: &PatchRecord, ctx: &mut HitContext<'_>);

/// The pre/post handler pair registered for one monitored function.
#[derive(Debug, Clone, Copy)]
pub struct BreakpointTarget {
    pub pre_handler: BreakpointHandler,
    pub post_handler: BreakpointHandler,
}

/// A captured copy of the guest's register arguments at the call site,
/// carried from the Pre hit to the eventual Post handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapturedParameters {
    pub rcx: u64,
    pub rdx: u64,
    pub r8: u64,
    pub r9: u64,
}

impl CapturedParameters {
    pub fn from_registers(regs: &GuestRegisters) -> Self {
        Self {
            rcx: regs.rcx,
            rdx: regs.rdx,
            r8: regs.r8,
            r9: regs.r9,
        }
    }
}

/// Shared handles to the two shadow copies of one guest page, plus their
/// cached host frames. Every record patching the same page carries a
/// clone of the same pair.
#[derive(Debug, Clone)]
pub struct ShadowPair {
    pub exec: Arc<ShadowPage>,
    pub rw: Arc<ShadowPage>,
    pub exec_pa: u64,
    pub rw_pa: u64,
}

/// One installed breakpoint.
#[derive(Clone)]
pub struct PatchRecord {
    /// Exact guest virtual address of the patched byte.
    pub address: u64,
    pub kind: BreakpointKind,
    /// Runs when this patch fires.
    pub handler: BreakpointHandler,
    /// For Pre records, the handler a Post breakpoint will run.
    pub post_handler: Option<BreakpointHandler>,
    /// For Post records, the guest thread that armed it.
    pub owner_thread: Option<u64>,
    pub parameters: CapturedParameters,
    pub name: BreakpointName,
    /// Execute view: pristine page with the trap byte embedded.
    pub exec_shadow: Arc<ShadowPage>,
    /// Read/write view: pristine page, reflects guest writes.
    pub rw_shadow: Arc<ShadowPage>,
    /// Host frame of the execute view, cached for EPT programming.
    pub exec_pa: u64,
    /// Host frame of the read/write view, cached for EPT programming.
    pub rw_pa: u64,
}

impl PatchRecord {
    /// Builds a Pre record for `address`. `reusable` is the shadow pair
    /// of any record already patching the same page, if one exists.
    pub fn new_pre(
        address: u64,
        target: &BreakpointTarget,
        name: &str,
        reusable: Option<ShadowPair>,
        platform: &dyn Platform,
    ) -> Result<Box<Self>, HypervisorError> {
        let pair = Self::shadow_pair(address, reusable, platform)?;
        Ok(Box::new(Self {
            address,
            kind: BreakpointKind::Pre,
            handler: target.pre_handler,
            post_handler: Some(target.post_handler),
            owner_thread: None,
            parameters: CapturedParameters::default(),
            name: bounded_name(name),
            exec_shadow: pair.exec,
            rw_shadow: pair.rw,
            exec_pa: pair.exec_pa,
            rw_pa: pair.rw_pa,
        }))
    }

    /// Builds a Post record at `address` from the Pre record whose
    /// handler is arming it, owned by `owner_thread`.
    pub fn new_post(
        address: u64,
        pre: &PatchRecord,
        owner_thread: u64,
        parameters: CapturedParameters,
        reusable: Option<ShadowPair>,
        platform: &dyn Platform,
    ) -> Result<Box<Self>, HypervisorError> {
        let handler = pre.post_handler.ok_or(HypervisorError::PostHandlerMissing)?;
        let pair = Self::shadow_pair(address, reusable, platform)?;
        Ok(Box::new(Self {
            address,
            kind: BreakpointKind::Post,
            handler,
            post_handler: None,
            owner_thread: Some(owner_thread),
            parameters,
            name: pre.name.clone(),
            exec_shadow: pair.exec,
            rw_shadow: pair.rw,
            exec_pa: pair.exec_pa,
            rw_pa: pair.rw_pa,
        }))
    }

    /// The shadow pair covering this record's page.
    pub fn pair(&self) -> ShadowPair {
        ShadowPair {
            exec: self.exec_shadow.clone(),
            rw: self.rw_shadow.clone(),
            exec_pa: self.exec_pa,
            rw_pa: self.rw_pa,
        }
    }

    /// Byte offset of the patched address within its page.
    pub fn offset(&self) -> usize {
        page_offset(self.address)
    }

    /// Resolves or creates the shadow pair for `address` and embeds the
    /// trap byte at this record's offset in the execute copy.
    fn shadow_pair(
        address: u64,
        reusable: Option<ShadowPair>,
        platform: &dyn Platform,
    ) -> Result<ShadowPair, HypervisorError> {
        let pair = match reusable {
            Some(pair) => pair,
            None => {
                let exec = ShadowPage::new()?;
                let rw = ShadowPage::new()?;
                exec.copy_from(page_base(address));
                rw.copy_from(page_base(address));
                debug!(
                    "Shadow pair created for page {:#x}: exec at {:#x}, rw at {:#x}",
                    page_base(address),
                    exec.va(),
                    rw.va()
                );
                let exec_pa = platform.pa_from_va(exec.va());
                let rw_pa = platform.pa_from_va(rw.va());
                ShadowPair { exec, rw, exec_pa, rw_pa }
            }
        };

        // The actual breakpoint exists only on the execute view. Flush
        // data caches so instruction fetches through EPT observe it.
        pair.exec.write_byte(page_offset(address), BREAKPOINT_OPCODE);
        platform.invalidate_caches();

        Ok(pair)
    }
}

/// Truncates `name` into the bounded identifier format.
pub fn bounded_name(name: &str) -> BreakpointName {
    let mut bounded = BreakpointName::new();
    for ch in name.chars() {
        if bounded.push(ch).is_err() {
            break;
        }
    }
    bounded
}
