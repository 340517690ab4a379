//! The authoritative set of live breakpoints.
//!
//! One module-scoped singleton guarded by a spin lock, which is the
//! dispatch-level mutual-exclusion primitive here: waiters spin and
//! never block, so the lock is safe to take from VM-exit context as
//! well as from kernel-context registration paths.

use {
    crate::{
        error::HypervisorError,
        intel::{
            addresses::same_page,
            hooks::patch::{BreakpointKind, CapturedParameters, PatchRecord, ShadowPair},
        },
    },
    alloc::{boxed::Box, vec::Vec},
    lazy_static::lazy_static,
    spin::Mutex,
};

/// Holds all currently installed breakpoints.
pub struct Registry {
    breakpoints: Vec<Box<PatchRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            breakpoints: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn insert(&mut self, record: Box<PatchRecord>) {
        self.breakpoints.push(record);
    }

    /// Removes the unique record matching `(address, owner_thread)`.
    /// Returns whether a record was removed.
    pub fn erase(&mut self, address: u64, owner_thread: Option<u64>) -> bool {
        let before = self.breakpoints.len();
        self.breakpoints
            .retain(|record| !(record.address == address && record.owner_thread == owner_thread));
        self.breakpoints.len() != before
    }

    /// Exact match on the patched address.
    pub fn find_by_address(&self, address: u64) -> Option<&PatchRecord> {
        self.breakpoints
            .iter()
            .map(|record| &**record)
            .find(|record| record.address == address)
    }

    /// Any record whose patched address shares a page with `address`.
    pub fn find_by_page(&self, address: u64) -> Option<&PatchRecord> {
        self.breakpoints
            .iter()
            .map(|record| &**record)
            .find(|record| same_page(record.address, address))
    }

    /// A Post record on the same page as `address` owned by `thread`.
    /// At most one such record exists; duplicate installations overwrite
    /// its captured parameters instead of inserting a second one.
    pub fn find_duplicate_post_mut(&mut self, address: u64, thread: u64) -> Option<&mut PatchRecord> {
        self.breakpoints
            .iter_mut()
            .map(|record| &mut **record)
            .find(|record| {
                record.kind == BreakpointKind::Post
                    && same_page(record.address, address)
                    && record.owner_thread == Some(thread)
            })
    }

    /// The reusable shadow pair of any record already patching the page
    /// containing `address`.
    pub fn shadow_pair_for_page(&self, address: u64) -> Option<ShadowPair> {
        self.find_by_page(address).map(PatchRecord::pair)
    }

    pub fn records(&self) -> impl Iterator<Item = &PatchRecord> {
        self.breakpoints.iter().map(|record| &**record)
    }
}

lazy_static! {
    /// The engine-wide breakpoint registry. `None` until `initialize`
    /// runs and again after `terminate`; every consumer treats that as
    /// "engine inactive".
    static ref SHADOW_BREAKPOINTS: Mutex<Option<Registry>> = Mutex::new(None);
}

/// Creates the empty registry.
pub fn init() -> Result<(), HypervisorError> {
    let mut registry = SHADOW_BREAKPOINTS.lock();
    if registry.is_some() {
        return Err(HypervisorError::RegistryAlreadyInitialized);
    }
    *registry = Some(Registry::new());
    Ok(())
}

/// Destroys the registry, releasing every record and, through them, the
/// shadow pages they were the last to reference.
pub fn teardown() {
    *SHADOW_BREAKPOINTS.lock() = None;
}

pub fn is_active() -> bool {
    SHADOW_BREAKPOINTS.lock().is_some()
}

/// Runs `f` against the registry under the lock. Callers must not invoke
/// user-supplied handlers from within `f`.
pub fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> Result<R, HypervisorError> {
    let mut registry = SHADOW_BREAKPOINTS.lock();
    match registry.as_mut() {
        Some(registry) => Ok(f(registry)),
        None => Err(HypervisorError::RegistryNotInitialized),
    }
}

/// Cloned snapshot of the record at exactly `address`, or `None` when the
/// engine is inactive or the address is untracked.
///
/// Exit handlers act on snapshots outside the lock. That is sound
/// because VM exits are serialized per processor and the only removal
/// path (a Post consumed on its owner thread) runs on the processor that
/// took the snapshot.
pub fn snapshot_by_address(address: u64) -> Option<PatchRecord> {
    SHADOW_BREAKPOINTS
        .lock()
        .as_ref()?
        .find_by_address(address)
        .cloned()
}

/// Cloned snapshot of any record on the page containing `address`.
pub fn snapshot_by_page(address: u64) -> Option<PatchRecord> {
    SHADOW_BREAKPOINTS
        .lock()
        .as_ref()?
        .find_by_page(address)
        .cloned()
}

/// Whether any record still patches the page containing `address`.
pub fn page_tracked(address: u64) -> bool {
    SHADOW_BREAKPOINTS
        .lock()
        .as_ref()
        .map(|registry| registry.find_by_page(address).is_some())
        .unwrap_or(false)
}

/// Overwrites the captured parameters of an existing Post record for
/// `(page of address, thread)` in place. Returns whether one existed.
pub fn update_duplicate_post(
    address: u64,
    thread: u64,
    parameters: CapturedParameters,
) -> Result<bool, HypervisorError> {
    with_registry(|registry| {
        if let Some(duplicate) = registry.find_duplicate_post_mut(address, thread) {
            duplicate.parameters = parameters;
            true
        } else {
            false
        }
    })
}
