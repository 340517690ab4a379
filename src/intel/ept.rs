//! EPT leaf entries and the interface to the second-level address
//! translation tables the engine programs.
//!
//! The engine only ever touches one 4 KiB leaf entry per operation: the
//! one mapping the guest-physical page a breakpoint lives on. Building,
//! splitting, and walking the tables themselves belongs to the embedding
//! VMM; it hands the engine leaf access through [`EptTable`].
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's
//! Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)

use {crate::error::HypervisorError, bitfield::bitfield, x86::bits64::paging::BASE_PAGE_SHIFT};

bitfield! {
    /// Represents an EPT Page-Table Entry (PTE) that maps a 4-KByte page.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's
    /// Manual: Format of an EPT Page-Table Entry that Maps a 4-KByte Page
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
}

impl Entry {
    /// Builds an identity leaf: full access, frame equal to the guest
    /// physical page itself.
    pub fn identity(guest_page_pa: u64) -> Self {
        let mut entry = Entry(0);
        entry.set_access(AccessType::READ_WRITE_EXECUTE);
        entry.set_pfn(guest_page_pa >> BASE_PAGE_SHIFT);
        entry
    }

    /// Applies an access combination to the permission bits, leaving the
    /// frame and memory type untouched.
    pub fn set_access(&mut self, access: AccessType) {
        self.set_readable(access.contains(AccessType::READ));
        self.set_writable(access.contains(AccessType::WRITE));
        self.set_executable(access.contains(AccessType::EXECUTE));
    }

    /// The host physical address of the frame this entry maps.
    pub fn frame_pa(&self) -> u64 {
        self.pfn() << BASE_PAGE_SHIFT
    }
}

bitflags::bitflags! {
    /// Represents the different access permissions for an EPT entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessType: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

/// Access to the extended page tables of the active guest.
///
/// Implemented by the VMM's EPT hierarchy on hardware and by the
/// emulation harness under test.
pub trait EptTable {
    /// Returns a mutable handle to the 4 KiB leaf entry mapping the page
    /// that contains `guest_pa`. The page must already be mapped with
    /// 4 KiB granularity; the VMM splits large pages before handing
    /// tracked ranges to the engine.
    fn leaf_entry(&mut self, guest_pa: u64) -> Result<&mut Entry, HypervisorError>;

    /// Invalidates EPT-derived translations for all contexts.
    fn invalidate_all(&mut self);
}
