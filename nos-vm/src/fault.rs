//! Page fault resolution
//!
//! Every fault delivered to [`AddressSpace::handle_fault`] is classified into
//! one of three outcomes:
//!
//! - **fatal**: the access is illegal and the process is terminated
//! - **grow-stack**: an access just below the stack pointer gets a fresh
//!   anonymous page
//! - **claim**: the page exists in the supplemental page table but holds no
//!   frame, so one is obtained and filled
//!
//! Faults on present mappings are always fatal: the only way to get one is a
//! write to a read-only page, and copy-on-write sharing is not supported.
//!
//! [`AddressSpace::handle_fault`]: crate::address_space::AddressSpace::handle_fault

use core::fmt;

use bitflags::bitflags;
use nos_api::VirtAddr;

use crate::config::VmConfig;
use crate::error::VmError;
use crate::page::PageRef;
use crate::spt::SupplementalPageTable;

bitflags! {
    /// Page fault error code bits, laid out as on x86
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FaultFlags: u32 {
        /// The translation was present (protection violation)
        const PRESENT = 1 << 0;
        /// The access was a write
        const WRITE = 1 << 1;
        /// The access came from user mode
        const USER = 1 << 2;
    }
}

/// A page fault as reported by the trap handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Faulting address
    pub addr: VirtAddr,
    pub flags: FaultFlags,
    /// User stack pointer at the time of the fault. For faults taken in
    /// kernel mode this is the value saved on entry to the kernel.
    pub stack_pointer: VirtAddr,
}

impl PageFault {
    pub fn new(
        addr: VirtAddr,
        is_user: bool,
        is_write: bool,
        is_present: bool,
        stack_pointer: VirtAddr,
    ) -> Self {
        let mut flags = FaultFlags::empty();
        flags.set(FaultFlags::USER, is_user);
        flags.set(FaultFlags::WRITE, is_write);
        flags.set(FaultFlags::PRESENT, is_present);
        Self {
            addr,
            flags,
            stack_pointer,
        }
    }

    /// Builds a fault from a raw hardware error code
    pub fn from_error_code(addr: VirtAddr, code: u32, stack_pointer: VirtAddr) -> Self {
        Self {
            addr,
            flags: FaultFlags::from_bits_truncate(code),
            stack_pointer,
        }
    }

    pub fn is_user(&self) -> bool {
        self.flags.contains(FaultFlags::USER)
    }

    pub fn is_write(&self) -> bool {
        self.flags.contains(FaultFlags::WRITE)
    }

    pub fn is_present(&self) -> bool {
        self.flags.contains(FaultFlags::PRESENT)
    }
}

/// Why a process is being terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalFault {
    /// Null, kernel or otherwise non-user address
    BadAddress(VirtAddr),
    /// No page here and not a stack access
    Unmapped(VirtAddr),
    /// Write to a page mapped read-only
    WriteToReadOnly(VirtAddr),
    /// Protection fault on a present, writable mapping (copy-on-write)
    WriteProtect(VirtAddr),
    /// The page could not be brought in
    ClaimFailed { addr: VirtAddr, error: VmError },
}

impl FatalFault {
    /// Exit status of a process killed by a fatal fault
    pub const EXIT_CODE: i32 = -1;

    pub fn exit_code(&self) -> i32 {
        Self::EXIT_CODE
    }

    pub fn addr(&self) -> VirtAddr {
        match self {
            FatalFault::BadAddress(addr)
            | FatalFault::Unmapped(addr)
            | FatalFault::WriteToReadOnly(addr)
            | FatalFault::WriteProtect(addr) => *addr,
            FatalFault::ClaimFailed { addr, .. } => *addr,
        }
    }
}

impl fmt::Display for FatalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalFault::BadAddress(addr) => write!(f, "bad address {}", addr),
            FatalFault::Unmapped(addr) => write!(f, "unmapped address {}", addr),
            FatalFault::WriteToReadOnly(addr) => write!(f, "write to read-only page {}", addr),
            FatalFault::WriteProtect(addr) => write!(f, "write-protect fault at {}", addr),
            FatalFault::ClaimFailed { addr, error } => {
                write!(f, "cannot bring in {}: {}", addr, error)
            }
        }
    }
}

/// Outcome of [`AddressSpace::handle_fault`](crate::address_space::AddressSpace::handle_fault)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultResolution {
    /// The faulting instruction can be restarted
    Handled,
    /// The process must exit with [`FatalFault::exit_code`]
    Terminate(FatalFault),
}

impl FaultResolution {
    pub fn is_handled(&self) -> bool {
        matches!(self, FaultResolution::Handled)
    }
}

/// What the address space must do about a fault
pub(crate) enum FaultAction {
    /// Nothing: another thread already brought the page in
    Resolved,
    GrowStack(VirtAddr),
    Claim(PageRef),
    Fatal(FatalFault),
}

pub(crate) fn classify(
    config: &VmConfig,
    spt: &SupplementalPageTable,
    fault: &PageFault,
) -> FaultAction {
    let addr = fault.addr;
    if addr.is_null() || !config.is_user_address(addr) {
        return FaultAction::Fatal(FatalFault::BadAddress(addr));
    }

    let Some(page) = spt.find(addr) else {
        if !fault.is_present() && config.is_stack_growth(addr, fault.stack_pointer) {
            return FaultAction::GrowStack(addr.page_round_down());
        }
        return FaultAction::Fatal(FatalFault::Unmapped(addr));
    };

    let (writable, resident) = {
        let page = page.lock();
        (page.writable(), page.is_resident())
    };

    if fault.is_write() && !writable {
        return FaultAction::Fatal(FatalFault::WriteToReadOnly(addr));
    }
    if fault.is_present() {
        return FaultAction::Fatal(FatalFault::WriteProtect(addr));
    }
    if resident {
        return FaultAction::Resolved;
    }
    FaultAction::Claim(page)
}
