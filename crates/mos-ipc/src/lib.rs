//! ABI Constants & Gateway Contract for MOS
//!
//! This crate defines:
//! - **Syscall numbers** (Environment → Kernel operations)
//! - **Error codes** ([`Errno`], negative on the wire)
//! - **Page permissions** ([`Perm`]) and the user address-space layout
//! - **File-open modes** ([`OpenMode`]) and FS-IPC request codes
//! - **The syscall gateway** ([`Syscalls`]) every user runtime is written against
//!
//! It is the **single source of truth** for all protocol constants shared by
//! the kernel state machine, the hosted machine and the user runtime.
//!
//! # Syscall Number Ranges
//!
//! | Range | Category |
//! |-------|----------|
//! | 0x01-0x0F | Misc (console, env id, yield, panic) |
//! | 0x10-0x1F | Environment (alloc, destroy, status, trapframe, pgfault) |
//! | 0x20-0x2F | Memory (alloc, map, unmap) |
//! | 0x40-0x4F | IPC (can_send, recv) |
//!
//! # User Address Space
//!
//! ```text
//!  UTOP, UXSTACKTOP -> +------------------------------+ 0x7f40_0000
//!                      |   exception stack (1 page)   |
//!                      +------------------------------+ 0x7f3f_f000
//!                      |   PFTEMP (fault scratch)     |
//!  USTACKTOP ->        +------------------------------+ 0x7f3f_e000
//!                      |   user stack                 |
//!                      ~                              ~
//!  FILEBASE ->         +------------------------------+ 0x6000_0000
//!                      |   fd table (MAXFD pages)     |
//!  FDTABLE ->          +------------------------------+ 0x5fc0_0000
//!                      ~                              ~
//!                      |   FS-IPC request pages       | 0x0fff_e000
//!                      ~                              ~
//!  UTEXT ->            +------------------------------+ 0x0040_0000
//!                      |   UTEMP                      |
//!                      +------------------------------+ 0x0000_0000
//! ```

#![no_std]
extern crate alloc;

mod errno;
mod gateway;

pub use errno::Errno;
pub use gateway::{IpcDelivery, MemFault, Resume, Syscalls, Trapframe};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Environment identifier. `0` always means "the calling environment".
pub type EnvId = u32;

/// User virtual address.
pub type Va = u32;

// =============================================================================
// Syscall Numbers (Environment → Kernel operations)
// =============================================================================

/// Syscall numbers, used by the kernel audit log and the step function.
pub mod syscall {
    // === Misc (0x01 - 0x0F) ===
    /// Write one character to the console
    pub const SYS_PUTCHAR: u32 = 0x01;
    /// Get the caller's environment id
    pub const SYS_GETENVID: u32 = 0x02;
    /// Yield the CPU
    pub const SYS_YIELD: u32 = 0x03;
    /// Report a fatal error and terminate the caller
    pub const SYS_PANIC: u32 = 0x04;
    /// Read one character from the console (0 = none available)
    pub const SYS_CGETC: u32 = 0x05;

    // === Environment (0x10 - 0x1F) ===
    /// Allocate a child environment (not runnable)
    pub const SYS_ENV_ALLOC: u32 = 0x10;
    /// Destroy an environment
    pub const SYS_ENV_DESTROY: u32 = 0x11;
    /// Set an environment's run status
    pub const SYS_SET_ENV_STATUS: u32 = 0x12;
    /// Replace an environment's trapframe
    pub const SYS_SET_TRAPFRAME: u32 = 0x13;
    /// Register the page-fault entry and exception stack
    pub const SYS_SET_PGFAULT_HANDLER: u32 = 0x14;

    // === Memory (0x20 - 0x2F) ===
    /// Allocate a zeroed page at a virtual address
    pub const SYS_MEM_ALLOC: u32 = 0x20;
    /// Map a page from one environment into another
    pub const SYS_MEM_MAP: u32 = 0x21;
    /// Remove a mapping
    pub const SYS_MEM_UNMAP: u32 = 0x22;

    // === IPC (0x40 - 0x4F) ===
    /// Try to deliver a message to a receiving environment
    pub const SYS_IPC_CAN_SEND: u32 = 0x40;
    /// Block until a message arrives
    pub const SYS_IPC_RECV: u32 = 0x41;

    /// Human-readable syscall name for logs.
    pub fn name(num: u32) -> &'static str {
        match num {
            SYS_PUTCHAR => "putchar",
            SYS_GETENVID => "getenvid",
            SYS_YIELD => "yield",
            SYS_PANIC => "panic",
            SYS_CGETC => "cgetc",
            SYS_ENV_ALLOC => "env_alloc",
            SYS_ENV_DESTROY => "env_destroy",
            SYS_SET_ENV_STATUS => "set_env_status",
            SYS_SET_TRAPFRAME => "set_trapframe",
            SYS_SET_PGFAULT_HANDLER => "set_pgfault_handler",
            SYS_MEM_ALLOC => "mem_alloc",
            SYS_MEM_MAP => "mem_map",
            SYS_MEM_UNMAP => "mem_unmap",
            SYS_IPC_CAN_SEND => "ipc_can_send",
            SYS_IPC_RECV => "ipc_recv",
            _ => "unknown",
        }
    }
}

// =============================================================================
// Memory Layout
// =============================================================================

/// Page size, address-space layout and address arithmetic.
pub mod mmu {
    use crate::Va;

    /// Bytes per page
    pub const BY2PG: u32 = 4096;
    /// log2(BY2PG)
    pub const PGSHIFT: u32 = 12;
    /// Shift for the page-directory index
    pub const PDSHIFT: u32 = 22;
    /// Bytes mapped by one page-directory entry (4 MiB)
    pub const PDMAP: u32 = 1 << PDSHIFT;
    /// Page-table entries per page-directory entry
    pub const NPTE: u32 = PDMAP / BY2PG;

    /// Top of user-accessible memory
    pub const UTOP: Va = 0x7f40_0000;
    /// Top of the one-page exception stack
    pub const UXSTACKTOP: Va = UTOP;
    /// Top of the normal user stack
    pub const USTACKTOP: Va = UTOP - 2 * BY2PG;
    /// Scratch page used by the copy-on-write fault handler
    pub const PFTEMP: Va = USTACKTOP;

    /// Base of the per-descriptor file data regions
    pub const FILEBASE: Va = 0x6000_0000;
    /// Base of the descriptor-record pages
    pub const FDTABLE: Va = FILEBASE - PDMAP;
    /// Maximum open descriptors per environment
    pub const MAXFD: u32 = 32;
    /// Largest file the descriptor layer can map
    pub const MAXFILESIZE: u32 = PDMAP;

    /// Client-side FS-IPC request page
    pub const FSIPCBUF: Va = 0x0fff_e000;
    /// Server-side page where requests are received
    pub const FSREQVA: Va = 0x0fff_f000;

    /// Entry addresses of installed program images start here
    pub const UTEXT: Va = 0x0040_0000;
    /// Temporary page used while building a child's stack
    pub const UTEMP: Va = UTEXT - 2 * BY2PG;

    /// Page-directory index of an address
    pub const fn pdx(va: Va) -> u32 {
        va >> PDSHIFT
    }

    /// Virtual page number of an address
    pub const fn vpn(va: Va) -> u32 {
        va >> PGSHIFT
    }

    /// Round down to a page boundary
    pub const fn round_down(va: Va) -> Va {
        va & !(BY2PG - 1)
    }

    /// Round up to a page boundary
    pub const fn round_up(va: u32) -> u32 {
        (va + BY2PG - 1) & !(BY2PG - 1)
    }

    /// Offset within a page
    pub const fn page_offset(va: Va) -> u32 {
        va & (BY2PG - 1)
    }
}

// =============================================================================
// Page Permissions
// =============================================================================

bitflags! {
    /// Page-table entry permission bits, as carried by memory and IPC syscalls.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct Perm: u32 {
        /// Copy-on-write: shared read-only until either owner writes
        const COW = 0x001;
        /// Shared library page: fork and spawn share it writable
        const LIBRARY = 0x004;
        /// Mapping is valid
        const VALID = 0x200;
        /// Mapping is writable
        const WRITE = 0x400;
    }
}

impl Perm {
    /// Permission for a private writable page
    pub const RW: Perm = Perm::VALID.union(Perm::WRITE);

    /// Permission for a page shared writable across fork and spawn
    pub const SHARED: Perm = Perm::VALID.union(Perm::WRITE).union(Perm::LIBRARY);

    /// Writable and copy-on-write at the same time is never a legal mapping.
    pub fn is_consistent(self) -> bool {
        !(self.contains(Perm::COW) && self.contains(Perm::WRITE))
    }
}

// =============================================================================
// Environment Status
// =============================================================================

/// Run status of an environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum EnvStatus {
    /// Slot is free (the environment is being torn down)
    Free = 0,
    /// Eligible to run
    Runnable = 1,
    /// Blocked (fresh child or waiting in `ipc_recv`)
    NotRunnable = 2,
}

impl EnvStatus {
    /// Convert from the raw syscall argument.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(EnvStatus::Free),
            1 => Some(EnvStatus::Runnable),
            2 => Some(EnvStatus::NotRunnable),
            _ => None,
        }
    }
}

/// Well-known environment ids.
pub mod envs {
    use crate::EnvId;

    /// First id the kernel hands out
    pub const ENV_ID_BASE: EnvId = 0x400;
    /// Default environment budget
    pub const NENV: u32 = 1024;
    /// The file server is the first environment the machine boots
    pub const FS_SERVER: EnvId = ENV_ID_BASE;
}

// =============================================================================
// File Open Modes
// =============================================================================

/// Raw open-mode constants (bit field).
pub mod fcntl {
    /// Open for reading only
    pub const O_RDONLY: u32 = 0x0000;
    /// Open for writing only
    pub const O_WRONLY: u32 = 0x0001;
    /// Open for reading and writing
    pub const O_RDWR: u32 = 0x0002;
    /// Mask for the access mode
    pub const O_ACCMODE: u32 = 0x0003;
    /// Create if nonexistent
    pub const O_CREAT: u32 = 0x0100;
    /// Truncate to zero length
    pub const O_TRUNC: u32 = 0x0200;
    /// Error if already exists
    pub const O_EXCL: u32 = 0x0400;
    /// Create a directory, not a regular file
    pub const O_MKDIR: u32 = 0x0800;
}

bitflags! {
    /// Typed open mode. The access mode occupies the low two bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct OpenMode: u32 {
        /// Open for writing only
        const WRONLY = fcntl::O_WRONLY;
        /// Open for reading and writing
        const RDWR = fcntl::O_RDWR;
        /// Create if nonexistent
        const CREAT = fcntl::O_CREAT;
        /// Truncate to zero length
        const TRUNC = fcntl::O_TRUNC;
        /// Error if already exists
        const EXCL = fcntl::O_EXCL;
        /// Create a directory
        const MKDIR = fcntl::O_MKDIR;
    }
}

/// Access mode extracted from an [`OpenMode`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// `O_RDONLY`
    ReadOnly,
    /// `O_WRONLY`
    WriteOnly,
    /// `O_RDWR`
    ReadWrite,
}

impl Access {
    /// Reads are permitted
    pub fn can_read(self) -> bool {
        self != Access::WriteOnly
    }

    /// Writes are permitted
    pub fn can_write(self) -> bool {
        self != Access::ReadOnly
    }
}

impl OpenMode {
    /// Read-only is the absence of both access bits
    pub const RDONLY: OpenMode = OpenMode::empty();

    /// Decode the access mode; `None` for the reserved value 3.
    pub fn access(self) -> Option<Access> {
        match self.bits() & fcntl::O_ACCMODE {
            fcntl::O_RDONLY => Some(Access::ReadOnly),
            fcntl::O_WRONLY => Some(Access::WriteOnly),
            fcntl::O_RDWR => Some(Access::ReadWrite),
            _ => None,
        }
    }
}

// =============================================================================
// FS-IPC Request Codes
// =============================================================================

/// FS-IPC request codes, carried in the IPC value field.
///
/// Replies carry the result (0 or a negative [`Errno`] code) in the value
/// field; `OPEN` and `MAP` replies also transfer a page.
pub mod fsreq {
    /// Open a file: payload `{path, omode}`, reply page is the descriptor record
    pub const FSREQ_OPEN: u32 = 1;
    /// Map one file block: payload `{fileid, offset}`, reply page is the block
    pub const FSREQ_MAP: u32 = 2;
    /// Change a file's size: payload `{fileid, size}`
    pub const FSREQ_SET_SIZE: u32 = 3;
    /// Release one reference to an open file: payload `{fileid}`
    pub const FSREQ_CLOSE: u32 = 4;
    /// Mark one block dirty: payload `{fileid, offset}`
    pub const FSREQ_DIRTY: u32 = 5;
    /// Remove a file: payload `{path}`
    pub const FSREQ_REMOVE: u32 = 6;
    /// Flush every dirty block: no payload
    pub const FSREQ_SYNC: u32 = 7;
    /// Add one reference to an open file: payload `{fileid}`
    pub const FSREQ_INCREF: u32 = 8;

    /// Version stamped at the head of every request and descriptor page
    pub const FSIPC_WIRE_VERSION: u16 = 1;

    /// Human-readable request name for logs.
    pub fn name(code: u32) -> &'static str {
        match code {
            FSREQ_OPEN => "open",
            FSREQ_MAP => "map",
            FSREQ_SET_SIZE => "set_size",
            FSREQ_CLOSE => "close",
            FSREQ_DIRTY => "dirty",
            FSREQ_REMOVE => "remove",
            FSREQ_SYNC => "sync",
            FSREQ_INCREF => "incref",
            _ => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_page_aligned() {
        const { assert!(mmu::UTOP % mmu::BY2PG == 0) };
        const { assert!(mmu::USTACKTOP < mmu::UXSTACKTOP) };
        const { assert!(mmu::FDTABLE + mmu::MAXFD * mmu::BY2PG <= mmu::FILEBASE) };
        const { assert!(mmu::FILEBASE + mmu::MAXFD * mmu::PDMAP <= mmu::USTACKTOP) };
        assert_eq!(mmu::round_down(0x1234_5678), 0x1234_5000);
        assert_eq!(mmu::round_up(1), mmu::BY2PG);
        assert_eq!(mmu::round_up(mmu::BY2PG), mmu::BY2PG);
    }

    #[test]
    fn test_perm_consistency() {
        assert!(Perm::RW.is_consistent());
        assert!((Perm::VALID | Perm::COW).is_consistent());
        assert!(!(Perm::VALID | Perm::COW | Perm::WRITE).is_consistent());
    }

    #[test]
    fn test_open_mode_access() {
        assert_eq!(OpenMode::RDONLY.access(), Some(Access::ReadOnly));
        assert_eq!(
            (OpenMode::WRONLY | OpenMode::CREAT).access(),
            Some(Access::WriteOnly)
        );
        assert_eq!(
            (OpenMode::RDWR | OpenMode::TRUNC).access(),
            Some(Access::ReadWrite)
        );
        assert_eq!(OpenMode::from_bits_retain(3).access(), None);
        assert!(!Access::ReadOnly.can_write());
        assert!(!Access::WriteOnly.can_read());
    }

    #[test]
    fn test_open_mode_matches_raw_constants() {
        // These values MUST NOT change: they are stored in descriptor pages.
        assert_eq!(fcntl::O_RDONLY, 0x0);
        assert_eq!(fcntl::O_WRONLY, 0x1);
        assert_eq!(fcntl::O_RDWR, 0x2);
        assert_eq!(fcntl::O_ACCMODE, 0x3);
        assert_eq!(OpenMode::CREAT.bits(), 0x100);
        assert_eq!(OpenMode::TRUNC.bits(), 0x200);
        assert_eq!(OpenMode::EXCL.bits(), 0x400);
        assert_eq!(OpenMode::MKDIR.bits(), 0x800);
    }

    #[test]
    fn test_env_status_from_u32() {
        assert_eq!(EnvStatus::from_u32(1), Some(EnvStatus::Runnable));
        assert_eq!(EnvStatus::from_u32(2), Some(EnvStatus::NotRunnable));
        assert!(EnvStatus::from_u32(7).is_none());
    }
}
