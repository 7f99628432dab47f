//! File system client
//!
//! - [`wire`]: page framing and FS-IPC request payloads
//! - [`fsipc`]: the RPC client talking to the file server
//! - [`fd`]: descriptor table and device dispatch
//! - [`file`], [`pipe`], [`console`]: the devices
//!
//! ```text
//!   read/write/seek/close ──▶ fd ──match DevKind──┬─▶ file ──▶ fsipc ──▶ ipc
//!                                                 ├─▶ pipe    (shared ring page)
//!                                                 └─▶ console (putchar / cgetc)
//! ```

pub mod console;
pub mod fd;
pub mod file;
pub mod fsipc;
pub mod pipe;
pub mod wire;

use alloc::string::String;

use serde::{Deserialize, Serialize};

use mos_ipc::mmu::{BY2PG, FDTABLE, FILEBASE, MAXFD, PDMAP};
use mos_ipc::{OpenMode, Va};

/// Device kinds behind a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevKind {
    /// Regular file served over FS-IPC
    File,
    /// Anonymous pipe
    Pipe,
    /// Console
    Console,
}

impl DevKind {
    /// One-letter device id
    pub fn id(self) -> char {
        match self {
            DevKind::File => 'f',
            DevKind::Pipe => 'p',
            DevKind::Console => 'c',
        }
    }

    /// Device name for stat
    pub fn name(self) -> &'static str {
        match self {
            DevKind::File => "file",
            DevKind::Pipe => "pipe",
            DevKind::Console => "cons",
        }
    }
}

/// File identity carried by descriptors of [`DevKind::File`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Server-assigned open file id
    pub fileid: u32,
    /// Last path component
    pub name: String,
    /// Size in bytes
    pub size: u32,
    /// Whether this is a directory
    pub isdir: bool,
}

/// Descriptor record, stored framed in the descriptor's page.
///
/// The page is shared by `dup` and across fork, so the offset is shared too.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdRecord {
    /// Backing device
    pub dev: DevKind,
    /// Current offset
    pub offset: u32,
    /// Raw open mode
    pub omode: u32,
    /// Remote file, for [`DevKind::File`]
    pub file: Option<FileMeta>,
}

impl FdRecord {
    /// A record for a device with no remote identity.
    pub fn device(dev: DevKind, mode: OpenMode) -> Self {
        Self {
            dev,
            offset: 0,
            omode: mode.bits(),
            file: None,
        }
    }

    /// Typed open mode
    pub fn mode(&self) -> OpenMode {
        OpenMode::from_bits_retain(self.omode)
    }
}

/// Result of `fstat`/`stat`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// File name (device name for non-files)
    pub name: String,
    /// Size in bytes
    pub size: u32,
    /// Whether this is a directory
    pub isdir: bool,
    /// Backing device
    pub dev: DevKind,
}

/// Address of descriptor `fdnum`'s record page.
pub const fn num2fd(fdnum: u32) -> Va {
    FDTABLE + fdnum * BY2PG
}

/// Descriptor number of a record page address.
pub const fn fd2num(va: Va) -> u32 {
    (va - FDTABLE) / BY2PG
}

/// Base of descriptor `fdnum`'s data region.
pub const fn fd2data(fdnum: u32) -> Va {
    FILEBASE + fdnum * PDMAP
}

/// Whether `fdnum` is inside the descriptor table.
pub const fn fd_in_range(fdnum: u32) -> bool {
    fdnum < MAXFD
}
