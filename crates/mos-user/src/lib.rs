//! MOS User Runtime
//!
//! The library every MOS program links against. It turns the raw syscall
//! gateway into processes, messages and files:
//!
//! - **Copy-on-write fork** ([`fork()`]): address-space duplication done in user
//!   space, with a page-fault handler making private copies on first write
//! - **IPC** ([`Runtime::ipc_send`], [`Runtime::ipc_recv`]): synchronous,
//!   one message at a time, optionally carrying one page
//! - **FS-IPC client** ([`fs::fsipc`]): RPCs to the file server environment
//! - **File descriptors** ([`fs::fd`]): read/write/seek/stat/close over files,
//!   pipes and the console
//! - **Spawn and entry** ([`spawn()`], [`libmain()`]): start programs, exit cleanly
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      user program                            │
//! └──────────────────────────────────────────────────────────────┘
//!        │ open/read/write            │ fork            │ spawn
//!        ▼                            │                 │
//! ┌───────────────┐                   │                 │
//! │  fd layer     │── pipe, console   │                 │
//! └───────────────┘                   │                 │
//!        │ files                      │                 │
//!        ▼                            │                 │
//! ┌───────────────┐                   │                 │
//! │  fsipc        │                   │                 │
//! └───────────────┘                   │                 │
//!        │                            │                 │
//!        ▼                            ▼                 ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Runtime<S: Syscalls>   ipc · fault handler · memory access  │
//! └──────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//!   mos_ipc::Syscalls  (implemented by mos-kernel's EnvGateway)
//! ```
//!
//! Errors are [`Error::Errno`] codes passed through unchanged, or
//! [`Error::Fatal`] from [`user_panic!`] / [`user_assert!`], which ends the
//! environment in [`libmain::exit_with`].

#![no_std]
extern crate alloc;

pub mod config;
pub mod error;
pub mod fork;
pub mod fs;
mod ipc;
pub mod libmain;
pub mod runtime;
pub mod spawn;
mod syscalls;
pub mod testing;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use fork::{cow_handler, fork, set_pgfault_handler, PGFAULT_ENTRY};
pub use fs::{DevKind, FdRecord, FileMeta, Stat};
pub use libmain::{exit, exit_with, libmain, libmain_with_config};
pub use runtime::{ConsoleWriter, PgfaultHandler, Runtime};
pub use spawn::{image_header, spawn};
