//! The syscall gateway contract.
//!
//! User code never talks to the kernel directly: it is written against
//! [`Syscalls`], which the hosted machine implements per environment. The
//! trait mirrors the privileged operations one to one plus a read-only window
//! onto the caller's page tables and memory (what MOS exposes by mapping
//! `vpt`/`vpd` and the page array into user space).

use alloc::boxed::Box;
use serde::{Deserialize, Serialize};

use crate::{EnvId, EnvStatus, Errno, Perm, Va};

/// Continuation a freshly allocated child resumes in once it is made
/// runnable: the hosted analogue of `env_alloc` returning 0 in the child.
pub type Resume<S> = Box<dyn FnOnce(S) + Send + 'static>;

/// Saved register state of an environment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trapframe {
    /// General purpose registers
    pub regs: [u32; 32],
    /// Resume address
    pub pc: u32,
}

impl Trapframe {
    /// First argument register
    pub const A0: usize = 4;
    /// Second argument register
    pub const A1: usize = 5;
    /// Stack pointer
    pub const SP: usize = 29;

    /// Stack pointer value
    pub fn sp(&self) -> u32 {
        self.regs[Self::SP]
    }
}

/// A message delivered by `ipc_recv`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpcDelivery {
    /// Sender's environment id
    pub from: EnvId,
    /// The 32-bit value
    pub value: u32,
    /// Permission of the transferred page, empty if none was transferred
    pub perm: Perm,
}

/// Why a memory access did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemFault {
    /// Write to a mapped, non-writable page. The fault was delivered to the
    /// environment's registered handler; retry after handling it.
    PageFault {
        /// Faulting address
        va: Va,
    },
    /// Access to an unmapped address
    Segv {
        /// Faulting address
        va: Va,
    },
    /// The kernel destroyed the environment (e.g. no fault handler)
    Killed,
}

/// Privileged operations consumed by the user runtime.
///
/// Every fallible call returns the kernel's error unchanged. `envid == 0`
/// always refers to the caller.
pub trait Syscalls: Sized + Send + 'static {
    // === Misc ===

    /// Write one character to the console
    fn putchar(&self, ch: u8);

    /// The caller's environment id
    fn getenvid(&self) -> EnvId;

    /// Give up the CPU
    fn yield_now(&self);

    /// Report a fatal error. The kernel destroys the caller; the caller must
    /// not issue further syscalls.
    fn panic(&self, msg: &str);

    /// Read one console character, 0 if none is pending
    fn cgetc(&self) -> u8;

    // === Environment ===

    /// Destroy an environment (the caller or one of its children)
    fn env_destroy(&self, envid: EnvId) -> Result<(), Errno>;

    /// Register the page-fault entry point and exception stack top
    fn set_pgfault_handler(&self, envid: EnvId, entry: Va, xstacktop: Va) -> Result<(), Errno>;

    /// Allocate a not-runnable child that will run `resume` once runnable,
    /// unless its trapframe is replaced first
    fn env_alloc(&self, resume: Resume<Self>) -> Result<EnvId, Errno>;

    /// Set an environment's run status
    fn set_env_status(&self, envid: EnvId, status: EnvStatus) -> Result<(), Errno>;

    /// Replace a child's trapframe
    fn set_trapframe(&self, envid: EnvId, tf: &Trapframe) -> Result<(), Errno>;

    // === Memory ===

    /// Allocate a zeroed page at `va`
    fn mem_alloc(&self, envid: EnvId, va: Va, perm: Perm) -> Result<(), Errno>;

    /// Map the page at `srcva` in `srcid` at `dstva` in `dstid`
    fn mem_map(&self, srcid: EnvId, srcva: Va, dstid: EnvId, dstva: Va, perm: Perm)
        -> Result<(), Errno>;

    /// Remove the mapping at `va`
    fn mem_unmap(&self, envid: EnvId, va: Va) -> Result<(), Errno>;

    // === IPC ===

    /// Deliver a message if `envid` is blocked in `ipc_recv`, otherwise
    /// fail with `IpcNotRecv`
    fn ipc_can_send(&self, envid: EnvId, value: u32, srcva: Va, perm: Perm) -> Result<(), Errno>;

    /// Block until a message arrives; a transferred page lands at `dstva`
    fn ipc_recv(&self, dstva: Va) -> Result<IpcDelivery, Errno>;

    // === Address-space window ===

    /// Whether any page is mapped in the 4 MiB region `pdx`
    fn vpd(&self, pdx: u32) -> bool;

    /// Permission of the page containing `va`, if mapped
    fn vpt(&self, va: Va) -> Option<Perm>;

    /// Number of mappings of the physical page behind `va` (0 if unmapped)
    fn pageref(&self, va: Va) -> u32;

    /// Read the caller's memory
    fn load(&self, va: Va, buf: &mut [u8]) -> Result<(), MemFault>;

    /// Write the caller's memory. If any page in the range faults, nothing
    /// is written and the first faulting page is reported.
    fn store(&self, va: Va, data: &[u8]) -> Result<(), MemFault>;

    /// The caller's trapframe as it was when the environment started
    fn trapframe(&self) -> Trapframe;
}
