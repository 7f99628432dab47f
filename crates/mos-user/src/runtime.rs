//! Per-environment runtime handle.
//!
//! A [`Runtime`] is the process-wide state of one environment: its syscall
//! gateway, its configuration and the registered page-fault handler. Every
//! runtime operation goes through it; there is no global `env`.

use core::cell::Cell;
use core::fmt;

use alloc::vec::Vec;

use mos_ipc::mmu::{self, BY2PG, NPTE, PDMAP};
use mos_ipc::{EnvId, MemFault, Perm, Syscalls, Va};

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::user_panic;

/// A user-level page-fault handler. Receives the faulting address.
pub type PgfaultHandler<S> = fn(&Runtime<S>, Va) -> Result<()>;

/// Runtime state of one environment.
///
/// Not `Sync`: an environment is single-threaded, and the fault handler slot
/// has a single writer (`set_pgfault_handler`, or fork for the child).
pub struct Runtime<S: Syscalls> {
    sys: S,
    config: RuntimeConfig,
    pgfault: Cell<Option<PgfaultHandler<S>>>,
    in_fault: Cell<bool>,
    faults: Cell<u32>,
}

impl<S: Syscalls> Runtime<S> {
    /// Wrap a syscall gateway.
    pub fn new(sys: S, config: RuntimeConfig) -> Self {
        Self {
            sys,
            config,
            pgfault: Cell::new(None),
            in_fault: Cell::new(false),
            faults: Cell::new(0),
        }
    }

    /// The raw gateway.
    pub fn sys(&self) -> &S {
        &self.sys
    }

    /// Configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Page faults this runtime has handled successfully.
    pub fn pgfault_count(&self) -> u32 {
        self.faults.get()
    }

    pub(crate) fn pgfault_handler(&self) -> Option<PgfaultHandler<S>> {
        self.pgfault.get()
    }

    pub(crate) fn install_pgfault_handler(&self, handler: PgfaultHandler<S>) {
        self.pgfault.set(Some(handler));
    }

    // =========================================================================
    // Memory access
    // =========================================================================

    /// Copy bytes out of the address space. Unmapped memory is fatal.
    pub fn load(&self, va: Va, buf: &mut [u8]) -> Result<()> {
        match self.sys.load(va, buf) {
            Ok(()) => Ok(()),
            Err(MemFault::Segv { va }) => user_panic!("segmentation fault reading {:08x}", va),
            Err(MemFault::PageFault { va }) => user_panic!("unexpected fault reading {:08x}", va),
            Err(MemFault::Killed) => user_panic!("environment killed by the kernel"),
        }
    }

    /// Copy bytes into the address space.
    ///
    /// A write fault runs the registered handler, then the store is retried.
    /// A second fault on a page that was just handled is fatal.
    pub fn store(&self, va: Va, data: &[u8]) -> Result<()> {
        let mut handled: Vec<Va> = Vec::new();
        loop {
            match self.sys.store(va, data) {
                Ok(()) => return Ok(()),
                Err(MemFault::PageFault { va: fault_va }) => {
                    let page = mmu::round_down(fault_va);
                    if handled.contains(&page) {
                        user_panic!("write fault at {:08x} persists after handling", fault_va);
                    }
                    self.handle_pgfault(fault_va)?;
                    handled.push(page);
                }
                Err(MemFault::Segv { va }) => user_panic!("segmentation fault writing {:08x}", va),
                Err(MemFault::Killed) => user_panic!("environment killed by the kernel"),
            }
        }
    }

    /// Read a little-endian word.
    pub fn load_u32(&self, va: Va) -> Result<u32> {
        let mut word = [0u8; 4];
        self.load(va, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Write a little-endian word.
    pub fn store_u32(&self, va: Va, value: u32) -> Result<()> {
        self.store(va, &value.to_le_bytes())
    }

    fn handle_pgfault(&self, va: Va) -> Result<()> {
        if self.in_fault.get() {
            user_panic!("page fault at {:08x} while handling a page fault", va);
        }
        let Some(handler) = self.pgfault.get() else {
            user_panic!("page fault at {:08x} with no handler registered", va);
        };
        log::trace!("[{:08x}] page fault at {:08x}", self.sys.getenvid(), va);
        self.in_fault.set(true);
        let result = handler(self, va);
        self.in_fault.set(false);
        if result.is_ok() {
            self.faults.set(self.faults.get() + 1);
        }
        result
    }

    /// Visit every mapping in `[start, end)`, skipping absent page tables.
    pub fn for_each_mapping<F>(&self, start: Va, end: Va, mut f: F) -> Result<()>
    where
        F: FnMut(Va, Perm) -> Result<()>,
    {
        let mut pd_base = start & !(PDMAP - 1);
        while pd_base < end {
            if self.sys.vpd(mmu::pdx(pd_base)) {
                for i in 0..NPTE {
                    let va = pd_base + i * BY2PG;
                    if va < start || va >= end {
                        continue;
                    }
                    if let Some(perm) = self.sys.vpt(va) {
                        f(va, perm)?;
                    }
                }
            }
            pd_base = match pd_base.checked_add(PDMAP) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }

    // =========================================================================
    // Console output
    // =========================================================================

    /// Write a string to the console.
    pub fn print(&self, s: &str) {
        for b in s.bytes() {
            self.sys.putchar(b);
        }
    }

    /// A [`fmt::Write`] sink over the console, for `write!`.
    pub fn console(&self) -> ConsoleWriter<'_, S> {
        ConsoleWriter { rt: self }
    }

    /// Id of this environment.
    pub fn envid(&self) -> EnvId {
        self.sys.getenvid()
    }
}

impl<S: Syscalls + fmt::Debug> fmt::Debug for Runtime<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("sys", &self.sys)
            .field("config", &self.config)
            .field("faults", &self.faults.get())
            .finish()
    }
}

/// Console writer returned by [`Runtime::console`].
pub struct ConsoleWriter<'a, S: Syscalls> {
    rt: &'a Runtime<S>,
}

impl<S: Syscalls> fmt::Write for ConsoleWriter<'_, S> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.rt.print(s);
        Ok(())
    }
}
