//! Typed syscall wrappers.
//!
//! Thin pass-through over the gateway: kernel error codes come back unchanged
//! as [`Error::Errno`](crate::Error::Errno).

use mos_ipc::{EnvId, EnvStatus, Perm, Syscalls, Trapframe, Va};

use crate::error::Result;
use crate::runtime::Runtime;

impl<S: Syscalls> Runtime<S> {
    /// Print one character on the console.
    pub fn syscall_putchar(&self, ch: u8) {
        self.sys().putchar(ch);
    }

    /// Id of the calling environment.
    pub fn syscall_getenvid(&self) -> EnvId {
        self.sys().getenvid()
    }

    /// Give up the CPU.
    pub fn syscall_yield(&self) {
        self.sys().yield_now();
    }

    /// Destroy an environment. Destroying the caller does not return.
    pub fn syscall_env_destroy(&self, envid: EnvId) -> Result<()> {
        Ok(self.sys().env_destroy(envid)?)
    }

    /// Register the fault entry point and exception stack of an environment.
    pub fn syscall_set_pgfault_handler(&self, envid: EnvId, entry: Va, xstacktop: Va) -> Result<()> {
        Ok(self.sys().set_pgfault_handler(envid, entry, xstacktop)?)
    }

    /// Allocate a zeroed page.
    pub fn syscall_mem_alloc(&self, envid: EnvId, va: Va, perm: Perm) -> Result<()> {
        Ok(self.sys().mem_alloc(envid, va, perm)?)
    }

    /// Map a page of one environment into another.
    pub fn syscall_mem_map(
        &self,
        srcid: EnvId,
        srcva: Va,
        dstid: EnvId,
        dstva: Va,
        perm: Perm,
    ) -> Result<()> {
        Ok(self.sys().mem_map(srcid, srcva, dstid, dstva, perm)?)
    }

    /// Remove a mapping.
    pub fn syscall_mem_unmap(&self, envid: EnvId, va: Va) -> Result<()> {
        Ok(self.sys().mem_unmap(envid, va)?)
    }

    /// Set a child's run status.
    pub fn syscall_set_env_status(&self, envid: EnvId, status: EnvStatus) -> Result<()> {
        Ok(self.sys().set_env_status(envid, status)?)
    }

    /// Replace a child's trapframe.
    pub fn syscall_set_trapframe(&self, envid: EnvId, tf: &Trapframe) -> Result<()> {
        Ok(self.sys().set_trapframe(envid, tf)?)
    }

    /// Report a fatal error to the kernel. Does not return on a live machine.
    pub fn syscall_panic(&self, msg: &str) {
        self.sys().panic(msg);
    }

    /// One attempt at delivering a message.
    pub fn syscall_ipc_can_send(&self, envid: EnvId, value: u32, srcva: Va, perm: Perm) -> Result<()> {
        Ok(self.sys().ipc_can_send(envid, value, srcva, perm)?)
    }

    /// Read one console character, 0 if none is waiting.
    pub fn syscall_cgetc(&self) -> u8 {
        self.sys().cgetc()
    }

    /// Number of mappings of the page backing `va`.
    pub fn pageref(&self, va: Va) -> u32 {
        self.sys().pageref(va)
    }
}
