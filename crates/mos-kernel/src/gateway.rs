//! Per-environment syscall gateway.

use std::fmt;
use std::sync::Arc;

use mos_ipc::{
    EnvId, EnvStatus, Errno, IpcDelivery, MemFault, Perm, Resume, Syscalls, Trapframe, Va,
};
use mos_kernel_core::Syscall;

use crate::machine::Shared;

/// The [`Syscalls`] implementation handed to code running in one environment.
pub struct EnvGateway {
    envid: EnvId,
    shared: Arc<Shared>,
}

impl EnvGateway {
    pub(crate) fn new(envid: EnvId, shared: Arc<Shared>) -> Self {
        Self { envid, shared }
    }

    fn call(&self, syscall: Syscall) -> Result<u32, Errno> {
        self.shared.syscall(self.envid, syscall)
    }
}

impl fmt::Debug for EnvGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvGateway")
            .field("envid", &format_args!("{:08x}", self.envid))
            .finish()
    }
}

impl Syscalls for EnvGateway {
    fn putchar(&self, ch: u8) {
        let _ = self.call(Syscall::Putchar { ch });
    }

    fn getenvid(&self) -> EnvId {
        self.call(Syscall::GetEnvId).unwrap_or(self.envid)
    }

    fn yield_now(&self) {
        self.shared.yield_now(self.envid);
    }

    fn panic(&self, msg: &str) {
        let _ = self.call(Syscall::Panic {
            msg: msg.to_string(),
        });
    }

    fn cgetc(&self) -> u8 {
        self.call(Syscall::Cgetc).map(|c| c as u8).unwrap_or(0)
    }

    fn env_destroy(&self, envid: EnvId) -> Result<(), Errno> {
        self.call(Syscall::EnvDestroy { envid }).map(drop)
    }

    fn set_pgfault_handler(&self, envid: EnvId, entry: Va, xstacktop: Va) -> Result<(), Errno> {
        self.call(Syscall::SetPgfaultHandler {
            envid,
            entry,
            xstacktop,
        })
        .map(drop)
    }

    fn env_alloc(&self, resume: Resume<Self>) -> Result<EnvId, Errno> {
        self.shared.env_alloc(self.envid, resume)
    }

    fn set_env_status(&self, envid: EnvId, status: EnvStatus) -> Result<(), Errno> {
        self.call(Syscall::SetEnvStatus { envid, status }).map(drop)
    }

    fn set_trapframe(&self, envid: EnvId, tf: &Trapframe) -> Result<(), Errno> {
        self.call(Syscall::SetTrapframe { envid, tf: *tf }).map(drop)
    }

    fn mem_alloc(&self, envid: EnvId, va: Va, perm: Perm) -> Result<(), Errno> {
        self.call(Syscall::MemAlloc { envid, va, perm }).map(drop)
    }

    fn mem_map(
        &self,
        srcid: EnvId,
        srcva: Va,
        dstid: EnvId,
        dstva: Va,
        perm: Perm,
    ) -> Result<(), Errno> {
        self.call(Syscall::MemMap {
            srcid,
            srcva,
            dstid,
            dstva,
            perm,
        })
        .map(drop)
    }

    fn mem_unmap(&self, envid: EnvId, va: Va) -> Result<(), Errno> {
        self.call(Syscall::MemUnmap { envid, va }).map(drop)
    }

    fn ipc_can_send(&self, envid: EnvId, value: u32, srcva: Va, perm: Perm) -> Result<(), Errno> {
        self.call(Syscall::IpcCanSend {
            envid,
            value,
            srcva,
            perm,
        })
        .map(drop)
    }

    fn ipc_recv(&self, dstva: Va) -> Result<IpcDelivery, Errno> {
        self.shared.recv(self.envid, dstva)
    }

    fn vpd(&self, pdx: u32) -> bool {
        self.shared
            .with_state(self.envid, |s| s.pde_present(self.envid, pdx))
    }

    fn vpt(&self, va: Va) -> Option<Perm> {
        self.shared
            .with_state(self.envid, |s| s.page_lookup(self.envid, va).map(|pte| pte.perm))
    }

    fn pageref(&self, va: Va) -> u32 {
        self.shared.with_state(self.envid, |s| s.pageref(self.envid, va))
    }

    fn load(&self, va: Va, buf: &mut [u8]) -> Result<(), MemFault> {
        self.shared.with_state(self.envid, |s| s.load(self.envid, va, buf))
    }

    fn store(&self, va: Va, data: &[u8]) -> Result<(), MemFault> {
        self.shared
            .with_state_mut(self.envid, |s| s.store(self.envid, va, data))
    }

    fn trapframe(&self) -> Trapframe {
        self.shared
            .with_state(self.envid, |s| s.env(self.envid).map(|e| e.tf).unwrap_or_default())
    }
}
