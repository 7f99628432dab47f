//! IPC transport
//!
//! One synchronous message at a time. A send only lands when the target is
//! blocked in `ipc_recv`, so a second send before the first is received keeps
//! retrying instead of overwriting it.

use mos_ipc::{EnvId, Errno, IpcDelivery, Perm, Syscalls, Va};

use crate::error::Result;
use crate::runtime::Runtime;

impl<S: Syscalls> Runtime<S> {
    /// Send `value` (and the page at `srcva` if non-zero) to `whom`.
    ///
    /// Yields and retries while the target is not receiving, up to
    /// `ipc_send_retries` times. Any other error returns immediately.
    pub fn ipc_send(&self, whom: EnvId, value: u32, srcva: Va, perm: Perm) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            match self.sys().ipc_can_send(whom, value, srcva, perm) {
                Ok(()) => return Ok(()),
                Err(Errno::IpcNotRecv) if attempts < self.config().ipc_send_retries => {
                    attempts += 1;
                    self.sys().yield_now();
                }
                Err(e) => {
                    log::debug!(
                        "[{:08x}] ipc_send to {:08x} failed after {} retries: {}",
                        self.sys().getenvid(),
                        whom,
                        attempts,
                        e
                    );
                    return Err(e.into());
                }
            }
        }
    }

    /// Block until a message arrives. A page, if sent, is mapped at `dstva`
    /// (when non-zero); its permission is in the returned delivery.
    pub fn ipc_recv(&self, dstva: Va) -> Result<IpcDelivery> {
        Ok(self.sys().ipc_recv(dstva)?)
    }
}
