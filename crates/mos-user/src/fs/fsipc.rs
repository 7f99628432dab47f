//! FS-IPC client
//!
//! Each call is one synchronous RPC to the file server: frame the payload
//! into `FSIPCBUF`, send it with the request code as the IPC value, block for
//! the reply. The reply value is `0` or a negative error; `open` and `map`
//! replies also carry a page, mapped at the caller's `dstva`.

use alloc::string::ToString;
use alloc::vec;

use serde::Serialize;

use mos_ipc::fsreq::{
    self, FSREQ_CLOSE, FSREQ_DIRTY, FSREQ_INCREF, FSREQ_MAP, FSREQ_OPEN, FSREQ_REMOVE,
    FSREQ_SET_SIZE, FSREQ_SYNC,
};
use mos_ipc::mmu::{BY2PG, FSIPCBUF};
use mos_ipc::{Errno, OpenMode, Perm, Syscalls, Va};

use crate::error::Result;
use crate::fs::wire::{self, BlockRequest, FileRequest, OpenRequest, RemoveRequest, SetSizeRequest};
use crate::fs::{DevKind, FdRecord};
use crate::runtime::Runtime;

/// Permission bits a reply page may carry
const REPLY_PERM_MASK: Perm = Perm::SHARED;

impl<S: Syscalls> Runtime<S> {
    fn fsipc<T: Serialize>(&self, code: u32, payload: Option<&T>, dstva: Va) -> Result<Perm> {
        let srcva = match payload {
            Some(payload) => {
                let page = wire::encode_page(payload)?;
                if self.sys().vpt(FSIPCBUF).is_none() {
                    self.syscall_mem_alloc(0, FSIPCBUF, Perm::RW)?;
                }
                self.store(FSIPCBUF, &page)?;
                FSIPCBUF
            }
            None => 0,
        };

        let server = self.config().fs_server;
        log::trace!(
            "[{:08x}] fsipc {} -> {:08x}",
            self.sys().getenvid(),
            fsreq::name(code),
            server
        );
        self.ipc_send(server, code, srcva, Perm::VALID)?;
        let reply = self.ipc_recv(dstva)?;

        if reply.from != server {
            log::debug!("fsipc {}: reply from {:08x}", fsreq::name(code), reply.from);
            self.discard_reply_page(dstva, reply.perm);
            return Err(Errno::Protocol.into());
        }
        match Errno::from_value(reply.value) {
            Ok(0) => Ok(reply.perm),
            Ok(_) => {
                self.discard_reply_page(dstva, reply.perm);
                Err(Errno::Protocol.into())
            }
            Err(e) => {
                self.discard_reply_page(dstva, reply.perm);
                Err(e.into())
            }
        }
    }

    fn discard_reply_page(&self, dstva: Va, perm: Perm) {
        if dstva != 0 && !perm.is_empty() {
            let _ = self.syscall_mem_unmap(0, dstva);
        }
    }

    /// Check the page a successful `open`/`map` reply must carry.
    fn expect_reply_page(&self, dstva: Va, perm: Perm) -> Result<Perm> {
        if !perm.contains(Perm::VALID) || !REPLY_PERM_MASK.contains(perm) {
            self.discard_reply_page(dstva, perm);
            return Err(Errno::Protocol.into());
        }
        Ok(perm)
    }

    /// Open `path`; the server's descriptor page lands at `fdva`.
    pub fn fsipc_open(&self, path: &str, omode: OpenMode, fdva: Va) -> Result<FdRecord> {
        let req = OpenRequest {
            path: path.to_string(),
            omode: omode.bits(),
        };
        let perm = self.fsipc(FSREQ_OPEN, Some(&req), fdva)?;
        self.expect_reply_page(fdva, perm)?;

        let mut page = vec![0u8; BY2PG as usize];
        self.load(fdva, &mut page)?;
        match wire::decode_page::<FdRecord>(&page) {
            Ok(rec) if rec.dev == DevKind::File && rec.file.is_some() => Ok(rec),
            _ => {
                let _ = self.syscall_mem_unmap(0, fdva);
                Err(Errno::Protocol.into())
            }
        }
    }

    /// Map the block at `offset` of file `fileid` at `dstva`. Returns the
    /// page's permission.
    pub fn fsipc_map(&self, fileid: u32, offset: u32, dstva: Va) -> Result<Perm> {
        let perm = self.fsipc(FSREQ_MAP, Some(&BlockRequest { fileid, offset }), dstva)?;
        self.expect_reply_page(dstva, perm)
    }

    /// Change the size of file `fileid`.
    pub fn fsipc_set_size(&self, fileid: u32, size: u32) -> Result<()> {
        self.fsipc(FSREQ_SET_SIZE, Some(&SetSizeRequest { fileid, size }), 0)
            .map(drop)
    }

    /// Release one reference to file `fileid`.
    pub fn fsipc_close(&self, fileid: u32) -> Result<()> {
        self.fsipc(FSREQ_CLOSE, Some(&FileRequest { fileid }), 0).map(drop)
    }

    /// Mark the block at `offset` of file `fileid` dirty.
    pub fn fsipc_dirty(&self, fileid: u32, offset: u32) -> Result<()> {
        self.fsipc(FSREQ_DIRTY, Some(&BlockRequest { fileid, offset }), 0)
            .map(drop)
    }

    /// Delete `path`.
    pub fn fsipc_remove(&self, path: &str) -> Result<()> {
        let req = RemoveRequest {
            path: path.to_string(),
        };
        self.fsipc(FSREQ_REMOVE, Some(&req), 0).map(drop)
    }

    /// Flush every dirty block on the server.
    pub fn fsipc_sync(&self) -> Result<()> {
        self.fsipc::<FileRequest>(FSREQ_SYNC, None, 0).map(drop)
    }

    /// Add one reference to file `fileid`.
    pub fn fsipc_incref(&self, fileid: u32) -> Result<()> {
        self.fsipc(FSREQ_INCREF, Some(&FileRequest { fileid }), 0).map(drop)
    }
}
