//! Regular files.
//!
//! An open file's blocks are mapped back to back at [`fd2data`]; reads and
//! writes are plain memory copies into those pages. Writes reach the server
//! only through `fsipc_dirty`, which `close` issues for every block of a
//! writable file.

use mos_ipc::mmu::{self, BY2PG, MAXFILESIZE};
use mos_ipc::{Errno, OpenMode, Syscalls, Va};

use crate::error::Result;
use crate::fs::{fd2data, num2fd, DevKind, FdRecord, FileMeta};
use crate::runtime::Runtime;

fn file_meta(rec: &FdRecord) -> Result<&FileMeta> {
    match (&rec.file, rec.dev) {
        (Some(meta), DevKind::File) => Ok(meta),
        _ => Err(Errno::Inval.into()),
    }
}

impl<S: Syscalls> Runtime<S> {
    /// Open `path` and map its contents. Returns the descriptor number.
    pub fn open(&self, path: &str, mode: OpenMode) -> Result<u32> {
        let fdnum = self.fd_alloc()?;
        let rec = self.fsipc_open(path, mode, num2fd(fdnum))?;
        let meta = file_meta(&rec)?;

        let va = fd2data(fdnum);
        let mut mapped = 0;
        while mapped < meta.size {
            if let Err(e) = self.fsipc_map(meta.fileid, mapped, va + mapped) {
                self.unmap_range(va, 0, mapped);
                let _ = self.fsipc_close(meta.fileid);
                let _ = self.syscall_mem_unmap(0, num2fd(fdnum));
                return Err(e);
            }
            mapped += BY2PG;
        }
        log::debug!(
            "[{:08x}] open {} -> fd {} (fileid {}, {} bytes)",
            self.envid(),
            path,
            fdnum,
            meta.fileid,
            meta.size
        );
        Ok(fdnum)
    }

    fn unmap_range(&self, base: Va, from: u32, to: u32) {
        let mut off = mmu::round_up(from);
        while off < to {
            let _ = self.syscall_mem_unmap(0, base + off);
            off += BY2PG;
        }
    }

    /// Map every block below `meta.size` that this descriptor's data region
    /// lacks. Another handle on the same record may have grown the file.
    fn map_missing(&self, fdnum: u32, meta: &FileMeta) -> Result<()> {
        let va = fd2data(fdnum);
        let mut off = 0;
        while off < meta.size {
            if self.sys().vpt(va + off).is_none() {
                self.fsipc_map(meta.fileid, off, va + off)?;
            }
            off += BY2PG;
        }
        Ok(())
    }

    pub(crate) fn file_read(&self, fdnum: u32, rec: &FdRecord, buf: &mut [u8]) -> Result<usize> {
        let meta = file_meta(rec)?;
        if rec.offset >= meta.size {
            return Ok(0);
        }
        self.map_missing(fdnum, meta)?;
        let n = buf.len().min((meta.size - rec.offset) as usize);
        self.load(fd2data(fdnum) + rec.offset, &mut buf[..n])?;
        Ok(n)
    }

    pub(crate) fn file_write(&self, fdnum: u32, rec: &FdRecord, data: &[u8]) -> Result<usize> {
        let meta = file_meta(rec)?;
        let end = rec.offset as u64 + data.len() as u64;
        if end > MAXFILESIZE as u64 {
            return Err(Errno::NoDisk.into());
        }
        let end = end as u32;
        self.map_missing(fdnum, meta)?;
        if end > meta.size {
            self.ftruncate(fdnum, end)?;
        }
        self.store(fd2data(fdnum) + rec.offset, data)?;
        Ok(data.len())
    }

    pub(crate) fn file_close(&self, fdnum: u32, rec: &FdRecord) -> Result<()> {
        let meta = file_meta(rec)?;
        let writable = rec.mode().access().is_some_and(|a| a.can_write());
        let mut result = Ok(());
        if writable {
            let mut off = 0;
            while off < meta.size {
                if let Err(e) = self.fsipc_dirty(meta.fileid, off) {
                    result = Err(e);
                    break;
                }
                off += BY2PG;
            }
        }
        let closed = self.fsipc_close(meta.fileid);
        self.unmap_range(fd2data(fdnum), 0, meta.size);
        result.and(closed)
    }

    /// Address of byte `offset` of an open file, for zero-copy reads.
    pub fn read_map(&self, fdnum: u32, offset: u32) -> Result<Va> {
        let rec = self.fd_lookup(fdnum)?;
        let meta = file_meta(&rec)?;
        if offset >= MAXFILESIZE {
            return Err(Errno::NoDisk.into());
        }
        self.map_missing(fdnum, meta)?;
        let va = fd2data(fdnum) + offset;
        if self.sys().vpt(va).is_none() {
            return Err(Errno::NoDisk.into());
        }
        Ok(va)
    }

    /// Set the size of an open file, mapping or unmapping blocks to match.
    pub fn ftruncate(&self, fdnum: u32, size: u32) -> Result<()> {
        if size > MAXFILESIZE {
            return Err(Errno::NoDisk.into());
        }
        let mut rec = self.fd_lookup(fdnum)?;
        if !rec.mode().access().is_some_and(|a| a.can_write()) {
            return Err(Errno::BadMode.into());
        }
        let meta = file_meta(&rec)?;
        let (fileid, oldsize) = (meta.fileid, meta.size);

        self.fsipc_set_size(fileid, size)?;

        let va = fd2data(fdnum);
        let mut off = mmu::round_up(oldsize);
        while off < size {
            if let Err(e) = self.fsipc_map(fileid, off, va + off) {
                self.unmap_range(va, oldsize, off);
                let _ = self.fsipc_set_size(fileid, oldsize);
                return Err(e);
            }
            off += BY2PG;
        }
        self.unmap_range(va, size, oldsize);

        if let Some(meta) = rec.file.as_mut() {
            meta.size = size;
        }
        self.fd_store(fdnum, &rec)
    }

    /// Delete the file at `path`.
    pub fn remove(&self, path: &str) -> Result<()> {
        self.fsipc_remove(path)
    }

    /// Flush every dirty block on the file server.
    pub fn sync(&self) -> Result<()> {
        self.fsipc_sync()
    }
}
