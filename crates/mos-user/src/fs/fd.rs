//! Descriptor table and device dispatch.
//!
//! A descriptor is live while its record page at [`num2fd`] is mapped. The
//! record (device, offset, mode, file identity) lives in that page, so every
//! handle mapping the same page shares it.

use alloc::vec;

use mos_ipc::mmu::{BY2PG, MAXFD, PDMAP};
use mos_ipc::{Errno, OpenMode, Perm, Syscalls};

use crate::error::{Error, Result};
use crate::fs::{fd2data, fd_in_range, num2fd, wire, DevKind, FdRecord, Stat};
use crate::runtime::Runtime;

/// Permission bits `dup` carries over to the new mappings
const DUP_PERM_MASK: Perm = Perm::SHARED;

impl<S: Syscalls> Runtime<S> {
    /// Lowest descriptor number whose record page is unmapped.
    ///
    /// Nothing is allocated: the caller maps the page.
    pub fn fd_alloc(&self) -> Result<u32> {
        (0..MAXFD)
            .find(|&n| self.sys().vpt(num2fd(n)).is_none())
            .ok_or(Error::Errno(Errno::MaxOpen))
    }

    /// Read the record of an open descriptor.
    pub fn fd_lookup(&self, fdnum: u32) -> Result<FdRecord> {
        if !fd_in_range(fdnum) || self.sys().vpt(num2fd(fdnum)).is_none() {
            return Err(Errno::BadFd.into());
        }
        let mut page = vec![0u8; BY2PG as usize];
        self.load(num2fd(fdnum), &mut page)?;
        Ok(wire::decode_page(&page)?)
    }

    pub(crate) fn fd_store(&self, fdnum: u32, rec: &FdRecord) -> Result<()> {
        let page = wire::encode_page(rec)?;
        self.store(num2fd(fdnum), &page)
    }

    /// Map a fresh record page for `fdnum` and write `rec` into it.
    pub(crate) fn fd_install(&self, fdnum: u32, rec: &FdRecord) -> Result<()> {
        self.syscall_mem_alloc(0, num2fd(fdnum), Perm::SHARED)?;
        if let Err(e) = self.fd_store(fdnum, rec) {
            let _ = self.syscall_mem_unmap(0, num2fd(fdnum));
            return Err(e);
        }
        Ok(())
    }

    /// Close a descriptor.
    pub fn close(&self, fdnum: u32) -> Result<()> {
        let rec = self.fd_lookup(fdnum)?;
        let result = match rec.dev {
            DevKind::File => self.file_close(fdnum, &rec),
            DevKind::Pipe => self.pipe_close(fdnum),
            DevKind::Console => Ok(()),
        };
        self.syscall_mem_unmap(0, num2fd(fdnum))?;
        result
    }

    /// Close every open descriptor. Free slots are skipped.
    pub fn close_all(&self) {
        for fdnum in 0..MAXFD {
            if self.sys().vpt(num2fd(fdnum)).is_none() {
                continue;
            }
            if let Err(e) = self.close(fdnum) {
                log::debug!("[{:08x}] close_all: fd {}: {}", self.envid(), fdnum, e);
            }
        }
    }

    /// Make `newfd` a second handle on `oldfd`'s record and data.
    ///
    /// `newfd` is closed first if open. Returns `newfd`.
    pub fn dup(&self, oldfd: u32, newfd: u32) -> Result<u32> {
        let rec = self.fd_lookup(oldfd)?;
        if !fd_in_range(newfd) {
            return Err(Errno::BadFd.into());
        }
        if oldfd == newfd {
            return Ok(newfd);
        }
        match self.close(newfd) {
            Ok(()) => {}
            Err(e) if e.errno() == Some(Errno::BadFd) => {}
            Err(e) => return Err(e),
        }

        let (ova, nva) = (fd2data(oldfd), fd2data(newfd));
        let result = self
            .for_each_mapping(ova, ova + PDMAP, |va, perm| {
                self.syscall_mem_map(0, va, 0, nva + (va - ova), perm & DUP_PERM_MASK)
            })
            .and_then(|()| {
                // Data first, record page last: a half-built dup never looks open.
                let perm = self.sys().vpt(num2fd(oldfd)).unwrap_or(Perm::SHARED);
                self.syscall_mem_map(0, num2fd(oldfd), 0, num2fd(newfd), perm & DUP_PERM_MASK)
            })
            .and_then(|()| match &rec.file {
                Some(meta) => self.fsipc_incref(meta.fileid),
                None => Ok(()),
            });

        if let Err(e) = result {
            let _ = self.syscall_mem_unmap(0, num2fd(newfd));
            let _ = self.for_each_mapping(nva, nva + PDMAP, |va, _| self.syscall_mem_unmap(0, va));
            return Err(e);
        }
        Ok(newfd)
    }

    /// Read up to `buf.len()` bytes at the current offset.
    pub fn read(&self, fdnum: u32, buf: &mut [u8]) -> Result<usize> {
        let mut rec = self.fd_lookup(fdnum)?;
        if !rec.mode().access().is_some_and(|a| a.can_read()) {
            return Err(Errno::BadMode.into());
        }
        let n = match rec.dev {
            DevKind::File => self.file_read(fdnum, &rec, buf)?,
            DevKind::Pipe => self.pipe_read(fdnum, buf)?,
            DevKind::Console => self.cons_read(buf)?,
        };
        if rec.dev == DevKind::File {
            rec.offset += n as u32;
            self.fd_store(fdnum, &rec)?;
        }
        Ok(n)
    }

    /// Read until `buf` is full or end of file.
    pub fn readn(&self, fdnum: u32, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.read(fdnum, &mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Write `data` at the current offset.
    pub fn write(&self, fdnum: u32, data: &[u8]) -> Result<usize> {
        let rec = self.fd_lookup(fdnum)?;
        if !rec.mode().access().is_some_and(|a| a.can_write()) {
            return Err(Errno::BadMode.into());
        }
        match rec.dev {
            DevKind::File => {
                let n = self.file_write(fdnum, &rec, data)?;
                // file_write may have grown the file: reload before moving the offset.
                let mut rec = self.fd_lookup(fdnum)?;
                rec.offset += n as u32;
                self.fd_store(fdnum, &rec)?;
                Ok(n)
            }
            DevKind::Pipe => self.pipe_write(fdnum, data),
            DevKind::Console => Ok(self.cons_write(data)),
        }
    }

    /// Set the offset of `fdnum`.
    pub fn seek(&self, fdnum: u32, offset: u32) -> Result<()> {
        let mut rec = self.fd_lookup(fdnum)?;
        rec.offset = offset;
        self.fd_store(fdnum, &rec)
    }

    /// Describe an open descriptor.
    pub fn fstat(&self, fdnum: u32) -> Result<Stat> {
        let rec = self.fd_lookup(fdnum)?;
        Ok(match (&rec.file, rec.dev) {
            (Some(meta), _) => Stat {
                name: meta.name.clone(),
                size: meta.size,
                isdir: meta.isdir,
                dev: rec.dev,
            },
            (None, DevKind::Pipe) => Stat {
                name: "<pipe>".into(),
                size: self.pipe_available(fdnum)?,
                isdir: false,
                dev: rec.dev,
            },
            (None, dev) => Stat {
                name: "<cons>".into(),
                size: 0,
                isdir: false,
                dev,
            },
        })
    }

    /// Describe the file at `path`.
    pub fn stat(&self, path: &str) -> Result<Stat> {
        let fdnum = self.open(path, OpenMode::RDONLY)?;
        let st = self.fstat(fdnum);
        let closed = self.close(fdnum);
        let st = st?;
        closed?;
        Ok(st)
    }

    /// Add a server reference for every open file, before sharing the
    /// descriptor table with a new environment.
    pub(crate) fn incref_shared_files(&self) -> Result<()> {
        for fdnum in 0..MAXFD {
            if self.sys().vpt(num2fd(fdnum)).is_none() {
                continue;
            }
            if let Some(meta) = self.fd_lookup(fdnum)?.file {
                self.fsipc_incref(meta.fileid)?;
            }
        }
        Ok(())
    }
}
