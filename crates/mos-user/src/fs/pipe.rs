//! Pipes
//!
//! Both ends map one shared page at their data address:
//!
//! ```text
//!   0       4       8                      40
//!   ┌───────┬───────┬──────────────────────┐
//!   │ rpos  │ wpos  │  ring (PIPE_BUF)     │
//!   └───────┴───────┴──────────────────────┘
//! ```
//!
//! `rpos` is only written by readers and `wpos` only by writers. The other
//! end is gone when every remaining mapping of the pipe page belongs to this
//! end's descriptor page, i.e. `pageref(fd) == pageref(pipe)`.

use mos_ipc::{OpenMode, Perm, Syscalls};

use crate::error::Result;
use crate::fs::{fd2data, num2fd, DevKind, FdRecord};
use crate::runtime::Runtime;

/// Bytes of buffering in a pipe
pub const PIPE_BUF: u32 = 32;

const RPOS: u32 = 0;
const WPOS: u32 = 4;
const RING: u32 = 8;

impl<S: Syscalls> Runtime<S> {
    /// Create a pipe. Returns `(read end, write end)`.
    pub fn pipe(&self) -> Result<(u32, u32)> {
        let rfd = self.fd_alloc()?;
        self.fd_install(rfd, &FdRecord::device(DevKind::Pipe, OpenMode::RDONLY))?;

        let created = self.fd_alloc().and_then(|wfd| {
            self.fd_install(wfd, &FdRecord::device(DevKind::Pipe, OpenMode::WRONLY))?;
            let built = self
                .syscall_mem_alloc(0, fd2data(rfd), Perm::SHARED)
                .and_then(|()| self.syscall_mem_map(0, fd2data(rfd), 0, fd2data(wfd), Perm::SHARED));
            if let Err(e) = built {
                let _ = self.syscall_mem_unmap(0, fd2data(rfd));
                let _ = self.syscall_mem_unmap(0, num2fd(wfd));
                return Err(e);
            }
            Ok(wfd)
        });

        match created {
            Ok(wfd) => {
                log::trace!("[{:08x}] pipe: fds {} and {}", self.envid(), rfd, wfd);
                Ok((rfd, wfd))
            }
            Err(e) => {
                let _ = self.syscall_mem_unmap(0, num2fd(rfd));
                Err(e)
            }
        }
    }

    fn pipe_positions(&self, fdnum: u32) -> Result<(u32, u32)> {
        let mut header = [0u8; 8];
        self.load(fd2data(fdnum), &mut header)?;
        let rpos = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let wpos = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        Ok((rpos, wpos))
    }

    /// Whether the other end of the pipe behind `fdnum` has been closed.
    pub fn pipe_is_closed(&self, fdnum: u32) -> Result<bool> {
        let (fd, data) = (num2fd(fdnum), fd2data(fdnum));
        // Another environment may map or unmap between the two reads.
        loop {
            let fd_refs = self.pageref(fd);
            let pipe_refs = self.pageref(data);
            if self.pageref(fd) == fd_refs {
                return Ok(fd_refs == pipe_refs);
            }
        }
    }

    pub(crate) fn pipe_available(&self, fdnum: u32) -> Result<u32> {
        let (rpos, wpos) = self.pipe_positions(fdnum)?;
        Ok(wpos.wrapping_sub(rpos))
    }

    /// Read what is buffered, blocking only while the pipe is empty and the
    /// write end is open. Returns 0 at end of file.
    pub(crate) fn pipe_read(&self, fdnum: u32, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let data = fd2data(fdnum);
        let (rpos, wpos) = loop {
            let (rpos, wpos) = self.pipe_positions(fdnum)?;
            if rpos != wpos {
                break (rpos, wpos);
            }
            if self.pipe_is_closed(fdnum)? {
                return Ok(0);
            }
            self.syscall_yield();
        };

        let n = (wpos.wrapping_sub(rpos) as usize).min(buf.len());
        for (i, byte) in buf[..n].iter_mut().enumerate() {
            let slot = rpos.wrapping_add(i as u32) % PIPE_BUF;
            let mut b = [0u8];
            self.load(data + RING + slot, &mut b)?;
            *byte = b[0];
        }
        self.store_u32(data + RPOS, rpos.wrapping_add(n as u32))?;
        Ok(n)
    }

    /// Write all of `data`, blocking while the ring is full. Stops early if
    /// the read end is closed and returns the bytes written so far.
    pub(crate) fn pipe_write(&self, fdnum: u32, data: &[u8]) -> Result<usize> {
        let page = fd2data(fdnum);
        let mut written = 0;
        while written < data.len() {
            let (rpos, wpos) = self.pipe_positions(fdnum)?;
            let used = wpos.wrapping_sub(rpos);
            if used >= PIPE_BUF {
                if self.pipe_is_closed(fdnum)? {
                    break;
                }
                self.syscall_yield();
                continue;
            }
            let n = ((PIPE_BUF - used) as usize).min(data.len() - written);
            for (i, &byte) in data[written..written + n].iter().enumerate() {
                let slot = wpos.wrapping_add(i as u32) % PIPE_BUF;
                self.store(page + RING + slot, &[byte])?;
            }
            self.store_u32(page + WPOS, wpos.wrapping_add(n as u32))?;
            written += n;
        }
        Ok(written)
    }

    pub(crate) fn pipe_close(&self, fdnum: u32) -> Result<()> {
        self.syscall_mem_unmap(0, fd2data(fdnum))
    }
}
