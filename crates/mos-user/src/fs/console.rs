//! Console device.

use mos_ipc::{OpenMode, Syscalls};

use crate::error::Result;
use crate::fs::{DevKind, FdRecord};
use crate::runtime::Runtime;

/// Ctrl-D: end of input
const EOF_CHAR: u8 = 0x04;

impl<S: Syscalls> Runtime<S> {
    /// Open a read/write console descriptor.
    pub fn opencons(&self) -> Result<u32> {
        let fdnum = self.fd_alloc()?;
        self.fd_install(fdnum, &FdRecord::device(DevKind::Console, OpenMode::RDWR))?;
        Ok(fdnum)
    }

    /// Whether `fdnum` is a console descriptor.
    pub fn iscons(&self, fdnum: u32) -> Result<bool> {
        Ok(self.fd_lookup(fdnum)?.dev == DevKind::Console)
    }

    /// Read one character, yielding until one arrives. Ctrl-D reads as end
    /// of file.
    pub(crate) fn cons_read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let c = loop {
            match self.syscall_cgetc() {
                0 => self.syscall_yield(),
                c => break c,
            }
        };
        if c == EOF_CHAR {
            return Ok(0);
        }
        buf[0] = c;
        Ok(1)
    }

    pub(crate) fn cons_write(&self, data: &[u8]) -> usize {
        for &b in data {
            self.syscall_putchar(b);
        }
        data.len()
    }
}
