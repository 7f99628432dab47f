//! Simulated memory access
//!
//! User loads and stores go through the caller's page table. A store to a
//! mapped page without `WRITE` is a page fault: it is delivered to the
//! environment's registered handler when the environment has one and a
//! usable exception stack, otherwise the kernel destroys the environment.

use mos_ipc::mmu::{self, BY2PG};
use mos_ipc::{EnvId, MemFault, Perm, Va};

use crate::state::KernelState;

/// How a write fault was resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Handed to the environment's handler
    Delivered,
    /// No usable handler; the environment was destroyed
    Destroyed,
}

/// Split `[va, va + len)` into per-page chunks of `(va, offset_in_buffer, len)`.
fn chunks(va: Va, len: usize) -> impl Iterator<Item = (Va, usize, usize)> {
    let mut done = 0usize;
    core::iter::from_fn(move || {
        if done >= len {
            return None;
        }
        let cur = va.wrapping_add(done as u32);
        let room = (BY2PG - mmu::page_offset(cur)) as usize;
        let n = room.min(len - done);
        let item = (cur, done, n);
        done += n;
        Some(item)
    })
}

impl KernelState {
    /// Read `buf.len()` bytes at `va` from `envid`'s address space.
    pub fn load(&self, envid: EnvId, va: Va, buf: &mut [u8]) -> Result<(), MemFault> {
        let env = self.env(envid).ok_or(MemFault::Killed)?;
        if (va as u64) + (buf.len() as u64) > mmu::UTOP as u64 {
            return Err(MemFault::Segv { va });
        }
        for (cur, off, n) in chunks(va, buf.len()) {
            let pte = env.pte(cur).ok_or(MemFault::Segv { va: cur })?;
            let data = self.pages.data(pte.page).ok_or(MemFault::Segv { va: cur })?;
            let start = mmu::page_offset(cur) as usize;
            buf[off..off + n].copy_from_slice(&data[start..start + n]);
        }
        Ok(())
    }

    /// Write `data` at `va` in `envid`'s address space.
    ///
    /// Every page is checked before any byte is written. The first page that
    /// is unmapped yields `Segv`; the first page that is read-only raises a
    /// write fault (see [`KernelState::raise_write_fault`]).
    pub fn store(&mut self, envid: EnvId, va: Va, data: &[u8]) -> Result<(), MemFault> {
        let env = self.env(envid).ok_or(MemFault::Killed)?;
        if (va as u64) + (data.len() as u64) > mmu::UTOP as u64 {
            return Err(MemFault::Segv { va });
        }
        let mut read_only = None;
        for (cur, _, _) in chunks(va, data.len()) {
            let pte = env.pte(cur).ok_or(MemFault::Segv { va: cur })?;
            if !pte.perm.contains(Perm::WRITE) {
                read_only = Some(cur);
                break;
            }
        }
        if let Some(fault_va) = read_only {
            return match self.raise_write_fault(envid) {
                FaultDisposition::Delivered => Err(MemFault::PageFault { va: fault_va }),
                FaultDisposition::Destroyed => Err(MemFault::Killed),
            };
        }

        for (cur, off, n) in chunks(va, data.len()) {
            let Some(pte) = self.page_lookup(envid, cur) else {
                return Err(MemFault::Segv { va: cur });
            };
            let page = self
                .pages
                .data_mut(pte.page)
                .ok_or(MemFault::Segv { va: cur })?;
            let start = mmu::page_offset(cur) as usize;
            page[start..start + n].copy_from_slice(&data[off..off + n]);
        }
        Ok(())
    }

    /// Deliver a write fault to `envid`.
    ///
    /// The handler is usable when one is registered and the exception stack
    /// page just below `xstacktop` is mapped writable and not copy-on-write.
    pub fn raise_write_fault(&mut self, envid: EnvId) -> FaultDisposition {
        let usable = match self.env(envid) {
            Some(env) if env.pgfault_handler != 0 => env
                .pte(env.xstacktop.wrapping_sub(BY2PG))
                .is_some_and(|pte| pte.perm.contains(Perm::WRITE) && !pte.perm.contains(Perm::COW)),
            _ => false,
        };
        if usable {
            if let Some(env) = self.env_mut(envid) {
                env.metrics.pgfaults += 1;
            }
            FaultDisposition::Delivered
        } else {
            self.destroy_env(envid);
            FaultDisposition::Destroyed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::{step, Syscall};
    use mos_ipc::mmu::UXSTACKTOP;
    use mos_ipc::EnvStatus;

    fn setup() -> (KernelState, EnvId) {
        let mut state = KernelState::default();
        let id = state.create_env(0, "init", EnvStatus::Runnable).unwrap();
        (state, id)
    }

    fn map_page(state: &mut KernelState, id: EnvId, va: Va, perm: Perm) {
        step(state, id, Syscall::MemAlloc { envid: 0, va, perm });
    }

    #[test]
    fn test_chunks_split_on_page_boundary() {
        let parts: alloc::vec::Vec<_> = chunks(0x1ffe, 6).collect();
        assert_eq!(parts, alloc::vec![(0x1ffe, 0, 2), (0x2000, 2, 4)]);
    }

    #[test]
    fn test_store_then_load_across_pages() {
        let (mut state, id) = setup();
        map_page(&mut state, id, 0x1000, Perm::RW);
        map_page(&mut state, id, 0x2000, Perm::RW);
        state.store(id, 0x1ffc, b"abcdefgh").unwrap();
        let mut buf = [0u8; 8];
        state.load(id, 0x1ffc, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn test_unmapped_access_is_segv() {
        let (mut state, id) = setup();
        let mut buf = [0u8; 4];
        assert_eq!(state.load(id, 0x5000, &mut buf), Err(MemFault::Segv { va: 0x5000 }));
        assert_eq!(state.store(id, 0x5000, b"x"), Err(MemFault::Segv { va: 0x5000 }));
        assert!(state.env_exists(id));
    }

    #[test]
    fn test_store_is_all_or_nothing() {
        let (mut state, id) = setup();
        map_page(&mut state, id, 0x1000, Perm::RW);
        assert_eq!(
            state.store(id, 0x1ffe, b"wxyz"),
            Err(MemFault::Segv { va: 0x2000 })
        );
        let mut buf = [0u8; 2];
        state.load(id, 0x1ffe, &mut buf).unwrap();
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn test_write_fault_without_handler_destroys() {
        let (mut state, id) = setup();
        map_page(&mut state, id, 0x1000, Perm::VALID);
        assert_eq!(state.store(id, 0x1000, b"x"), Err(MemFault::Killed));
        assert!(!state.env_exists(id));
    }

    #[test]
    fn test_write_fault_needs_exception_stack() {
        let (mut state, id) = setup();
        map_page(&mut state, id, 0x1000, Perm::VALID);
        step(
            &mut state,
            id,
            Syscall::SetPgfaultHandler {
                envid: 0,
                entry: 0x0040_0000,
                xstacktop: UXSTACKTOP,
            },
        );
        assert_eq!(state.store(id, 0x1000, b"x"), Err(MemFault::Killed));
    }

    #[test]
    fn test_write_fault_delivered_to_handler() {
        let (mut state, id) = setup();
        map_page(&mut state, id, 0x1000, Perm::VALID);
        map_page(&mut state, id, UXSTACKTOP - BY2PG, Perm::RW);
        step(
            &mut state,
            id,
            Syscall::SetPgfaultHandler {
                envid: 0,
                entry: 0x0040_0000,
                xstacktop: UXSTACKTOP,
            },
        );
        assert_eq!(
            state.store(id, 0x1010, b"x"),
            Err(MemFault::PageFault { va: 0x1010 })
        );
        assert_eq!(state.env_metrics(id).unwrap().pgfaults, 1);
    }

    #[test]
    fn test_access_above_utop() {
        let (mut state, id) = setup();
        assert!(matches!(
            state.store(id, mmu::UTOP - 1, b"ab"),
            Err(MemFault::Segv { .. })
        ));
    }
}
