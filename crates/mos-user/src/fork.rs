//! Copy-on-write fork
//!
//! Fork shares every writable page with the child read-only and marked
//! `COW`. The first write by either side faults into [`cow_handler`], which
//! gives the writer a private copy. Fork itself costs one `mem_map` per
//! mapping; copies happen one page at a time, on demand.
//!
//! ```text
//!   parent                         child
//!   ──────                         ─────
//!   RW page ──┬─ mem_map(child, COW) ─▶ COW
//!             └─ mem_map(self,  COW) ─▶ COW   (self second: the source
//!                                              must stay mapped first)
//!   LIBRARY ────── mem_map(child, same perm) ─▶ shared
//!   read-only ──── mem_map(child, same perm) ─▶ shared
//!   xstack         (fresh page per env)
//! ```

use alloc::boxed::Box;
use alloc::vec;

use mos_ipc::mmu::{self, BY2PG, PFTEMP, USTACKTOP, UTEXT, UXSTACKTOP};
use mos_ipc::{EnvId, EnvStatus, Errno, Perm, Syscalls, Va};

use crate::error::{Error, Result};
use crate::libmain;
use crate::runtime::{PgfaultHandler, Runtime};
use crate::user_panic;

/// Entry address registered with the kernel for user-level fault handling.
pub const PGFAULT_ENTRY: Va = UTEXT - BY2PG;

/// Install `handler` as this environment's page-fault handler.
///
/// The first call allocates the exception stack and registers with the
/// kernel; later calls only swap the handler.
pub fn set_pgfault_handler<S: Syscalls>(rt: &Runtime<S>, handler: PgfaultHandler<S>) -> Result<()> {
    if rt.pgfault_handler().is_none() {
        rt.syscall_mem_alloc(0, UXSTACKTOP - BY2PG, Perm::RW)?;
        rt.syscall_set_pgfault_handler(0, PGFAULT_ENTRY, UXSTACKTOP)?;
    }
    rt.install_pgfault_handler(handler);
    Ok(())
}

/// Copy-on-write fault handler.
///
/// Faults on pages that are not `COW` are fatal. Allocation of the copy is
/// retried `pgfault_alloc_retries` times on `NoMem`.
pub fn cow_handler<S: Syscalls>(rt: &Runtime<S>, va: Va) -> Result<()> {
    let page = mmu::round_down(va);
    let perm = match rt.sys().vpt(page) {
        Some(perm) => perm,
        None => user_panic!("fault on unmapped page {:08x}", va),
    };
    if !perm.contains(Perm::COW) {
        user_panic!("write fault on non-COW page {:08x} ({:?})", va, perm);
    }

    let mut attempts = 0u32;
    loop {
        match rt.syscall_mem_alloc(0, PFTEMP, Perm::RW) {
            Ok(()) => break,
            Err(Error::Errno(Errno::NoMem)) if attempts < rt.config().pgfault_alloc_retries => {
                attempts += 1;
                rt.syscall_yield();
            }
            Err(Error::Errno(Errno::NoMem)) => {
                user_panic!("out of memory copying COW page {:08x}", page)
            }
            Err(e) => return Err(e),
        }
    }

    let mut buf = vec![0u8; BY2PG as usize];
    rt.load(page, &mut buf)?;
    rt.store(PFTEMP, &buf)?;
    rt.syscall_mem_map(0, PFTEMP, 0, page, Perm::RW)?;
    rt.syscall_mem_unmap(0, PFTEMP)?;
    Ok(())
}

/// Share one page with `child` according to its permission.
fn duppage<S: Syscalls>(rt: &Runtime<S>, child: EnvId, va: Va, perm: Perm) -> Result<()> {
    if perm.contains(Perm::LIBRARY) {
        rt.syscall_mem_map(0, va, child, va, perm)
    } else if perm.intersects(Perm::WRITE | Perm::COW) {
        let cow = (perm - Perm::WRITE) | Perm::COW;
        rt.syscall_mem_map(0, va, child, va, cow)?;
        rt.syscall_mem_map(0, va, 0, va, cow)
    } else {
        rt.syscall_mem_map(0, va, child, va, perm)
    }
}

/// Create a copy-on-write child of the calling environment.
///
/// Returns the child's id to the parent. The child runs `child` against its
/// own [`Runtime`] once it is marked runnable, then exits through
/// [`libmain::exit_with`]: the hosted form of fork returning 0 in the child.
pub fn fork<S, F>(rt: &Runtime<S>, child: F) -> Result<EnvId>
where
    S: Syscalls,
    F: FnOnce(&Runtime<S>) -> Result<()> + Send + 'static,
{
    set_pgfault_handler(rt, cow_handler::<S>)?;

    let config = *rt.config();
    let handler: PgfaultHandler<S> = cow_handler::<S>;
    let envid = rt.sys().env_alloc(Box::new(move |sys: S| {
        let crt = Runtime::new(sys, config);
        crt.install_pgfault_handler(handler);
        let outcome = child(&crt);
        libmain::exit_with(&crt, outcome);
    }))?;

    match share_address_space(rt, envid) {
        Ok(pages) => {
            log::debug!(
                "[{:08x}] fork: child {:08x}, {} pages shared",
                rt.envid(),
                envid,
                pages
            );
            Ok(envid)
        }
        Err(e) => {
            log::debug!("[{:08x}] fork of {:08x} failed: {}", rt.envid(), envid, e);
            let _ = rt.syscall_env_destroy(envid);
            Err(e)
        }
    }
}

fn share_address_space<S: Syscalls>(rt: &Runtime<S>, child: EnvId) -> Result<u32> {
    let mut pages = 0u32;
    rt.for_each_mapping(0, USTACKTOP, |va, perm| {
        pages += 1;
        duppage(rt, child, va, perm)
    })?;
    rt.syscall_mem_alloc(child, UXSTACKTOP - BY2PG, Perm::RW)?;
    rt.syscall_set_pgfault_handler(child, PGFAULT_ENTRY, UXSTACKTOP)?;
    rt.incref_shared_files()?;
    rt.syscall_set_env_status(child, EnvStatus::Runnable)?;
    Ok(pages)
}
