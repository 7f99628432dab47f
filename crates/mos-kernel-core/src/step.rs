//! Pure step function
//!
//! `step(state, caller, syscall) -> StepResult` performs one privileged
//! operation on behalf of `caller`. Nothing here blocks or touches a thread:
//! an `IpcRecv` that has to wait returns [`SyscallResult::Blocked`] and the
//! hosting machine parks the caller until a sender delivers.
//!
//! Every step also returns the list of [`Event`]s it caused, which the
//! machine uses to start threads, wake receivers and fill its audit log.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use mos_ipc::mmu::UTOP;
use mos_ipc::syscall::*;
use mos_ipc::{EnvId, EnvStatus, Errno, Perm, Trapframe, Va};

use crate::state::KernelState;

// ============================================================================
// Syscall definitions
// ============================================================================

/// Syscall variants - all privileged operations
#[derive(Clone, Debug)]
pub enum Syscall {
    /// Write one console character
    Putchar { ch: u8 },

    /// Caller's own id
    GetEnvId,

    /// Give up the CPU
    Yield,

    /// Report a fatal error; destroys the caller
    Panic { msg: String },

    /// Read one console character (0 if none)
    Cgetc,

    /// Allocate a not-runnable child
    EnvAlloc,

    /// Destroy the caller or a child
    EnvDestroy { envid: EnvId },

    /// Set a run status
    SetEnvStatus { envid: EnvId, status: EnvStatus },

    /// Replace a trapframe
    SetTrapframe { envid: EnvId, tf: Trapframe },

    /// Register the page-fault entry and exception stack
    SetPgfaultHandler {
        envid: EnvId,
        entry: Va,
        xstacktop: Va,
    },

    /// Allocate a zeroed page
    MemAlloc { envid: EnvId, va: Va, perm: Perm },

    /// Map a page between address spaces
    MemMap {
        srcid: EnvId,
        srcva: Va,
        dstid: EnvId,
        dstva: Va,
        perm: Perm,
    },

    /// Remove a mapping
    MemUnmap { envid: EnvId, va: Va },

    /// Deliver a message to a receiving environment
    IpcCanSend {
        envid: EnvId,
        value: u32,
        srcva: Va,
        perm: Perm,
    },

    /// Wait for a message
    IpcRecv { dstva: Va },
}

impl Syscall {
    /// ABI syscall number
    pub fn number(&self) -> u32 {
        match self {
            Syscall::Putchar { .. } => SYS_PUTCHAR,
            Syscall::GetEnvId => SYS_GETENVID,
            Syscall::Yield => SYS_YIELD,
            Syscall::Panic { .. } => SYS_PANIC,
            Syscall::Cgetc => SYS_CGETC,
            Syscall::EnvAlloc => SYS_ENV_ALLOC,
            Syscall::EnvDestroy { .. } => SYS_ENV_DESTROY,
            Syscall::SetEnvStatus { .. } => SYS_SET_ENV_STATUS,
            Syscall::SetTrapframe { .. } => SYS_SET_TRAPFRAME,
            Syscall::SetPgfaultHandler { .. } => SYS_SET_PGFAULT_HANDLER,
            Syscall::MemAlloc { .. } => SYS_MEM_ALLOC,
            Syscall::MemMap { .. } => SYS_MEM_MAP,
            Syscall::MemUnmap { .. } => SYS_MEM_UNMAP,
            Syscall::IpcCanSend { .. } => SYS_IPC_CAN_SEND,
            Syscall::IpcRecv { .. } => SYS_IPC_RECV,
        }
    }

    /// Up to four raw argument words, for the audit log
    pub fn args(&self) -> [u32; 4] {
        match *self {
            Syscall::Putchar { ch } => [ch as u32, 0, 0, 0],
            Syscall::EnvDestroy { envid } => [envid, 0, 0, 0],
            Syscall::SetEnvStatus { envid, status } => [envid, status as u32, 0, 0],
            Syscall::SetTrapframe { envid, tf } => [envid, tf.pc, tf.sp(), 0],
            Syscall::SetPgfaultHandler {
                envid,
                entry,
                xstacktop,
            } => [envid, entry, xstacktop, 0],
            Syscall::MemAlloc { envid, va, perm } => [envid, va, perm.bits(), 0],
            Syscall::MemMap {
                srcid,
                srcva,
                dstid,
                dstva,
                ..
            } => [srcid, srcva, dstid, dstva],
            Syscall::MemUnmap { envid, va } => [envid, va, 0, 0],
            Syscall::IpcCanSend {
                envid,
                value,
                srcva,
                perm,
            } => [envid, value, srcva, perm.bits()],
            Syscall::IpcRecv { dstva } => [dstva, 0, 0, 0],
            _ => [0; 4],
        }
    }
}

// ============================================================================
// Syscall results
// ============================================================================

/// What the kernel returns to the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyscallResult {
    /// Success with value
    Ok(u32),
    /// Error
    Err(Errno),
    /// The caller is now waiting for an IPC message
    Blocked,
}

impl SyscallResult {
    /// Raw return value: the value, a negative error code, or 0 when blocked
    pub fn to_raw(self) -> i32 {
        match self {
            SyscallResult::Ok(v) => v as i32,
            SyscallResult::Err(e) => e.code(),
            SyscallResult::Blocked => 0,
        }
    }

    /// Convert to a `Result`, treating `Blocked` as success with 0
    pub fn into_result(self) -> Result<u32, Errno> {
        match self {
            SyscallResult::Ok(v) => Ok(v),
            SyscallResult::Err(e) => Err(e),
            SyscallResult::Blocked => Ok(0),
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// State changes the host must react to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A child was allocated
    EnvCreated { id: EnvId, parent: EnvId },
    /// An environment was torn down
    EnvDestroyed { id: EnvId, by: EnvId },
    /// An environment reported a fatal error and was destroyed
    EnvPanicked { id: EnvId, msg: String },
    /// A run status changed
    StatusChanged { id: EnvId, status: EnvStatus },
    /// A trapframe was replaced
    TrapframeSet { id: EnvId },
    /// A message was delivered
    IpcDelivered {
        from: EnvId,
        to: EnvId,
        value: u32,
        page: bool,
    },
    /// An environment started waiting in `ipc_recv`
    IpcBlocked { id: EnvId },
}

/// Result of a step operation
#[derive(Clone, Debug)]
pub struct StepResult {
    /// The syscall result
    pub result: SyscallResult,
    /// Events generated by this step
    pub events: Vec<Event>,
}

impl StepResult {
    fn ok(value: u32) -> Self {
        Self {
            result: SyscallResult::Ok(value),
            events: vec![],
        }
    }

    fn err(e: Errno) -> Self {
        Self {
            result: SyscallResult::Err(e),
            events: vec![],
        }
    }

    fn with(result: SyscallResult, event: Event) -> Self {
        Self {
            result,
            events: vec![event],
        }
    }
}

macro_rules! tri {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(e) => return StepResult::err(e),
        }
    };
}

// ============================================================================
// The step function
// ============================================================================

/// Execute a syscall on the kernel state.
///
/// The caller must be a live environment; otherwise every syscall fails with
/// `BadEnv` (the environment was destroyed while its thread was running).
pub fn step(state: &mut KernelState, caller: EnvId, syscall: Syscall) -> StepResult {
    if !state.env_exists(caller) {
        return StepResult::err(Errno::BadEnv);
    }
    state.update_syscall_metrics(caller);

    match syscall {
        Syscall::Putchar { ch } => {
            state.console.output.push(ch);
            StepResult::ok(0)
        }
        Syscall::GetEnvId => StepResult::ok(caller),
        Syscall::Yield => StepResult::ok(0),
        Syscall::Panic { msg } => step_panic(state, caller, msg),
        Syscall::Cgetc => StepResult::ok(state.console.input.pop_front().unwrap_or(0) as u32),
        Syscall::EnvAlloc => step_env_alloc(state, caller),
        Syscall::EnvDestroy { envid } => step_env_destroy(state, caller, envid),
        Syscall::SetEnvStatus { envid, status } => step_set_env_status(state, caller, envid, status),
        Syscall::SetTrapframe { envid, tf } => step_set_trapframe(state, caller, envid, tf),
        Syscall::SetPgfaultHandler {
            envid,
            entry,
            xstacktop,
        } => step_set_pgfault_handler(state, caller, envid, entry, xstacktop),
        Syscall::MemAlloc { envid, va, perm } => step_mem_alloc(state, caller, envid, va, perm),
        Syscall::MemMap {
            srcid,
            srcva,
            dstid,
            dstva,
            perm,
        } => step_mem_map(state, caller, srcid, srcva, dstid, dstva, perm),
        Syscall::MemUnmap { envid, va } => step_mem_unmap(state, caller, envid, va),
        Syscall::IpcCanSend {
            envid,
            value,
            srcva,
            perm,
        } => step_ipc_can_send(state, caller, envid, value, srcva, perm),
        Syscall::IpcRecv { dstva } => step_ipc_recv(state, caller, dstva),
    }
}

// ============================================================================
// Syscall handlers
// ============================================================================

fn step_panic(state: &mut KernelState, caller: EnvId, msg: String) -> StepResult {
    state.destroy_env(caller);
    StepResult::with(SyscallResult::Ok(0), Event::EnvPanicked { id: caller, msg })
}

fn step_env_alloc(state: &mut KernelState, caller: EnvId) -> StepResult {
    let (name, tf) = match state.env(caller) {
        Some(parent) => (parent.name.clone(), parent.tf),
        None => return StepResult::err(Errno::BadEnv),
    };
    let id = tri!(state.create_env(caller, &name, EnvStatus::NotRunnable));
    if let Some(child) = state.env_mut(id) {
        child.tf = tf;
    }
    StepResult::with(SyscallResult::Ok(id), Event::EnvCreated { id, parent: caller })
}

fn step_env_destroy(state: &mut KernelState, caller: EnvId, envid: EnvId) -> StepResult {
    let id = tri!(state.envid2env(caller, envid, true));
    state.destroy_env(id);
    StepResult::with(SyscallResult::Ok(0), Event::EnvDestroyed { id, by: caller })
}

fn step_set_env_status(
    state: &mut KernelState,
    caller: EnvId,
    envid: EnvId,
    status: EnvStatus,
) -> StepResult {
    if status == EnvStatus::Free {
        return StepResult::err(Errno::Inval);
    }
    let id = tri!(state.envid2env(caller, envid, true));
    let Some(env) = state.env_mut(id) else {
        return StepResult::err(Errno::BadEnv);
    };
    // A receiver only becomes runnable through delivery.
    if env.ipc.recving && status == EnvStatus::Runnable {
        return StepResult::err(Errno::Inval);
    }
    env.status = status;
    StepResult::with(SyscallResult::Ok(0), Event::StatusChanged { id, status })
}

fn step_set_trapframe(state: &mut KernelState, caller: EnvId, envid: EnvId, tf: Trapframe) -> StepResult {
    let id = tri!(state.envid2env(caller, envid, true));
    if let Some(env) = state.env_mut(id) {
        env.tf = tf;
    }
    StepResult::with(SyscallResult::Ok(0), Event::TrapframeSet { id })
}

fn step_set_pgfault_handler(
    state: &mut KernelState,
    caller: EnvId,
    envid: EnvId,
    entry: Va,
    xstacktop: Va,
) -> StepResult {
    let id = tri!(state.envid2env(caller, envid, true));
    if let Some(env) = state.env_mut(id) {
        env.pgfault_handler = entry;
        env.xstacktop = xstacktop;
    }
    StepResult::ok(0)
}

fn check_perm(perm: Perm) -> Result<(), Errno> {
    if !perm.contains(Perm::VALID) || !perm.is_consistent() {
        return Err(Errno::Inval);
    }
    Ok(())
}

fn step_mem_alloc(state: &mut KernelState, caller: EnvId, envid: EnvId, va: Va, perm: Perm) -> StepResult {
    if va >= UTOP {
        return StepResult::err(Errno::Inval);
    }
    tri!(check_perm(perm));
    if perm.contains(Perm::COW) {
        return StepResult::err(Errno::Inval);
    }
    let id = tri!(state.envid2env(caller, envid, true));
    let page = tri!(state.pages.alloc());
    if let Err(e) = state.page_insert(id, va, page, perm) {
        state.pages.reclaim(page);
        return StepResult::err(e);
    }
    StepResult::ok(0)
}

fn step_mem_map(
    state: &mut KernelState,
    caller: EnvId,
    srcid: EnvId,
    srcva: Va,
    dstid: EnvId,
    dstva: Va,
    perm: Perm,
) -> StepResult {
    if srcva >= UTOP || dstva >= UTOP {
        return StepResult::err(Errno::Inval);
    }
    tri!(check_perm(perm));
    let src = tri!(state.envid2env(caller, srcid, true));
    let dst = tri!(state.envid2env(caller, dstid, true));
    let Some(pte) = state.page_lookup(src, srcva) else {
        return StepResult::err(Errno::Inval);
    };
    if perm.contains(Perm::WRITE) && !pte.perm.contains(Perm::WRITE) {
        return StepResult::err(Errno::Inval);
    }
    tri!(state.page_insert(dst, dstva, pte.page, perm));
    StepResult::ok(0)
}

fn step_mem_unmap(state: &mut KernelState, caller: EnvId, envid: EnvId, va: Va) -> StepResult {
    if va >= UTOP {
        return StepResult::err(Errno::Inval);
    }
    let id = tri!(state.envid2env(caller, envid, true));
    state.page_remove(id, va);
    StepResult::ok(0)
}

fn step_ipc_can_send(
    state: &mut KernelState,
    caller: EnvId,
    envid: EnvId,
    value: u32,
    srcva: Va,
    perm: Perm,
) -> StepResult {
    if srcva >= UTOP {
        return StepResult::err(Errno::Inval);
    }
    let target = tri!(state.envid2env(caller, envid, false));
    let (recving, dstva) = match state.env(target) {
        Some(env) => (env.ipc.recving, env.ipc.dstva),
        None => return StepResult::err(Errno::BadEnv),
    };
    if !recving {
        if let Some(env) = state.env_mut(caller) {
            env.metrics.ipc_not_recv += 1;
        }
        return StepResult::err(Errno::IpcNotRecv);
    }

    let mut delivered_perm = Perm::empty();
    if srcva != 0 {
        tri!(check_perm(perm));
        let Some(pte) = state.page_lookup(caller, srcva) else {
            return StepResult::err(Errno::Inval);
        };
        if perm.contains(Perm::WRITE) && !pte.perm.contains(Perm::WRITE) {
            return StepResult::err(Errno::Inval);
        }
        if dstva != 0 {
            tri!(state.page_insert(target, dstva, pte.page, perm));
            delivered_perm = perm;
        }
    }

    if let Some(env) = state.env_mut(target) {
        env.ipc.recving = false;
        env.ipc.from = caller;
        env.ipc.value = value;
        env.ipc.perm = delivered_perm;
        env.status = EnvStatus::Runnable;
        env.metrics.ipc_received += 1;
    }
    if let Some(env) = state.env_mut(caller) {
        env.metrics.ipc_sent += 1;
    }

    StepResult::with(
        SyscallResult::Ok(0),
        Event::IpcDelivered {
            from: caller,
            to: target,
            value,
            page: !delivered_perm.is_empty(),
        },
    )
}

fn step_ipc_recv(state: &mut KernelState, caller: EnvId, dstva: Va) -> StepResult {
    if dstva >= UTOP {
        return StepResult::err(Errno::Inval);
    }
    let Some(env) = state.env_mut(caller) else {
        return StepResult::err(Errno::BadEnv);
    };
    env.ipc.recving = true;
    env.ipc.dstva = dstva;
    env.status = EnvStatus::NotRunnable;
    StepResult::with(SyscallResult::Blocked, Event::IpcBlocked { id: caller })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invariants::check_all_invariants;
    use crate::types::Limits;

    fn setup() -> (KernelState, EnvId) {
        let mut state = KernelState::default();
        let id = state.create_env(0, "init", EnvStatus::Runnable).unwrap();
        (state, id)
    }

    fn child_of(state: &mut KernelState, parent: EnvId) -> EnvId {
        match step(state, parent, Syscall::EnvAlloc).result {
            SyscallResult::Ok(id) => id,
            other => panic!("env_alloc failed: {other:?}"),
        }
    }

    #[test]
    fn test_getenvid_and_metrics() {
        let (mut state, id) = setup();
        assert_eq!(step(&mut state, id, Syscall::GetEnvId).result, SyscallResult::Ok(id));
        assert_eq!(state.env_metrics(id).unwrap().syscall_count, 1);
    }

    #[test]
    fn test_dead_caller_gets_bad_env() {
        let (mut state, id) = setup();
        state.destroy_env(id);
        assert_eq!(
            step(&mut state, id, Syscall::Yield).result,
            SyscallResult::Err(Errno::BadEnv)
        );
    }

    #[test]
    fn test_console_roundtrip() {
        let (mut state, id) = setup();
        step(&mut state, id, Syscall::Putchar { ch: b'x' });
        assert_eq!(state.console.output, b"x");

        assert_eq!(step(&mut state, id, Syscall::Cgetc).result, SyscallResult::Ok(0));
        state.console.input.push_back(b'q');
        assert_eq!(
            step(&mut state, id, Syscall::Cgetc).result,
            SyscallResult::Ok(b'q' as u32)
        );
    }

    #[test]
    fn test_env_alloc_creates_not_runnable_child() {
        let (mut state, parent) = setup();
        let r = step(&mut state, parent, Syscall::EnvAlloc);
        let SyscallResult::Ok(child) = r.result else {
            panic!("expected id");
        };
        assert_eq!(r.events, vec![Event::EnvCreated { id: child, parent }]);
        let env = state.env(child).unwrap();
        assert_eq!(env.status, EnvStatus::NotRunnable);
        assert_eq!(env.parent, parent);
        assert!(env.pgdir.is_empty());
    }

    #[test]
    fn test_env_alloc_budget() {
        let mut state = KernelState::new(Limits {
            max_pages: 8,
            max_envs: 1,
        });
        let id = state.create_env(0, "init", EnvStatus::Runnable).unwrap();
        assert_eq!(
            step(&mut state, id, Syscall::EnvAlloc).result,
            SyscallResult::Err(Errno::NoFreeEnv)
        );
    }

    #[test]
    fn test_env_destroy_requires_parentage() {
        let (mut state, a) = setup();
        let b = state.create_env(0, "b", EnvStatus::Runnable).unwrap();
        assert_eq!(
            step(&mut state, a, Syscall::EnvDestroy { envid: b }).result,
            SyscallResult::Err(Errno::BadEnv)
        );
        let child = child_of(&mut state, a);
        assert_eq!(
            step(&mut state, a, Syscall::EnvDestroy { envid: child }).result,
            SyscallResult::Ok(0)
        );
        assert!(!state.env_exists(child));
    }

    #[test]
    fn test_set_env_status_rejects_free() {
        let (mut state, a) = setup();
        let child = child_of(&mut state, a);
        assert_eq!(
            step(
                &mut state,
                a,
                Syscall::SetEnvStatus {
                    envid: child,
                    status: EnvStatus::Free
                }
            )
            .result,
            SyscallResult::Err(Errno::Inval)
        );
        let r = step(
            &mut state,
            a,
            Syscall::SetEnvStatus {
                envid: child,
                status: EnvStatus::Runnable,
            },
        );
        assert_eq!(r.result, SyscallResult::Ok(0));
        assert_eq!(
            r.events,
            vec![Event::StatusChanged {
                id: child,
                status: EnvStatus::Runnable
            }]
        );
    }

    #[test]
    fn test_mem_alloc_checks() {
        let (mut state, id) = setup();
        let alloc = |state: &mut KernelState, va, perm| {
            step(state, id, Syscall::MemAlloc { envid: 0, va, perm }).result
        };
        assert_eq!(alloc(&mut state, UTOP, Perm::RW), SyscallResult::Err(Errno::Inval));
        assert_eq!(alloc(&mut state, 0x1000, Perm::WRITE), SyscallResult::Err(Errno::Inval));
        assert_eq!(
            alloc(&mut state, 0x1000, Perm::VALID | Perm::COW),
            SyscallResult::Err(Errno::Inval)
        );
        assert_eq!(alloc(&mut state, 0x1234, Perm::RW), SyscallResult::Ok(0));
        assert!(state.page_lookup(id, 0x1000).is_some());
    }

    #[test]
    fn test_mem_alloc_out_of_pages() {
        let mut state = KernelState::new(Limits {
            max_pages: 1,
            max_envs: 4,
        });
        let id = state.create_env(0, "init", EnvStatus::Runnable).unwrap();
        let ok = step(&mut state, id, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::RW });
        assert_eq!(ok.result, SyscallResult::Ok(0));
        let full = step(&mut state, id, Syscall::MemAlloc { envid: 0, va: 0x2000, perm: Perm::RW });
        assert_eq!(full.result, SyscallResult::Err(Errno::NoMem));
    }

    #[test]
    fn test_mem_map_cannot_grant_write() {
        let (mut state, id) = setup();
        step(&mut state, id, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::VALID });
        let r = step(
            &mut state,
            id,
            Syscall::MemMap {
                srcid: 0,
                srcva: 0x1000,
                dstid: 0,
                dstva: 0x2000,
                perm: Perm::RW,
            },
        );
        assert_eq!(r.result, SyscallResult::Err(Errno::Inval));
    }

    #[test]
    fn test_mem_map_shares_page() {
        let (mut state, parent) = setup();
        let child = child_of(&mut state, parent);
        step(&mut state, parent, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::RW });
        let r = step(
            &mut state,
            parent,
            Syscall::MemMap {
                srcid: 0,
                srcva: 0x1000,
                dstid: child,
                dstva: 0x5000,
                perm: Perm::VALID | Perm::COW,
            },
        );
        assert_eq!(r.result, SyscallResult::Ok(0));
        assert_eq!(state.pageref(parent, 0x1000), 2);
        assert_eq!(
            state.page_lookup(parent, 0x1000).unwrap().page,
            state.page_lookup(child, 0x5000).unwrap().page
        );
        assert!(check_all_invariants(&state).is_empty());
    }

    #[test]
    fn test_mem_map_rejects_cow_write() {
        let (mut state, id) = setup();
        step(&mut state, id, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::RW });
        let r = step(
            &mut state,
            id,
            Syscall::MemMap {
                srcid: 0,
                srcva: 0x1000,
                dstid: 0,
                dstva: 0x2000,
                perm: Perm::RW | Perm::COW,
            },
        );
        assert_eq!(r.result, SyscallResult::Err(Errno::Inval));
    }

    #[test]
    fn test_mem_unmap() {
        let (mut state, id) = setup();
        step(&mut state, id, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::RW });
        assert_eq!(
            step(&mut state, id, Syscall::MemUnmap { envid: 0, va: 0x1000 }).result,
            SyscallResult::Ok(0)
        );
        assert!(state.page_lookup(id, 0x1000).is_none());
        assert_eq!(state.pages.in_use(), 0);
        // Unmapping an empty slot is not an error.
        assert_eq!(
            step(&mut state, id, Syscall::MemUnmap { envid: 0, va: 0x1000 }).result,
            SyscallResult::Ok(0)
        );
    }

    #[test]
    fn test_ipc_send_to_non_receiver() {
        let (mut state, a) = setup();
        let b = state.create_env(0, "b", EnvStatus::Runnable).unwrap();
        let r = step(
            &mut state,
            a,
            Syscall::IpcCanSend {
                envid: b,
                value: 1,
                srcva: 0,
                perm: Perm::empty(),
            },
        );
        assert_eq!(r.result, SyscallResult::Err(Errno::IpcNotRecv));
        assert_eq!(state.env_metrics(a).unwrap().ipc_not_recv, 1);
    }

    #[test]
    fn test_ipc_send_to_missing_env() {
        let (mut state, a) = setup();
        let r = step(
            &mut state,
            a,
            Syscall::IpcCanSend {
                envid: 0x9999,
                value: 1,
                srcva: 0,
                perm: Perm::empty(),
            },
        );
        assert_eq!(r.result, SyscallResult::Err(Errno::BadEnv));
    }

    #[test]
    fn test_ipc_delivery_with_page() {
        let (mut state, a) = setup();
        let b = state.create_env(0, "b", EnvStatus::Runnable).unwrap();

        let r = step(&mut state, b, Syscall::IpcRecv { dstva: 0x8000 });
        assert_eq!(r.result, SyscallResult::Blocked);
        assert_eq!(state.env(b).unwrap().status, EnvStatus::NotRunnable);

        step(&mut state, a, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::RW });
        let r = step(
            &mut state,
            a,
            Syscall::IpcCanSend {
                envid: b,
                value: 42,
                srcva: 0x1000,
                perm: Perm::VALID,
            },
        );
        assert_eq!(r.result, SyscallResult::Ok(0));

        let env = state.env(b).unwrap();
        assert!(!env.ipc.recving);
        assert_eq!(env.status, EnvStatus::Runnable);
        assert_eq!((env.ipc.from, env.ipc.value, env.ipc.perm), (a, 42, Perm::VALID));
        assert_eq!(state.pageref(b, 0x8000), 2);
        assert!(check_all_invariants(&state).is_empty());
    }

    #[test]
    fn test_ipc_no_page_when_receiver_declines() {
        let (mut state, a) = setup();
        let b = state.create_env(0, "b", EnvStatus::Runnable).unwrap();
        step(&mut state, b, Syscall::IpcRecv { dstva: 0 });
        step(&mut state, a, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::RW });
        step(
            &mut state,
            a,
            Syscall::IpcCanSend {
                envid: b,
                value: 7,
                srcva: 0x1000,
                perm: Perm::RW,
            },
        );
        let env = state.env(b).unwrap();
        assert_eq!(env.ipc.perm, Perm::empty());
        assert!(env.pgdir.is_empty());
    }

    #[test]
    fn test_ipc_receiver_cannot_be_woken_by_status() {
        let (mut state, a) = setup();
        let child = child_of(&mut state, a);
        step(&mut state, child, Syscall::IpcRecv { dstva: 0 });
        let r = step(
            &mut state,
            a,
            Syscall::SetEnvStatus {
                envid: child,
                status: EnvStatus::Runnable,
            },
        );
        assert_eq!(r.result, SyscallResult::Err(Errno::Inval));
    }

    #[test]
    fn test_panic_destroys_caller() {
        let (mut state, a) = setup();
        step(&mut state, a, Syscall::MemAlloc { envid: 0, va: 0x1000, perm: Perm::RW });
        let r = step(
            &mut state,
            a,
            Syscall::Panic {
                msg: String::from("boom"),
            },
        );
        assert_eq!(
            r.events,
            vec![Event::EnvPanicked {
                id: a,
                msg: String::from("boom")
            }]
        );
        assert!(!state.env_exists(a));
        assert_eq!(state.pages.in_use(), 0);
    }

    #[test]
    fn test_syscall_numbers() {
        assert_eq!(Syscall::EnvAlloc.number(), SYS_ENV_ALLOC);
        assert_eq!(Syscall::IpcRecv { dstva: 0 }.number(), SYS_IPC_RECV);
        assert_eq!(
            Syscall::MemUnmap { envid: 1, va: 0x2000 }.args(),
            [1, 0x2000, 0, 0]
        );
    }
}
