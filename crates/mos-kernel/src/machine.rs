//! The hosted machine.
//!
//! Each runnable environment runs on its own host thread. All of them share
//! one [`KernelState`] behind a mutex; every syscall is one call to
//! [`step`] under that lock, logged to the [`SysLog`]. Environments blocked in
//! `ipc_recv` park on a condition variable that is signalled whenever a
//! message is delivered or an environment goes away.
//!
//! A destroyed environment never runs again: its next syscall unwinds its
//! thread, the way `env_destroy(0)` never returns on real hardware.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use mos_ipc::mmu::{BY2PG, UTEXT};
use mos_ipc::{EnvId, EnvStatus, Errno, IpcDelivery, Resume, Trapframe, Va};
use mos_kernel_core::{
    check_all_invariants, step, EnvInfo, EnvMetrics, Event, InvariantViolation, KernelState,
    Syscall, SyscallResult,
};

use crate::config::MachineConfig;
use crate::gateway::EnvGateway;
use crate::syslog::{SysEvent, SysLog};

/// Program entry: receives the environment's gateway and its initial
/// trapframe (argument registers and stack pointer).
pub type Program = Arc<dyn Fn(EnvGateway, Trapframe) + Send + Sync + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Unwind payload for an environment whose slot is gone.
pub(crate) struct EnvGone;

/// Errors from the machine's host-side API.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// The kernel refused the request
    #[error("kernel error: {0}")]
    Errno(#[from] Errno),
    /// The environment exited or was destroyed before its body returned
    #[error("environment {0:08x} exited")]
    EnvExited(EnvId),
}

/// Everything guarded by the kernel lock.
pub(crate) struct Kernel {
    pub(crate) state: KernelState,
    syslog: SysLog,
    programs: BTreeMap<Va, (String, Program)>,
    resumes: HashMap<EnvId, Resume<EnvGateway>>,
    started: BTreeSet<EnvId>,
    crashes: Vec<String>,
    next_entry: Va,
}

pub(crate) struct Shared {
    kernel: Mutex<Kernel>,
    wakeup: Condvar,
    threads: Mutex<Vec<JoinHandle<()>>>,
    config: MachineConfig,
    boot: Instant,
}

/// A running MOS machine.
pub struct Machine {
    shared: Arc<Shared>,
}

impl Machine {
    /// Create a machine with no environments.
    pub fn new(config: MachineConfig) -> Self {
        let kernel = Kernel {
            state: KernelState::new(config.limits()),
            syslog: SysLog::new(config.syslog_capacity),
            programs: BTreeMap::new(),
            resumes: HashMap::new(),
            started: BTreeSet::new(),
            crashes: Vec::new(),
            next_entry: UTEXT,
        };
        Self {
            shared: Arc::new(Shared {
                kernel: Mutex::new(kernel),
                wakeup: Condvar::new(),
                threads: Mutex::new(Vec::new()),
                config,
                boot: Instant::now(),
            }),
        }
    }

    /// Create a runnable top-level environment running `main` on its own thread.
    pub fn boot<F>(&self, name: &str, main: F) -> Result<EnvId, Errno>
    where
        F: FnOnce(EnvGateway) + Send + 'static,
    {
        let mut k = self.shared.kernel.lock();
        let id = k.state.create_env(0, name, EnvStatus::NotRunnable)?;
        k.resumes.insert(id, Box::new(main));
        if let Some(env) = k.state.env_mut(id) {
            env.status = EnvStatus::Runnable;
        }
        log::info!("[{id:08x}] boot {name}");
        self.shared.start_env(&mut k, id);
        Ok(id)
    }

    /// Run `body` as a fresh top-level environment on the calling thread.
    ///
    /// The environment is destroyed when `body` returns. If it exits (or is
    /// destroyed) first, the result is [`MachineError::EnvExited`]; any other
    /// panic inside `body` propagates.
    pub fn run_env<R, F>(&self, name: &str, body: F) -> Result<R, MachineError>
    where
        F: FnOnce(EnvGateway) -> R,
    {
        let id = {
            let mut k = self.shared.kernel.lock();
            let id = k.state.create_env(0, name, EnvStatus::Runnable)?;
            k.started.insert(id);
            id
        };
        log::info!("[{id:08x}] run {name}");
        let gateway = EnvGateway::new(id, Arc::clone(&self.shared));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(gateway)));
        self.shared.reap(id);
        match outcome {
            Ok(r) => Ok(r),
            Err(payload) if payload.is::<EnvGone>() => Err(MachineError::EnvExited(id)),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Register a program image entry point. Returns the entry address a
    /// spawn image should carry.
    pub fn install_program<F>(&self, name: &str, program: F) -> Va
    where
        F: Fn(EnvGateway, Trapframe) + Send + Sync + 'static,
    {
        let mut k = self.shared.kernel.lock();
        let entry = k.next_entry;
        k.next_entry += BY2PG;
        k.programs.insert(entry, (name.to_string(), Arc::new(program)));
        log::debug!("installed program {name} at {entry:08x}");
        entry
    }

    /// Queue characters for `cgetc`
    pub fn push_console_input(&self, bytes: &[u8]) {
        let mut k = self.shared.kernel.lock();
        k.state.console.input.extend(bytes.iter().copied());
        drop(k);
        self.shared.wakeup.notify_all();
    }

    /// Everything written with `putchar` so far
    pub fn console_output(&self) -> Vec<u8> {
        self.shared.kernel.lock().state.console.output.clone()
    }

    /// Metrics of a live environment
    pub fn env_metrics(&self, id: EnvId) -> Option<EnvMetrics> {
        self.shared.kernel.lock().state.env_metrics(id)
    }

    /// Every live environment
    pub fn envs(&self) -> Vec<EnvInfo> {
        self.shared.kernel.lock().state.list_envs()
    }

    /// Whether an environment is alive
    pub fn env_exists(&self, id: EnvId) -> bool {
        self.shared.kernel.lock().state.env_exists(id)
    }

    /// Pages currently allocated
    pub fn pages_in_use(&self) -> u32 {
        self.shared.kernel.lock().state.pages.in_use()
    }

    /// Wait until `id` no longer exists. Returns false on timeout.
    pub fn wait_for_exit(&self, id: EnvId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut k = self.shared.kernel.lock();
        while k.state.env_exists(id) {
            if self.shared.wakeup.wait_until(&mut k, deadline).timed_out() {
                return !k.state.env_exists(id);
            }
        }
        true
    }

    /// Check every kernel invariant
    pub fn check_invariants(&self) -> Vec<InvariantViolation> {
        check_all_invariants(&self.shared.kernel.lock().state)
    }

    /// The most recent syscall events, newest first
    pub fn recent_syscalls(&self, count: usize) -> Vec<SysEvent> {
        self.shared.kernel.lock().syslog.get_recent(count)
    }

    /// Syscall numbers requested by one environment, oldest first
    pub fn syscalls_of(&self, id: EnvId) -> Vec<u32> {
        self.shared.kernel.lock().syslog.requests_of(id)
    }

    /// Rust panics that escaped environment threads
    pub fn crashes(&self) -> Vec<String> {
        self.shared.kernel.lock().crashes.clone()
    }

    /// Destroy every environment and join their threads.
    pub fn shutdown(&self) {
        {
            let mut k = self.shared.kernel.lock();
            let ids: Vec<EnvId> = k.state.envs.keys().copied().collect();
            for id in ids {
                k.state.destroy_env(id);
            }
            k.resumes.clear();
        }
        self.shared.wakeup.notify_all();
        let handles = std::mem::take(&mut *self.shared.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                log::error!("environment thread panicked during shutdown");
            }
        }
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Syscall dispatch
// ============================================================================

impl Shared {
    fn uptime_nanos(&self) -> u64 {
        self.boot.elapsed().as_nanos() as u64
    }

    /// Run one syscall under the kernel lock and react to its events.
    ///
    /// Returns the guard so callers that must wait can keep it.
    fn dispatch<'a>(
        self: &'a Arc<Self>,
        caller: EnvId,
        syscall: Syscall,
    ) -> (SyscallResult, MutexGuard<'a, Kernel>) {
        let mut k = self.kernel.lock();
        let ts = self.uptime_nanos();
        let num = syscall.number();
        let req = k.syslog.log_request(caller, num, syscall.args(), ts);
        log::trace!("[{caller:08x}] {}{:x?}", mos_ipc::syscall::name(num), syscall.args());

        let r = step(&mut k.state, caller, syscall);
        k.syslog.log_response(caller, req, r.result.to_raw() as i64, ts);
        self.handle_events(&mut k, r.events);
        (r.result, k)
    }

    /// Run one syscall; unwind if the caller is gone afterwards.
    pub(crate) fn syscall(self: &Arc<Self>, caller: EnvId, syscall: Syscall) -> Result<u32, Errno> {
        let (result, k) = self.dispatch(caller, syscall);
        let alive = k.state.env_exists(caller);
        drop(k);
        if !alive {
            env_gone(caller);
        }
        result.into_result()
    }

    /// `yield`: give other environments the lock for up to one quantum.
    pub(crate) fn yield_now(self: &Arc<Self>, caller: EnvId) {
        let (_, mut k) = self.dispatch(caller, Syscall::Yield);
        if !k.state.env_exists(caller) {
            drop(k);
            env_gone(caller);
        }
        self.wakeup.wait_for(&mut k, self.config.yield_quantum());
    }

    /// `ipc_recv`: block until a sender delivers.
    pub(crate) fn recv(self: &Arc<Self>, caller: EnvId, dstva: Va) -> Result<IpcDelivery, Errno> {
        let (result, mut k) = self.dispatch(caller, Syscall::IpcRecv { dstva });
        if let SyscallResult::Err(e) = result {
            let alive = k.state.env_exists(caller);
            drop(k);
            if !alive {
                env_gone(caller);
            }
            return Err(e);
        }
        loop {
            let waiting = k.state.env(caller).map(|env| {
                let delivery = IpcDelivery {
                    from: env.ipc.from,
                    value: env.ipc.value,
                    perm: env.ipc.perm,
                };
                (env.ipc.recving, delivery)
            });
            match waiting {
                Some((true, _)) => self.wakeup.wait(&mut k),
                Some((false, delivery)) => return Ok(delivery),
                None => {
                    drop(k);
                    env_gone(caller);
                }
            }
        }
    }

    /// `env_alloc`: allocate a child that resumes in `resume`.
    pub(crate) fn env_alloc(self: &Arc<Self>, caller: EnvId, resume: Resume<EnvGateway>) -> Result<EnvId, Errno> {
        let (result, mut k) = self.dispatch(caller, Syscall::EnvAlloc);
        match result {
            SyscallResult::Ok(id) => {
                k.resumes.insert(id, resume);
                Ok(id)
            }
            other => {
                let alive = k.state.env_exists(caller);
                drop(k);
                if !alive {
                    env_gone(caller);
                }
                other.into_result()
            }
        }
    }

    /// Read-only access to the kernel state on behalf of a live caller.
    pub(crate) fn with_state<R>(&self, caller: EnvId, f: impl FnOnce(&KernelState) -> R) -> R {
        let k = self.kernel.lock();
        if !k.state.env_exists(caller) {
            drop(k);
            env_gone(caller);
        }
        f(&k.state)
    }

    /// Mutable access for memory stores. A store that gets the caller
    /// destroyed does not return.
    pub(crate) fn with_state_mut<R>(self: &Arc<Self>, caller: EnvId, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let mut k = self.kernel.lock();
        if !k.state.env_exists(caller) {
            drop(k);
            env_gone(caller);
        }
        let r = f(&mut k.state);
        if !k.state.env_exists(caller) {
            log::warn!("[{caller:08x}] destroyed by write fault");
            k.resumes.remove(&caller);
            drop(k);
            self.wakeup.notify_all();
            env_gone(caller);
        }
        r
    }

    fn handle_events(self: &Arc<Self>, k: &mut Kernel, events: Vec<Event>) {
        let mut wake = false;
        for event in events {
            match event {
                Event::EnvCreated { id, parent } => {
                    log::debug!("[{parent:08x}] allocated {id:08x}");
                }
                Event::EnvDestroyed { id, by } => {
                    log::info!("[{by:08x}] destroying {id:08x}");
                    k.resumes.remove(&id);
                    wake = true;
                }
                Event::EnvPanicked { id, msg } => {
                    log::warn!("[{id:08x}] panic: {msg}");
                    k.resumes.remove(&id);
                    wake = true;
                }
                Event::StatusChanged { id, status } => {
                    if status == EnvStatus::Runnable {
                        self.start_env(k, id);
                    }
                }
                Event::TrapframeSet { id } => {
                    k.resumes.remove(&id);
                }
                Event::IpcDelivered { .. } | Event::IpcBlocked { .. } => wake = true,
            }
        }
        if wake {
            self.wakeup.notify_all();
        }
    }

    // ========================================================================
    // Threads
    // ========================================================================

    /// Start the thread of a runnable environment, once.
    fn start_env(self: &Arc<Self>, k: &mut Kernel, id: EnvId) {
        if k.started.contains(&id) {
            return;
        }
        let Some(tf) = k.state.env(id).map(|e| e.tf) else {
            return;
        };
        let gateway = EnvGateway::new(id, Arc::clone(self));

        let job: Job = if let Some(resume) = k.resumes.remove(&id) {
            Box::new(move || resume(gateway))
        } else if let Some((name, program)) = k.programs.get(&tf.pc) {
            let program = Arc::clone(program);
            if let Some(env) = k.state.env_mut(id) {
                env.name = name.clone();
            }
            Box::new(move || program(gateway, tf))
        } else {
            log::warn!("[{id:08x}] no program at {:08x}", tf.pc);
            k.state.destroy_env(id);
            self.wakeup.notify_all();
            return;
        };
        k.started.insert(id);

        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("env-{id:08x}"))
            .spawn(move || shared.run_thread(id, job));
        match spawned {
            Ok(handle) => self.threads.lock().push(handle),
            Err(e) => {
                log::error!("[{id:08x}] failed to start thread: {e}");
                k.state.destroy_env(id);
                self.wakeup.notify_all();
            }
        }
    }

    fn run_thread(self: Arc<Self>, id: EnvId, job: Job) {
        log::debug!("[{id:08x}] running");
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
            if !payload.is::<EnvGone>() {
                let msg = panic_message(&*payload);
                log::error!("[{id:08x}] crashed: {msg}");
                self.kernel.lock().crashes.push(format!("{id:08x}: {msg}"));
            }
        }
        self.reap(id);
    }

    /// Destroy an environment whose body has finished.
    fn reap(&self, id: EnvId) {
        let mut k = self.kernel.lock();
        if k.state.destroy_env(id) {
            log::debug!("[{id:08x}] reaped");
        }
        k.resumes.remove(&id);
        drop(k);
        self.wakeup.notify_all();
    }
}

fn env_gone(id: EnvId) -> ! {
    log::trace!("[{id:08x}] gone, unwinding");
    panic::resume_unwind(Box::new(EnvGone))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
