//! Kernel state - all mutable kernel data
//!
//! This module contains the KernelState struct that holds all kernel data.
//! The state is manipulated only through the step function and the
//! memory-access helpers in [`crate::mmu`].

use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;

use mos_ipc::envs::ENV_ID_BASE;
use mos_ipc::mmu::{self, UTOP};
use mos_ipc::{EnvId, EnvStatus, Errno, Perm, Va};

use crate::pages::PageArena;
use crate::types::{Env, EnvInfo, EnvMetrics, Limits, PageId, Pte};

/// Console character queues
#[derive(Default)]
pub struct Console {
    /// Characters written with `putchar`
    pub output: Vec<u8>,
    /// Characters waiting for `cgetc`
    pub input: VecDeque<u8>,
}

/// Kernel state - all mutable kernel data
pub struct KernelState {
    /// Live environments
    pub envs: BTreeMap<EnvId, Env>,
    /// Physical pages
    pub pages: PageArena,
    /// Console queues
    pub console: Console,
    /// Resource limits
    pub limits: Limits,
    /// Next environment id to hand out
    pub next_env_id: EnvId,
}

impl KernelState {
    /// Create an empty kernel state
    pub fn new(limits: Limits) -> Self {
        Self {
            envs: BTreeMap::new(),
            pages: PageArena::new(limits.max_pages),
            console: Console::default(),
            limits,
            next_env_id: ENV_ID_BASE,
        }
    }

    // ========================================================================
    // ID allocation
    // ========================================================================

    /// Allocate a new environment id. Ids are never reused.
    pub fn alloc_env_id(&mut self) -> EnvId {
        let id = self.next_env_id;
        self.next_env_id += 1;
        id
    }

    // ========================================================================
    // Environment accessors
    // ========================================================================

    /// Get an environment by id
    pub fn env(&self, id: EnvId) -> Option<&Env> {
        self.envs.get(&id)
    }

    /// Get a mutable environment by id
    pub fn env_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        self.envs.get_mut(&id)
    }

    /// Check if an environment exists
    pub fn env_exists(&self, id: EnvId) -> bool {
        self.envs.contains_key(&id)
    }

    /// Resolve an id as seen by `caller`.
    ///
    /// `0` means the caller itself. With `checkperm`, only the caller and
    /// its immediate children may be named.
    pub fn envid2env(&self, caller: EnvId, envid: EnvId, checkperm: bool) -> Result<EnvId, Errno> {
        let id = if envid == 0 { caller } else { envid };
        let env = self.envs.get(&id).ok_or(Errno::BadEnv)?;
        if checkperm && env.id != caller && env.parent != caller {
            return Err(Errno::BadEnv);
        }
        Ok(id)
    }

    /// Snapshot of every live environment
    pub fn list_envs(&self) -> Vec<EnvInfo> {
        self.envs
            .values()
            .map(|e| EnvInfo {
                id: e.id,
                parent: e.parent,
                name: e.name.clone(),
                status: e.status,
                metrics: self.metrics_of(e),
            })
            .collect()
    }

    /// Metrics of one environment
    pub fn env_metrics(&self, id: EnvId) -> Option<EnvMetrics> {
        self.envs.get(&id).map(|e| self.metrics_of(e))
    }

    fn metrics_of(&self, env: &Env) -> EnvMetrics {
        let mut m = env.metrics.clone();
        m.mapped_pages = env.pgdir.len() as u64;
        m
    }

    // ========================================================================
    // Environment lifecycle
    // ========================================================================

    /// Create a fresh environment with an empty address space.
    pub fn create_env(&mut self, parent: EnvId, name: &str, status: EnvStatus) -> Result<EnvId, Errno> {
        if self.envs.len() as u32 >= self.limits.max_envs {
            return Err(Errno::NoFreeEnv);
        }
        let id = self.alloc_env_id();
        self.envs.insert(id, Env::new(id, parent, String::from(name), status));
        Ok(id)
    }

    /// Tear down an environment and release every page it maps.
    pub fn destroy_env(&mut self, id: EnvId) -> bool {
        let Some(env) = self.envs.remove(&id) else {
            return false;
        };
        for pte in env.pgdir.values() {
            self.pages.decref(pte.page);
        }
        true
    }

    // ========================================================================
    // Page tables
    // ========================================================================

    /// Map `page` at `va` in `envid`, replacing any previous mapping.
    pub fn page_insert(&mut self, envid: EnvId, va: Va, page: PageId, perm: Perm) -> Result<(), Errno> {
        if va >= UTOP {
            return Err(Errno::Inval);
        }
        let vpn = mmu::vpn(va);
        self.pages.incref(page);
        let old = match self.envs.get_mut(&envid) {
            Some(env) => env.pgdir.insert(vpn, Pte { page, perm }),
            None => {
                self.pages.decref(page);
                return Err(Errno::BadEnv);
            }
        };
        if let Some(old) = old {
            self.pages.decref(old.page);
        }
        Ok(())
    }

    /// Remove the mapping at `va` in `envid`, if any.
    pub fn page_remove(&mut self, envid: EnvId, va: Va) {
        let removed = self
            .envs
            .get_mut(&envid)
            .and_then(|env| env.pgdir.remove(&mmu::vpn(va)));
        if let Some(pte) = removed {
            self.pages.decref(pte.page);
        }
    }

    /// Look up the entry for `va` in `envid`
    pub fn page_lookup(&self, envid: EnvId, va: Va) -> Option<Pte> {
        self.envs.get(&envid).and_then(|e| e.pte(va)).copied()
    }

    /// Number of mappings of the page behind `va` in `envid`
    pub fn pageref(&self, envid: EnvId, va: Va) -> u32 {
        self.page_lookup(envid, va)
            .map(|pte| self.pages.refs(pte.page))
            .unwrap_or(0)
    }

    /// Whether any page in 4 MiB region `pdx` is mapped in `envid`
    pub fn pde_present(&self, envid: EnvId, pdx: u32) -> bool {
        let Some(env) = self.envs.get(&envid) else {
            return false;
        };
        let first = pdx.saturating_mul(mmu::NPTE);
        let last = first.saturating_add(mmu::NPTE);
        env.pgdir.range(first..last).next().is_some()
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Count one syscall against `envid`
    pub fn update_syscall_metrics(&mut self, envid: EnvId) {
        if let Some(env) = self.envs.get_mut(&envid) {
            env.metrics.syscall_count += 1;
        }
    }

    /// Total pages mapped across all environments
    pub fn total_mappings(&self) -> usize {
        self.envs.values().map(|e| e.pgdir.len()).sum()
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}
