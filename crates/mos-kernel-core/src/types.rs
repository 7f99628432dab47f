//! Core kernel types
//!
//! This module contains the fundamental types used throughout the kernel core.
//! All types here are pure data.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use serde::{Deserialize, Serialize};

use mos_ipc::mmu::BY2PG;
use mos_ipc::{EnvId, EnvStatus, Perm, Trapframe, Va};

/// Index of a physical page in the page arena
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

/// One physical page
pub struct PageFrame {
    /// Page contents
    pub data: Box<[u8; BY2PG as usize]>,
    /// Number of page-table entries (across all environments) pointing here
    pub refs: u32,
}

impl PageFrame {
    /// A zero-filled, unreferenced page
    pub fn zeroed() -> Self {
        Self {
            data: Box::new([0u8; BY2PG as usize]),
            refs: 0,
        }
    }
}

/// Page-table entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pte {
    /// Backing physical page
    pub page: PageId,
    /// Permission bits
    pub perm: Perm,
}

/// Pending-receive state of an environment
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpcState {
    /// Blocked in `ipc_recv`, waiting for a sender
    pub recving: bool,
    /// Where a transferred page should be mapped (0 = no page)
    pub dstva: Va,
    /// Sender of the last delivered message
    pub from: EnvId,
    /// Value of the last delivered message
    pub value: u32,
    /// Permission of the last transferred page
    pub perm: Perm,
}

/// Per-environment resource tracking
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvMetrics {
    /// Syscalls made
    pub syscall_count: u64,
    /// Messages delivered by this environment
    pub ipc_sent: u64,
    /// Messages delivered to this environment
    pub ipc_received: u64,
    /// `ipc_can_send` attempts rejected because the target was not receiving
    pub ipc_not_recv: u64,
    /// Write faults delivered to this environment's handler
    pub pgfaults: u64,
    /// Pages currently mapped
    pub mapped_pages: u64,
}

/// Environment descriptor
pub struct Env {
    /// Environment id
    pub id: EnvId,
    /// Parent environment (0 for boot environments)
    pub parent: EnvId,
    /// Human-readable name for logs
    pub name: String,
    /// Run status
    pub status: EnvStatus,
    /// Address space: virtual page number -> entry
    pub pgdir: BTreeMap<u32, Pte>,
    /// IPC receive state
    pub ipc: IpcState,
    /// Registered page-fault entry (0 = none)
    pub pgfault_handler: Va,
    /// Exception stack top registered with the handler
    pub xstacktop: Va,
    /// Saved registers
    pub tf: Trapframe,
    /// Resource tracking
    pub metrics: EnvMetrics,
}

impl Env {
    /// A fresh environment with an empty address space
    pub fn new(id: EnvId, parent: EnvId, name: String, status: EnvStatus) -> Self {
        Self {
            id,
            parent,
            name,
            status,
            pgdir: BTreeMap::new(),
            ipc: IpcState::default(),
            pgfault_handler: 0,
            xstacktop: 0,
            tf: Trapframe::default(),
            metrics: EnvMetrics::default(),
        }
    }

    /// Look up the entry for the page containing `va`
    pub fn pte(&self, va: Va) -> Option<&Pte> {
        self.pgdir.get(&mos_ipc::mmu::vpn(va))
    }
}

/// Summary of an environment for listings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvInfo {
    /// Environment id
    pub id: EnvId,
    /// Parent id
    pub parent: EnvId,
    /// Name
    pub name: String,
    /// Run status
    pub status: EnvStatus,
    /// Metrics snapshot
    pub metrics: EnvMetrics,
}

/// Kernel resource limits
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Physical pages available to all environments
    pub max_pages: u32,
    /// Live environments allowed at once
    pub max_envs: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pages: 16 * 1024,
            max_envs: mos_ipc::envs::NENV,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_frame_zeroed() {
        let frame = PageFrame::zeroed();
        assert_eq!(frame.refs, 0);
        assert!(frame.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_env_pte_lookup_uses_page_number() {
        let mut env = Env::new(0x400, 0, String::from("t"), EnvStatus::Runnable);
        env.pgdir.insert(
            0x1234,
            Pte {
                page: PageId(7),
                perm: Perm::RW,
            },
        );
        assert_eq!(env.pte(0x0123_4abc).map(|p| p.page), Some(PageId(7)));
        assert!(env.pte(0x0123_5000).is_none());
    }
}
