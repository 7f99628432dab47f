//! MOS Kernel Core - Pure State Machine
//!
//! This crate contains the **thread-free** kernel state machine behind the
//! hosted MOS machine: environments, the physical page arena, per-environment
//! page tables, IPC rendezvous state and the simulated MMU.
//!
//! # Design Principles
//!
//! 1. **No threads or I/O**: blocking and scheduling live in `mos-kernel`
//! 2. **Deterministic**: same state + syscall always produces the same result
//! 3. **Checkable**: [`check_all_invariants`] runs after any step in tests
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    mos-kernel-core                          │
//! │                 (Pure State Machine)                        │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │  KernelState  │    │    step()     │                    │
//! │   │  - envs       │───▶│  syscall      │                    │
//! │   │  - pages      │    │  transformer  │                    │
//! │   │  - console    │    └───────────────┘                    │
//! │   └───────────────┘                                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                    │
//! │   │  load/store   │    │  Invariants   │                    │
//! │   │  write faults │    │  Assertions   │                    │
//! │   └───────────────┘    └───────────────┘                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      mos-kernel                             │
//! │                  (Hosted Machine)                           │
//! │                                                             │
//! │   - one host thread per runnable environment                │
//! │   - ipc_recv parking and wakeup                             │
//! │   - SysLog audit trail                                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Env, page-table entries, metrics, limits
//! - `pages` - Reference-counted physical page arena
//! - `state` - KernelState struct with all kernel data
//! - `step` - `step(state, caller, syscall) -> StepResult`
//! - `mmu` - Loads, stores and write-fault delivery
//! - `invariants` - Invariant assertions

#![no_std]
extern crate alloc;

pub mod invariants;
pub mod mmu;
pub mod pages;
pub mod state;
pub mod step;
pub mod types;

pub use invariants::{assert_invariants, check_all_invariants, InvariantViolation};
pub use mmu::FaultDisposition;
pub use pages::PageArena;
pub use state::{Console, KernelState};
pub use step::{step, Event, StepResult, Syscall, SyscallResult};
pub use types::{Env, EnvInfo, EnvMetrics, IpcState, Limits, PageFrame, PageId, Pte};
