//! MOS Hosted Machine
//!
//! This crate runs MOS environments on host threads on top of the pure
//! kernel state machine in `mos-kernel-core`:
//! - [`Machine`] owns the kernel state, the program table and the threads
//! - [`EnvGateway`] is the [`mos_ipc::Syscalls`] implementation each environment gets
//! - [`SysLog`] records every syscall request and response
//!
//! # Running code
//!
//! ```text
//! Machine::boot(name, main)        new env, own thread (e.g. the file server)
//! Machine::run_env(name, body)     new env, caller's thread, result returned
//! Machine::install_program(f)      entry address for spawn images
//! ```
//!
//! A child created with `env_alloc` starts on its own thread once it is made
//! runnable: it runs the resume continuation passed to `env_alloc`, or the
//! installed program at its trapframe's `pc` if the trapframe was replaced.

mod config;
mod gateway;
mod machine;
mod syslog;

pub use config::MachineConfig;
pub use gateway::EnvGateway;
pub use machine::{Machine, MachineError, Program};
pub use syslog::{EventId, SysEvent, SysEventType, SysLog};

pub use mos_kernel_core::{EnvInfo, EnvMetrics, InvariantViolation};
