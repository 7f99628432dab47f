//! Program entry and exit.
//!
//! Every environment the runtime starts, whether spawned or forked, ends in
//! [`exit_with`]: descriptors are closed (flushing writable files), then the
//! environment is destroyed. A fatal error is printed and reported through
//! the kernel's `panic` call instead.

use alloc::string::String;
use core::fmt::Write;

use mos_ipc::{Syscalls, Trapframe};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::spawn::read_args;

/// Run a spawned program: decode its arguments from `tf`, call `umain`, exit.
pub fn libmain<S, F>(sys: S, tf: Trapframe, umain: F)
where
    S: Syscalls,
    F: FnOnce(&Runtime<S>, &[String]) -> Result<()>,
{
    libmain_with_config(sys, tf, RuntimeConfig::default(), umain)
}

/// [`libmain`] with an explicit runtime configuration.
pub fn libmain_with_config<S, F>(sys: S, tf: Trapframe, config: RuntimeConfig, umain: F)
where
    S: Syscalls,
    F: FnOnce(&Runtime<S>, &[String]) -> Result<()>,
{
    let rt = Runtime::new(sys, config);
    let outcome = read_args(&rt, &tf).and_then(|args| umain(&rt, &args));
    exit_with(&rt, outcome);
}

/// Close every descriptor and destroy the calling environment.
pub fn exit<S: Syscalls>(rt: &Runtime<S>) {
    rt.close_all();
    let _ = rt.syscall_env_destroy(0);
}

/// Finish a program with its outcome.
///
/// Errors other than fatal ones are logged and the program exits normally.
pub fn exit_with<S: Syscalls>(rt: &Runtime<S>, outcome: Result<()>) {
    match outcome {
        Ok(()) => exit(rt),
        Err(Error::Fatal { msg, file, line }) => {
            let _ = writeln!(rt.console(), "panic at {}:{}: {}", file, line, msg);
            rt.close_all();
            rt.syscall_panic(&msg);
            // Only reached if the kernel let us keep running.
            let _ = rt.syscall_env_destroy(0);
        }
        Err(Error::Errno(e)) => {
            log::debug!("[{:08x}] exiting with error: {}", rt.envid(), e);
            exit(rt);
        }
    }
}
