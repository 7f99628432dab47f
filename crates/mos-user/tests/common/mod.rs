//! Shared setup for the runtime integration tests.

#![allow(dead_code)]

use std::time::Duration;

use mos_ipc::envs::FS_SERVER;
use mos_ipc::EnvId;
use mos_kernel::{EnvGateway, Machine};
use mos_user::testing::MemoryFs;
use mos_user::{Runtime, RuntimeConfig};

pub const WAIT: Duration = Duration::from_secs(10);

/// Scratch page for tests that need plain writable memory
pub const SCRATCH: u32 = 0x0050_0000;

/// Boot `fs` as the machine's first environment.
pub fn boot_fs(machine: &Machine, fs: MemoryFs) -> EnvId {
    let id = machine
        .boot("fs", move |gw| {
            let rt = Runtime::new(gw, RuntimeConfig::default());
            if let Err(e) = fs.serve(&rt) {
                panic!("file server stopped: {e}");
            }
        })
        .unwrap();
    assert_eq!(id, FS_SERVER);
    id
}

/// Run `body` as a top-level environment with a default runtime.
pub fn run<R, F>(machine: &Machine, body: F) -> R
where
    F: FnOnce(&Runtime<EnvGateway>) -> R,
{
    machine
        .run_env("test", |gw| body(&Runtime::new(gw, RuntimeConfig::default())))
        .unwrap()
}

/// Assert the machine ended a scenario in a clean state.
pub fn assert_clean(machine: &Machine) {
    assert!(machine.check_invariants().is_empty(), "{:?}", machine.check_invariants());
    assert!(machine.crashes().is_empty(), "{:?}", machine.crashes());
}

pub fn console_text(machine: &Machine) -> String {
    String::from_utf8_lossy(&machine.console_output()).into_owned()
}
