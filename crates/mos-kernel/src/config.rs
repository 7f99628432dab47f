//! Machine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use mos_kernel_core::Limits;

/// Resource limits and scheduling knobs of a [`crate::Machine`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Physical pages shared by all environments
    pub max_pages: u32,
    /// Live environments allowed at once
    pub max_envs: u32,
    /// Syscall events kept in the audit log
    pub syslog_capacity: usize,
    /// Longest a `yield` parks the caller, in microseconds
    pub yield_quantum_us: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            max_pages: limits.max_pages,
            max_envs: limits.max_envs,
            syslog_capacity: 10_000,
            yield_quantum_us: 200,
        }
    }
}

impl MachineConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Kernel limits
    pub fn limits(&self) -> Limits {
        Limits {
            max_pages: self.max_pages,
            max_envs: self.max_envs,
        }
    }

    /// Yield quantum as a duration
    pub fn yield_quantum(&self) -> Duration {
        Duration::from_micros(self.yield_quantum_us)
    }
}
