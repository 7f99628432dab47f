//! Runtime configuration

use serde::{Deserialize, Serialize};

use mos_ipc::envs::FS_SERVER;
use mos_ipc::EnvId;

/// Per-environment knobs of the user runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Environment the FS-IPC client talks to
    pub fs_server: EnvId,
    /// Attempts `ipc_send` makes while the target is not receiving
    pub ipc_send_retries: u32,
    /// Attempts the COW handler makes to allocate its copy page
    pub pgfault_alloc_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            fs_server: FS_SERVER,
            ipc_send_retries: 100_000,
            pgfault_alloc_retries: 16,
        }
    }
}

impl RuntimeConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.fs_server, 0x400);
        assert!(cfg.ipc_send_retries > 0);
        assert!(cfg.pgfault_alloc_retries > 0);
    }

    #[test]
    fn test_from_json_partial() {
        let cfg = RuntimeConfig::from_json(r#"{"fs_server": 1025}"#).unwrap();
        assert_eq!(cfg.fs_server, 0x401);
        assert_eq!(cfg.ipc_send_retries, RuntimeConfig::default().ipc_send_retries);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(RuntimeConfig::from_json("42").is_err());
        assert!(RuntimeConfig::from_json(r#"{"fs_server": "x"}"#).is_err());
    }
}
