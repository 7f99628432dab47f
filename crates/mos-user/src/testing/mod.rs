//! Test support: an in-memory file server speaking FS-IPC.

mod memory_fs;
pub mod path;

pub use memory_fs::{MemoryFs, Reply, CACHE_BASE, MAXOPEN};
