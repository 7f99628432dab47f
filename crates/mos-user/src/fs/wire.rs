//! FS-IPC page framing and request payloads.
//!
//! Every request page and every descriptor page holds one framed record:
//!
//! ```text
//!   0        2        4                         4+len        BY2PG
//!   ┌────────┬────────┬─────────────────────────┬──────────────┐
//!   │version │  len   │   serde_json payload    │   (zeroes)   │
//!   │ u16 LE │ u16 LE │                         │              │
//!   └────────┴────────┴─────────────────────────┴──────────────┘
//! ```
//!
//! The request code travels in the IPC value, not in the page.

use alloc::string::String;
use alloc::vec::Vec;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use mos_ipc::fsreq::FSIPC_WIRE_VERSION;
use mos_ipc::mmu::BY2PG;
use mos_ipc::Errno;

/// Bytes before the payload
pub const HEADER_LEN: usize = 4;

/// Largest payload that fits in one page
pub const MAX_PAYLOAD: usize = BY2PG as usize - HEADER_LEN;

/// `FSREQ_OPEN`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    /// Absolute path
    pub path: String,
    /// Raw open mode
    pub omode: u32,
}

/// `FSREQ_MAP` and `FSREQ_DIRTY`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRequest {
    /// Open file id
    pub fileid: u32,
    /// Byte offset of the block
    pub offset: u32,
}

/// `FSREQ_SET_SIZE`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetSizeRequest {
    /// Open file id
    pub fileid: u32,
    /// New size in bytes
    pub size: u32,
}

/// `FSREQ_CLOSE` and `FSREQ_INCREF`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRequest {
    /// Open file id
    pub fileid: u32,
}

/// `FSREQ_REMOVE`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRequest {
    /// Absolute path
    pub path: String,
}

/// Frame a payload into a page image (header plus payload, unpadded).
///
/// Returns `Inval` if the payload does not fit in one page.
pub fn encode_page<T: Serialize>(payload: &T) -> Result<Vec<u8>, Errno> {
    let body = serde_json::to_vec(payload).map_err(|_| Errno::Inval)?;
    if body.len() > MAX_PAYLOAD {
        return Err(Errno::Inval);
    }
    let mut page = Vec::with_capacity(HEADER_LEN + body.len());
    page.extend_from_slice(&FSIPC_WIRE_VERSION.to_le_bytes());
    page.extend_from_slice(&(body.len() as u16).to_le_bytes());
    page.extend_from_slice(&body);
    Ok(page)
}

/// Decode a framed page. Any framing or payload problem is `Protocol`.
pub fn decode_page<T: DeserializeOwned>(page: &[u8]) -> Result<T, Errno> {
    if page.len() < HEADER_LEN {
        return Err(Errno::Protocol);
    }
    let version = u16::from_le_bytes([page[0], page[1]]);
    let len = u16::from_le_bytes([page[2], page[3]]) as usize;
    if version != FSIPC_WIRE_VERSION || len > MAX_PAYLOAD || HEADER_LEN + len > page.len() {
        return Err(Errno::Protocol);
    }
    serde_json::from_slice(&page[HEADER_LEN..HEADER_LEN + len]).map_err(|_| Errno::Protocol)
}
