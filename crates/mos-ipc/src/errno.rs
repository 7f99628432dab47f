//! Error codes shared by the kernel, the file server and the user runtime.
//!
//! On the wire every error is the negated discriminant: `BadEnv` travels as
//! `-2`. Success is `0`.

/// Error codes (negated on the wire).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[repr(i32)]
pub enum Errno {
    /// Unspecified or unknown problem
    #[error("unspecified error")]
    Unspecified = 1,
    /// Environment doesn't exist or otherwise cannot be used
    #[error("bad environment")]
    BadEnv = 2,
    /// Invalid parameter
    #[error("invalid parameter")]
    Inval = 3,
    /// Request failed due to memory shortage
    #[error("out of memory")]
    NoMem = 4,
    /// Attempt to create a new environment beyond the maximum allowed
    #[error("out of environments")]
    NoFreeEnv = 5,
    /// Attempt to send to an environment that is not receiving
    #[error("env is not recving")]
    IpcNotRecv = 6,
    /// No free space left on disk
    #[error("no free space on disk")]
    NoDisk = 7,
    /// Too many files are open
    #[error("too many files are open")]
    MaxOpen = 8,
    /// File or block not found
    #[error("file or block not found")]
    NotFound = 9,
    /// Bad path
    #[error("invalid path")]
    BadPath = 10,
    /// File already exists
    #[error("file already exists")]
    FileExists = 11,
    /// File not a valid executable
    #[error("file is not a valid executable")]
    NotExec = 12,
    /// Descriptor is out of range or not open
    #[error("bad file descriptor")]
    BadFd = 13,
    /// Descriptor's open mode forbids the operation
    #[error("operation not permitted by open mode")]
    BadMode = 14,
    /// The file server sent a malformed or unexpected reply
    #[error("file server protocol violation")]
    Protocol = 15,
}

impl Errno {
    const ALL: [Errno; 15] = [
        Errno::Unspecified,
        Errno::BadEnv,
        Errno::Inval,
        Errno::NoMem,
        Errno::NoFreeEnv,
        Errno::IpcNotRecv,
        Errno::NoDisk,
        Errno::MaxOpen,
        Errno::NotFound,
        Errno::BadPath,
        Errno::FileExists,
        Errno::NotExec,
        Errno::BadFd,
        Errno::BadMode,
        Errno::Protocol,
    ];

    /// Negative wire code.
    pub fn code(self) -> i32 {
        -(self as i32)
    }

    /// Decode a negative wire code. Returns `None` for `0`, positive values
    /// and unknown codes.
    pub fn from_code(code: i32) -> Option<Self> {
        if code >= 0 {
            return None;
        }
        Self::ALL.iter().copied().find(|e| e.code() == code)
    }

    /// Encode into an IPC value field.
    pub fn to_value(self) -> u32 {
        self.code() as u32
    }

    /// Decode an IPC value field: `Ok(0)`, `Ok(positive)` or a known error.
    /// Unknown negative codes decode as `Unspecified`.
    pub fn from_value(value: u32) -> Result<u32, Errno> {
        let code = value as i32;
        if code >= 0 {
            Ok(value)
        } else {
            Err(Self::from_code(code).unwrap_or(Errno::Unspecified))
        }
    }
}
