//! Runtime error type and the fatal-error macros.
//!
//! Library calls fail with [`Error::Errno`], carrying the kernel's or the file
//! server's code unchanged. [`Error::Fatal`] is the panic path: it unwinds the
//! program back to `libmain`, which cleans up and terminates the environment.

use alloc::string::String;

use mos_ipc::Errno;

/// Errors returned by the user runtime.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A recoverable error code
    #[error(transparent)]
    Errno(#[from] Errno),

    /// A programmer error. Never recovered from: the environment is torn down.
    #[error("panic at {file}:{line}: {msg}")]
    Fatal {
        /// What went wrong
        msg: String,
        /// Source file of the call site
        file: &'static str,
        /// Line of the call site
        line: u32,
    },
}

impl Error {
    /// Build a fatal error for a call site.
    pub fn fatal(msg: String, file: &'static str, line: u32) -> Self {
        Error::Fatal { msg, file, line }
    }

    /// The error code, if this is not a fatal error.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Error::Errno(e) => Some(*e),
            Error::Fatal { .. } => None,
        }
    }

    /// Whether this error must end the environment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal { .. })
    }

    /// Negative wire code. Fatal errors report `Unspecified`.
    pub fn code(&self) -> i32 {
        self.errno().unwrap_or(Errno::Unspecified).code()
    }
}

/// Result type for user runtime operations.
pub type Result<T> = core::result::Result<T, Error>;

#[doc(hidden)]
pub mod __private {
    pub use alloc::format;
}

/// Return early with a fatal error located at the call site.
///
/// ```ignore
/// if perm.is_none() {
///     user_panic!("no mapping at {:08x}", va);
/// }
/// ```
#[macro_export]
macro_rules! user_panic {
    ($($arg:tt)*) => {
        return ::core::result::Result::Err($crate::Error::fatal(
            $crate::error::__private::format!($($arg)*),
            ::core::file!(),
            ::core::line!(),
        ).into())
    };
}

/// Return early with a fatal error if the condition does not hold.
#[macro_export]
macro_rules! user_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::user_panic!("assertion failed: {}", ::core::stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::user_panic!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn checked(n: u32) -> Result<u32> {
        user_assert!(n < 10);
        if n == 7 {
            user_panic!("unlucky {}", n);
        }
        Ok(n)
    }

    #[test]
    fn test_errno_passes_through() {
        let err: Error = Errno::BadFd.into();
        assert_eq!(err.errno(), Some(Errno::BadFd));
        assert_eq!(err.code(), -13);
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "bad file descriptor");
    }

    #[test]
    fn test_user_assert_reports_condition() {
        match checked(12) {
            Err(Error::Fatal { msg, file, .. }) => {
                assert_eq!(msg, "assertion failed: n < 10");
                assert!(file.ends_with("error.rs"));
            }
            other => panic!("expected fatal error, got {:?}", other),
        }
    }

    #[test]
    fn test_user_panic_formats_location() {
        let err = checked(7).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code(), Errno::Unspecified.code());
        let text = err.to_string();
        assert!(text.starts_with("panic at "));
        assert!(text.ends_with(": unlucky 7"));
        assert_eq!(checked(3), Ok(3));
    }
}
