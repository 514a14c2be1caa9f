//! Error taxonomy for the file system core
//!
//! Every operation on the store and the directory index fails with one of
//! the kinds below. The dispatcher hands the kind to the kernel bridge,
//! which owns the mapping to an OS error code; nothing in the core ever
//! speaks errno.
use std::fmt::{self, Display};

use failure::{Backtrace, Context, Fail};

/// Result alias used throughout the file system core.
///
/// The error defaults to [`FsError`]; mount-time plumbing that fails on
/// host I/O names `failure::Error` explicitly.
pub type Result<T, E = FsError> = std::result::Result<T, E>;

/// A file system error
///
/// Wraps an [`FsErrorKind`] with failure's `Context` so that call sites may
/// attach location information while the kind stays cheap to match on.
#[derive(Debug)]
pub struct FsError {
    inner: Context<FsErrorKind>,
}

impl FsError {
    /// The kind of error that occurred.
    pub fn kind(&self) -> FsErrorKind {
        *self.inner.get_context()
    }
}

impl Fail for FsError {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

/// The kinds of error the core can produce
#[derive(Copy, Clone, Eq, PartialEq, Debug, Fail)]
pub enum FsErrorKind {
    /// The path names neither a file nor a directory.
    #[fail(display = "no such file or directory")]
    NotFound,
    /// A file with this path already exists.
    #[fail(display = "file already exists")]
    Exists,
    /// A file operation was attempted on a directory.
    #[fail(display = "is a directory")]
    IsDirectory,
    /// A directory was expected; found a file, or no parent at all.
    #[fail(display = "not a directory")]
    NotDirectory,
    /// The directory still has entries.
    #[fail(display = "directory not empty")]
    NotEmpty,
    /// An offset, size, or mode argument was out of range.
    #[fail(display = "invalid argument")]
    InvalidArgument,
    /// A sealed block failed tag verification when unsealing.
    #[fail(display = "sealed block failed integrity verification")]
    Integrity,
    /// The sealing key is not available under the current platform policy.
    #[fail(display = "sealing key unavailable under current policy")]
    Policy,
    /// The operation is recognized but deliberately not implemented.
    #[fail(display = "operation not supported")]
    Unsupported,
}

impl From<FsErrorKind> for FsError {
    fn from(kind: FsErrorKind) -> Self {
        FsError {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<FsErrorKind>> for FsError {
    fn from(inner: Context<FsErrorKind>) -> Self {
        FsError { inner }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_survives_context() {
        let err: FsError = FsErrorKind::NotFound.into();
        assert_eq!(err.kind(), FsErrorKind::NotFound);

        let err: FsError = Context::new(FsErrorKind::Integrity).into();
        assert_eq!(err.kind(), FsErrorKind::Integrity, "kind preserved through Context");
    }

    #[test]
    fn display_is_human_readable() {
        let err: FsError = FsErrorKind::NotEmpty.into();
        assert_eq!(format!("{}", err), "directory not empty");
    }
}
