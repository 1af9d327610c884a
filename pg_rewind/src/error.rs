//! The error taxonomy from §7: every category is terminal, and each maps to
//! one of the two non-zero process exit codes from §6.

use camino::Utf8PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RewindError {
    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Sanity(String),

    #[error("reading {1}: {0}")]
    IoSource(#[source] std::io::Error, Utf8PathBuf),

    #[error("writing {1}: {0}")]
    IoTarget(#[source] std::io::Error, Utf8PathBuf),

    #[error("unexpected response from source: {0}")]
    Protocol(String),

    #[error("{0}")]
    Decode(String),
}

impl RewindError {
    /// Process exit code per §6: 0 success, 1 usage/sanity/runtime, 2 file I/O.
    pub fn exit_code(&self) -> i32 {
        match self {
            RewindError::IoSource(..) | RewindError::IoTarget(..) => 2,
            _ => 1,
        }
    }
}

impl From<postgres_ffi::ControlFileError> for RewindError {
    fn from(e: postgres_ffi::ControlFileError) -> RewindError {
        RewindError::Decode(e.to_string())
    }
}

impl From<postgres_ffi::BadHistoryLine> for RewindError {
    fn from(e: postgres_ffi::BadHistoryLine) -> RewindError {
        RewindError::Decode(e.to_string())
    }
}

impl From<postgres_ffi::WalDecodeError> for RewindError {
    fn from(e: postgres_ffi::WalDecodeError) -> RewindError {
        RewindError::Decode(e.to_string())
    }
}

impl From<postgres::Error> for RewindError {
    fn from(e: postgres::Error) -> RewindError {
        RewindError::Protocol(e.to_string())
    }
}
