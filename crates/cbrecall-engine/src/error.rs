//! Error types for the recall engine

use thiserror::Error;

/// NFSv4 status: OK (success)
pub const NFS4_OK: u32 = 0;
/// NFSv4 status: no such file or directory
pub const NFS4ERR_NOENT: u32 = 2;
/// NFSv4 status: I/O error
pub const NFS4ERR_IO: u32 = 5;
/// NFSv4 status: invalid argument
pub const NFS4ERR_INVAL: u32 = 22;
/// NFSv4 status: stale file handle
pub const NFS4ERR_STALE: u32 = 70;
/// NFSv4 status: illegal file handle
pub const NFS4ERR_BADHANDLE: u32 = 10001;
/// NFSv4 status: operation not supported
pub const NFS4ERR_NOTSUPP: u32 = 10004;
/// NFSv4 status: server fault
pub const NFS4ERR_SERVERFAULT: u32 = 10006;
/// NFSv4 status: server busy, retry later
pub const NFS4ERR_DELAY: u32 = 10008;
/// NFSv4 status: stateid not recognised
pub const NFS4ERR_BAD_STATEID: u32 = 10025;
/// NFSv4 status: resource exhausted
pub const NFS4ERR_RESOURCE: u32 = 10018;
/// NFSv4.1 status: client holds no layout matching a recall
pub const NFS4ERR_NOMATCHING_LAYOUT: u32 = 10060;

/// Human readable name of an NFSv4 status code, for logging.
pub fn nfs4_status_name(status: u32) -> &'static str {
    match status {
        NFS4_OK => "NFS4_OK",
        NFS4ERR_NOENT => "NFS4ERR_NOENT",
        NFS4ERR_IO => "NFS4ERR_IO",
        NFS4ERR_INVAL => "NFS4ERR_INVAL",
        NFS4ERR_STALE => "NFS4ERR_STALE",
        NFS4ERR_BADHANDLE => "NFS4ERR_BADHANDLE",
        NFS4ERR_NOTSUPP => "NFS4ERR_NOTSUPP",
        NFS4ERR_SERVERFAULT => "NFS4ERR_SERVERFAULT",
        NFS4ERR_DELAY => "NFS4ERR_DELAY",
        NFS4ERR_BAD_STATEID => "NFS4ERR_BAD_STATEID",
        NFS4ERR_RESOURCE => "NFS4ERR_RESOURCE",
        NFS4ERR_NOMATCHING_LAYOUT => "NFS4ERR_NOMATCHING_LAYOUT",
        _ => "NFS4ERR_UNKNOWN",
    }
}

/// Failures surfaced by the recall engine and its collaborators.
///
/// Only the synchronous part of a trigger ever returns one of these to the
/// caller; everything after the first callback is resolved internally.
#[derive(Error, Debug)]
pub enum RecallError {
    /// The file handle did not resolve, or nothing matched the request
    #[error("not found")]
    NotFound,
    /// The object exists but is being torn down
    #[error("stale object")]
    Stale,
    /// Malformed request, e.g. an empty or wrapping segment
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument
        reason: String,
    },
    /// A recall compound could not be built
    #[error("out of memory: {reason}")]
    OutOfMemory {
        /// What could not be allocated or encoded
        reason: String,
    },
    /// Invalid configuration
    #[error("configuration error: {reason}")]
    Config {
        /// The configuration problem
        reason: String,
    },
}

impl RecallError {
    /// Builds an `InvalidArgument` error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        RecallError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Converts the error to an NFSv4 status code.
    pub fn nfs4_status(&self) -> u32 {
        match self {
            RecallError::NotFound => NFS4ERR_NOENT,
            RecallError::Stale => NFS4ERR_STALE,
            RecallError::InvalidArgument { .. } => NFS4ERR_INVAL,
            RecallError::OutOfMemory { .. } => NFS4ERR_RESOURCE,
            RecallError::Config { .. } => NFS4ERR_INVAL,
        }
    }

    /// True for the benign-absence class: the target went away under us.
    pub fn is_absent(&self) -> bool {
        matches!(self, RecallError::NotFound | RecallError::Stale)
    }
}

/// Result type alias using RecallError as the error type.
pub type Result<T> = std::result::Result<T, RecallError>;
