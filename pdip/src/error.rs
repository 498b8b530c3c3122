use thiserror::Error;

/// Errors surfaced by the PDIP public surface (`# 7` of the design).
///
/// Every fallible operation on a [`crate::Pco`] returns one of these
/// variants rather than a bare `io::Error` — callers branch on the kind
/// the way the C API's `errno` discipline let them.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation requires the object to be alive, current state is {state:?}")]
    WrongState { state: crate::pco::State },

    #[error("exec() called on an object that is already alive")]
    BusyOrDuplicate,

    #[error("no such object or no such pid")]
    NotFound,

    #[error("operation timed out")]
    Timeout,

    #[error("regex compilation failed: {0}")]
    CompileError(#[from] regex::Error),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("peer process is gone: {0}")]
    PeerGone(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("underlying PTY error: {0}")]
    Pty(String),
}

pub type Result<T> = std::result::Result<T, Error>;
