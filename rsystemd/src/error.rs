use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid RSYSD_SHELLS affinity spec: {0}")]
    InvalidAffinity(String),

    #[error("shell {0} failed to boot: {1}")]
    ShellBootFailed(usize, #[source] pdip::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] pdip_wire::WireError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
