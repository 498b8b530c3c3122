use thiserror::Error;

#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("background shell error: {0}")]
    Pdip(#[from] pdip::Error),

    #[error("dispatcher is busy, no free shell")]
    Busy,

    #[error("dispatcher is out of resources")]
    Oom,

    #[error("dispatcher connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] pdip_wire::WireError),

    #[error("dispatcher closed the connection before sending EOC")]
    UnexpectedClose,
}

pub type Result<T> = std::result::Result<T, FacadeError>;
