use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum XcclError {
    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Precondition not met: {0}")]
    PreconditionNotMet(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unimplemented: {0}")]
    Unimplemented(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Rendezvous store error: {0}")]
    Store(String),

    #[error("Timed out after {0:?} waiting for collective task")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, XcclError>;
