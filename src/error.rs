use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SiltError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt data: {0}")]
    Corruption(String),

    #[error("invalid state: {0}")]
    State(String),

    #[error("key {0:?} is not strictly greater than the previous key")]
    KeyOrder(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("replication error: {0}")]
    Replication(String),
}

pub type Result<T> = std::result::Result<T, SiltError>;
