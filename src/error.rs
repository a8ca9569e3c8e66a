use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by the store and the query runtime.
///
/// `Format` is fatal on open (the file is not a store we can read);
/// `Corruption` indicates an invariant violation in a store we did open and
/// is never recovered from.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid store format: {0}")]
    Format(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("store is locked")]
    Locked,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{message} at offset {offset}")]
    Decode { offset: u64, message: &'static str },
}

impl StoreError {
    pub(crate) fn decode(offset: u64, message: &'static str) -> Self {
        StoreError::Decode { offset, message }
    }
}
