use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("malformed binary: {0}")]
    MalformedBinary(String),
    #[error("invalid signature: {0}")]
    SignatureInvalid(String),
    #[error("hash mismatch: {0}")]
    HashMismatch(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("block rejected: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;
