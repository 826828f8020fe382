//! Error types for snipbox-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnipboxError {
    #[error("invalid user id: {0:?}")]
    InvalidUser(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Why an artifact could not be served.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("artifact not found")]
    NotFound,

    #[error("access denied")]
    Forbidden,

    #[error("artifact storage error: {0}")]
    Storage(#[from] std::io::Error),
}
