//! Error types for brig-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrigError {
    #[error("namespace error: {0}")]
    Namespace(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("identity error: {0}")]
    Identity(String),

    #[error("privilege error: {0}")]
    Privilege(String),

    #[error("process error: {0}")]
    Process(String),

    #[error("resource limit error: {0}")]
    Limits(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
