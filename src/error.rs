//! Top-level error type for the server binary and library surface.
//!
//! Every subsystem defines its own error enum (see [`crate::crypto`],
//! [`crate::store`], [`crate::mapreduce`], [`crate::session`]); this module
//! wraps them for the few places — mainly `main.rs` and the session
//! dispatcher — that need to talk about "any error this crate can produce"
//! without caring which subsystem raised it.

use thiserror::Error;

use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::mapreduce::MapReduceError;
use crate::session::SessionError;
use crate::store::StoreError;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum ServerError {
    /// CLI/config parsing or validation failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A map/reduce operation failed.
    #[error("map/reduce error: {0}")]
    MapReduce(#[from] MapReduceError),

    /// The session layer (accept loop or a connection) failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// An I/O error that doesn't belong to a more specific category.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias.
pub type ServerResult<T> = Result<T, ServerError>;
