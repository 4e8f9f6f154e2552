//! # vaultd
//!
//! An authenticated key/value service with hybrid snapshot-plus-log
//! persistence, per-session RSA/AES handshakes, sliding-window resource
//! quotas, and sandboxed user-supplied map/reduce plugins.
//!
//! ## Architecture
//!
//! - `config`: CLI flags, defaults, and bounds validation
//! - `crypto`: RSA handshake wrapping, AES-256-GCM sealing, Argon2id/HKDF
//! - `store`: the sharded auth/KV maps, quotas, MRU listing, and persistence
//! - `mapreduce`: plugin loading and fork/pipe sandboxed execution
//! - `session`: wire framing and per-connection command dispatch
//! - `error`: the crate-wide error type tying every subsystem together

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod mapreduce;
pub mod session;
pub mod store;

pub use error::{ServerError, ServerResult};

/// Crate version, as declared in `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name, as declared in `Cargo.toml`.
pub const NAME: &str = env!("CARGO_PKG_NAME");
