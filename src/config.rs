//! Server configuration: CLI flags, defaults, and bounds validation.
//!
//! All of the knobs listed in the wire/storage bounds table are exposed as
//! flags here rather than buried as magic numbers in `store`/`session`, so an
//! operator can tune bucket count, quotas, and MRU capacity without a
//! rebuild.

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

/// Maximum username length, in bytes.
pub const LEN_UNAME: usize = 64;
/// Maximum password length, in bytes.
pub const LEN_PASS: usize = 128;
/// Maximum content/value length, in bytes (1 MiB).
pub const LEN_CONTENT: usize = 1 << 20;
/// Fixed size of the initial handshake block.
pub const LEN_RKBLOCK: usize = 256;
/// Plaintext length of the decrypted r_block.
pub const LEN_RBLOCK_PLAINTEXT: usize = 128;
/// Maximum possible size of an a_block.
pub const MAX_ABLOCK: usize = 1_048_780;

/// Errors raised while building or validating a [`Config`].
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A numeric flag was outside its accepted range.
    #[error("invalid value for --{flag}: {reason}")]
    InvalidValue {
        /// The flag that failed validation.
        flag: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result alias for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Command-line configuration for the vaultd server.
#[derive(Parser, Debug, Clone)]
#[command(name = "vaultd", about = "Authenticated key/value service with hybrid persistence")]
pub struct Config {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 6000)]
    pub port: u16,

    /// Path to the data file used for snapshot + incremental persistence.
    #[arg(long, default_value = "vaultd.dat")]
    pub data_file: PathBuf,

    /// Number of buckets in each sharded map.
    #[arg(long, default_value_t = 16)]
    pub buckets: usize,

    /// Per-user upload quota, in bytes, per `--quota-duration` seconds.
    #[arg(long, default_value_t = 1 << 20)]
    pub quota_upload: u64,

    /// Per-user download quota, in bytes, per `--quota-duration` seconds.
    #[arg(long, default_value_t = 1 << 20)]
    pub quota_download: u64,

    /// Per-user request quota, per `--quota-duration` seconds.
    #[arg(long, default_value_t = 1000)]
    pub quota_requests: u64,

    /// Length of the quota sliding window, in seconds.
    #[arg(long, default_value_t = 60)]
    pub quota_duration: u64,

    /// Capacity of the MRU key listing.
    #[arg(long, default_value_t = 16)]
    pub mru_capacity: usize,

    /// Username granted permission to register map/reduce plugins.
    #[arg(long, default_value = "admin")]
    pub admin: String,

    /// Path to the server's RSA keypair (PEM). Generated on first run if absent.
    #[arg(long, default_value = "vaultd_key.pem")]
    pub keyfile: PathBuf,

    /// Override `RUST_LOG` with an explicit level (added, ambient).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    /// Parse from `std::env::args()` and validate.
    pub fn load() -> ConfigResult<Self> {
        let cfg = Config::parse();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check that numeric flags are within accepted bounds.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.buckets == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "buckets",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.mru_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "mru-capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.quota_duration == 0 {
            return Err(ConfigError::InvalidValue {
                flag: "quota-duration",
                reason: "must be at least 1 second".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let cfg = Config::parse_from(["vaultd"]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_buckets_rejected() {
        let cfg = Config::parse_from(["vaultd", "--buckets", "0"]);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_quota_duration_rejected() {
        let cfg = Config::parse_from(["vaultd", "--quota-duration", "0"]);
        assert!(cfg.validate().is_err());
    }
}
