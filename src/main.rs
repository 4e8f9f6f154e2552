//! vaultd - Authenticated key/value service
//!
//! Main entry point: load configuration, load or generate the server's
//! long-term RSA keypair, open the store (replaying its persistence log),
//! and run the accept loop until an authenticated `BYE` requests shutdown.

use std::panic;
use std::sync::Arc;

use vaultd::config::Config;
use vaultd::crypto::RsaKeyPair;
use vaultd::session::run_server;
use vaultd::store::Store;

fn main() -> anyhow::Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        eprintln!("vaultd fatal error:");
        eprintln!("{}", panic_info);

        if let Some(location) = panic_info.location() {
            eprintln!("Location: {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    let config = Config::load()?;

    let log_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("  vaultd - authenticated key/value service");
    log::info!("  Version: {}", vaultd::VERSION);
    log::info!("═══════════════════════════════════════════════════════════");
    log::info!("System Information:");
    log::info!("  Platform: {}", std::env::consts::OS);
    log::info!("  Architecture: {}", std::env::consts::ARCH);

    let keypair = load_or_generate_keypair(&config)?;
    log::info!("server keypair ready ({}-bit RSA)", vaultd::crypto::asymmetric::RSA_KEY_BITS);

    let store = Store::open(
        &config.data_file,
        config.buckets,
        config.quota_upload,
        config.quota_download,
        config.quota_requests,
        config.quota_duration,
        config.mru_capacity,
        config.admin.clone(),
    )?;
    log::info!("store opened at {}", config.data_file.display());

    let result = run_server(&config, Arc::new(store), Arc::new(keypair));

    match &result {
        Ok(_) => {
            log::info!("═══════════════════════════════════════════════════════════");
            log::info!("  vaultd shutdown complete");
            log::info!("═══════════════════════════════════════════════════════════");
        }
        Err(e) => {
            log::error!("server error: {e}");
        }
    }

    Ok(result?)
}

fn load_or_generate_keypair(config: &Config) -> anyhow::Result<RsaKeyPair> {
    if config.keyfile.exists() {
        log::info!("loading server keypair from {}", config.keyfile.display());
        let pem = std::fs::read_to_string(&config.keyfile)?;
        Ok(RsaKeyPair::from_private_pem(&pem)?)
    } else {
        log::info!("no keyfile found at {}; generating a new keypair", config.keyfile.display());
        let keypair = RsaKeyPair::generate()?;
        let pem = keypair.private_key_to_pem()?;
        std::fs::write(&config.keyfile, pem)?;
        Ok(keypair)
    }
}
