//! fleetmond - MySQL fleet collector daemon.
//!
//! Watches the instance directory, keeps one connection pool and three
//! collector tasks per live instance, and persists slow-query records and
//! counter snapshots to the shared document store.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use fleetmon_core::config::Settings;
use fleetmon_core::crypto::{AesGcmCipher, SecretCipher};
use fleetmon_core::db::mysql::MySqlConnector;
use fleetmon_core::fleet::FleetManager;
use fleetmon_core::store::MongoStore;

/// MySQL fleet collector daemon.
#[derive(Parser)]
#[command(name = "fleetmond", about = "MySQL fleet collector daemon", version)]
struct Args {
    /// Document store connection string. Overrides MONGODB_URI.
    #[arg(long)]
    mongo_uri: Option<String>,

    /// Document store database name. Overrides MONGODB_DB_NAME.
    #[arg(long)]
    mongo_db: Option<String>,

    /// Process-list sampling interval in seconds.
    #[arg(long)]
    tick_interval: Option<u64>,

    /// Minimum elapsed seconds for an operation to count as slow.
    #[arg(long)]
    slow_threshold: Option<i64>,

    /// Directory reconciliation interval in seconds.
    #[arg(long)]
    reconcile_interval: Option<u64>,

    /// Disk-status snapshot interval in seconds.
    #[arg(long)]
    disk_status_interval: Option<u64>,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("fleetmond={}", level).parse().unwrap())
        .add_directive(format!("fleetmon_core={}", level).parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Applies command-line overrides on top of environment-derived settings.
fn apply_overrides(settings: &mut Settings, args: &Args) {
    if let Some(uri) = &args.mongo_uri {
        settings.mongo_uri = uri.clone();
    }
    if let Some(db) = &args.mongo_db {
        settings.mongo_db = db.clone();
    }
    if let Some(secs) = args.tick_interval {
        settings.tick_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.slow_threshold {
        settings.slow_threshold_secs = secs;
    }
    if let Some(secs) = args.reconcile_interval {
        settings.reconcile_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = args.disk_status_interval {
        settings.disk_status_interval = Duration::from_secs(secs);
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let mut settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    apply_overrides(&mut settings, &args);

    info!("fleetmond {} starting", fleetmon_core::VERSION);
    info!(
        "Config: tick={}s, threshold={}s, reconcile={}s, disk={}s, daily={:02}:{:02} {}",
        settings.tick_interval.as_secs(),
        settings.slow_threshold_secs,
        settings.reconcile_interval.as_secs(),
        settings.disk_status_interval.as_secs(),
        settings.command_status_hour,
        settings.command_status_minute,
        settings.timezone,
    );

    let cipher: Arc<dyn SecretCipher> = match AesGcmCipher::from_env() {
        Ok(cipher) => Arc::new(cipher),
        Err(e) => {
            error!("secret cipher unavailable: {}", e);
            print_key_warning();
            std::process::exit(1);
        }
    };

    let store = match MongoStore::connect(&settings).await {
        Ok(store) => store,
        Err(e) => {
            error!("document store unavailable: {}", e);
            print_store_warning(&e.to_string());
            std::process::exit(1);
        }
    };

    let connector = MySqlConnector::new(settings.pool_size, settings.query_timeout);
    let mut manager = FleetManager::new(store.clone(), store, connector, cipher, settings);

    // Graceful shutdown on Ctrl-C.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => warn!("failed to listen for shutdown signal: {}", e),
        }
    });

    manager.run(shutdown_rx).await;
    info!("Shutdown complete");
}

/// Prints a colored hint when the secret key is missing or malformed.
fn print_key_warning() {
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}Instance credentials cannot be decrypted without a key.{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Provide a base64-encoded 32-byte key:");
    eprintln!("    export FLEETMON_SECRET_KEY=$(head -c 32 /dev/urandom | base64)");
    eprintln!();
    eprintln!("  The same key must be used when provisioning directory entries.{RESET}");
}

/// Prints a colored document store warning with configuration hints.
fn print_store_warning(error: &str) {
    const RED: &str = "\x1b[1;31m";
    const YELLOW: &str = "\x1b[33m";
    const RESET: &str = "\x1b[0m";

    eprintln!("{RED}Document store: {error}{RESET}");
    eprintln!();
    eprintln!("{YELLOW}  Configure the connection with environment variables:");
    eprintln!("    export MONGODB_URI=mongodb://localhost:27017");
    eprintln!("    export MONGODB_DB_NAME=mgmt_db");
    eprintln!();
    eprintln!("  The collector engine cannot run without its store.{RESET}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_replace_env_settings() {
        let mut settings = Settings::default();
        let args = Args {
            mongo_uri: Some("mongodb://db:27017".to_string()),
            mongo_db: None,
            tick_interval: Some(2),
            slow_threshold: Some(5),
            reconcile_interval: None,
            disk_status_interval: Some(60),
            verbose: 0,
            quiet: false,
        };
        apply_overrides(&mut settings, &args);

        assert_eq!(settings.mongo_uri, "mongodb://db:27017");
        assert_eq!(settings.mongo_db, "mgmt_db");
        assert_eq!(settings.tick_interval, Duration::from_secs(2));
        assert_eq!(settings.slow_threshold_secs, 5);
        assert_eq!(settings.disk_status_interval, Duration::from_secs(60));
    }
}
