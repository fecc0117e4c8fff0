//! One-shot reconciliation of a single sighting
//!
//! Usage: rfid-reconcile [--config <path>] <EPC> <LOCATION> <PRODUCT>
//!
//! Exit codes:
//! - 0: reconciled (result printed as JSON on stdout)
//! - 1: wrong arguments
//! - 2: lookup or store failure
//! - 3: EPC already bound to another product

use clap::error::ErrorKind;
use clap::Parser;
use rfid_sync::domain::error::ReconcileError;
use rfid_sync::infra::Config;
use rfid_sync::io::store::{OdooConnection, OdooStore};
use rfid_sync::services::{Reconciler, RetryPolicy};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

const EXIT_USAGE: u8 = 1;
const EXIT_FAILED: u8 = 2;
const EXIT_CONFLICT: u8 = 3;

/// Reconcile one RFID sighting against the Odoo inventory
#[derive(Parser, Debug)]
#[command(name = "rfid-reconcile", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Tag EPC
    epc: String,

    /// Location name as known to the inventory store
    location: String,

    /// Product name as known to the inventory store
    product: String,
}

fn exit_code_for(e: &ReconcileError) -> u8 {
    match e {
        ReconcileError::ProductConflict { .. } => EXIT_CONFLICT,
        ReconcileError::LookupFailed { .. }
        | ReconcileError::Store(_)
        | ReconcileError::PartialApplication { .. } => EXIT_FAILED,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(EXIT_USAGE);
        }
    };

    // Logs go to stderr so stdout carries only the result
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_from_path(&Config::resolve_config_path(args.config.as_deref()));

    let store = match OdooStore::new(OdooConnection::from_config(&config)) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "store_init_failed");
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILED);
        }
    };
    let reconciler = Reconciler::new(Arc::new(store), RetryPolicy::from_config(&config));

    match reconciler.reconcile(&args.epc, &args.location, &args.product).await {
        Ok(result) => {
            match serde_json::to_string(&result) {
                Ok(json) => println!("{json}"),
                Err(_) => println!("{} {}", result.as_str(), result.tag_id()),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfid_sync::domain::error::StoreError;
    use rfid_sync::domain::types::{EntityKind, RecordId};

    #[test]
    fn test_three_positional_arguments() {
        let args = Args::try_parse_from(["rfid-reconcile", "E1", "Dock1", "Widget"]).unwrap();
        assert_eq!(args.epc, "E1");
        assert_eq!(args.location, "Dock1");
        assert_eq!(args.product, "Widget");
        assert!(args.config.is_none());
    }

    #[test]
    fn test_wrong_argument_count_rejected() {
        assert!(Args::try_parse_from(["rfid-reconcile", "E1", "Dock1"]).is_err());
        assert!(Args::try_parse_from(["rfid-reconcile", "E1", "Dock1", "Widget", "x"]).is_err());
    }

    #[test]
    fn test_exit_codes() {
        let conflict = ReconcileError::ProductConflict {
            epc: "E1".to_string(),
            existing: RecordId(1),
            claimed: RecordId(2),
        };
        let lookup =
            ReconcileError::LookupFailed { kind: EntityKind::Location, name: "Dock9".to_string() };
        let store = ReconcileError::Store(StoreError::Unavailable("down".to_string()));
        assert_eq!(exit_code_for(&conflict), EXIT_CONFLICT);
        assert_eq!(exit_code_for(&lookup), EXIT_FAILED);
        assert_eq!(exit_code_for(&store), EXIT_FAILED);
    }
}
