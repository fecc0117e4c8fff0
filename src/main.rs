//! rfid-sync - RFID tag-read ingestion and inventory reconciliation daemon
//!
//! Reads `reader_id,epc,metadata` frames from serial readers, drops
//! duplicates per location and keeps the ERP's tag records and stock
//! levels in line with genuinely new sightings.
//!
//! Module structure:
//! - `domain/` - Core types (ReadEvent, TagRecord, SyncResult) and errors
//! - `io/` - External interfaces (serial, inventory stores, Prometheus)
//! - `services/` - Pipeline (decoder, registry, dedup, reconciler)
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use rfid_sync::domain::types::EntityKind;
use rfid_sync::infra::{Config, Metrics, StoreBackend};
use rfid_sync::io::store::{InventoryStore, MemoryStore, OdooConnection, OdooStore};
use rfid_sync::io::SerialSource;
use rfid_sync::services::{
    dedup, DedupCache, Pipeline, ProductCatalog, Reconciler, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// RFID ingestion and inventory reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "rfid-sync", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-frame visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Seed the in-memory store with every configured product and location
fn seeded_memory_store(config: &Config) -> MemoryStore {
    let store = MemoryStore::new();
    for name in ProductCatalog::new(config.products()).product_names() {
        store.add_named(EntityKind::Product, name);
    }
    for location in config.locations() {
        store.add_named(EntityKind::Location, location);
    }
    store
}

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn InventoryStore>> {
    let store: Arc<dyn InventoryStore> = match config.store_backend() {
        StoreBackend::Odoo => Arc::new(
            OdooStore::new(OdooConnection::from_config(config))
                .context("Failed to create Odoo client")?,
        ),
        StoreBackend::Memory => Arc::new(seeded_memory_store(config)),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!(git_hash = %env!("GIT_HASH"), "rfid-sync starting");

    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = Config::load_from_path(&config_path);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        transports = %config.transports().len(),
        readers = %config.readers().len(),
        products = %config.products().len(),
        store = %config.store_backend().as_str(),
        read_interval_ms = %config.read_interval().as_millis(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );
    for reader in config.readers() {
        info!(
            reader_id = %reader.reader_id,
            location = %reader.location,
            window_secs = %reader.duplicate_window.as_secs(),
            "reader_configured"
        );
    }
    if config.products().is_empty() {
        warn!("no_product_mappings_configured");
    }

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create shared components
    let metrics = Arc::new(Metrics::new());
    let dedup_cache = Arc::new(DedupCache::new());
    let store = build_store(&config)?;
    let reconciler =
        Reconciler::new(store, RetryPolicy::from_config(&config)).with_metrics(metrics.clone());
    let pipeline = Arc::new(
        Pipeline::from_config(&config, dedup_cache.clone(), metrics.clone())
            .with_reconciler(reconciler),
    );

    // Start dedup eviction sweep
    tokio::spawn(dedup::run_eviction(
        dedup_cache,
        Duration::from_secs(config.dedup_sweep_interval_secs()),
        config.dedup_eviction_factor(),
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = rfid_sync::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = Duration::from_secs(config.metrics_interval_secs().max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(metrics_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // One ingestion loop per transport
    let mut ingest_tasks = Vec::with_capacity(config.transports().len());
    for transport in config.transports() {
        let source = SerialSource::new(transport, config.read_interval());
        let pipeline = pipeline.clone();
        let shutdown = shutdown_rx.clone();
        ingest_tasks.push(tokio::spawn(async move {
            let name = source.name().to_string();
            if let Err(e) = source.run(pipeline, shutdown).await {
                error!(source = %name, error = %e, "ingestion_aborted");
            }
        }));
    }

    if ingest_tasks.is_empty() {
        warn!("no_transports_configured");
    }

    for task in ingest_tasks {
        if let Err(e) = task.await {
            error!(error = %e, "ingestion_task_panicked");
        }
    }

    metrics.report().log();
    info!("rfid-sync shutdown complete");
    Ok(())
}
