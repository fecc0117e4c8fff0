//! Per-frame ingestion pipeline
//!
//! decode -> resolve reader -> validate EPC -> dedup -> product -> reconcile
//!
//! The reader is resolved before validation so a frame from unknown
//! hardware never touches the validator or the dedup table. Every frame
//! ends in exactly one `Disposition`; none of them stops the loop.

use crate::domain::error::{ReconcileError, TransportError};
use crate::domain::types::SyncResult;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::services::catalog::ProductCatalog;
use crate::services::decoder::decode_frame;
use crate::services::dedup::DedupCache;
use crate::services::reconciler::Reconciler;
use crate::services::registry::ReaderRegistry;
use crate::services::validator::validate_epc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of one frame
#[derive(Debug)]
pub enum Disposition {
    Malformed,
    UnknownReader,
    InvalidEpc,
    Duplicate,
    /// Accepted, but no product is mapped to the EPC
    Unmapped,
    /// Accepted with no store configured
    Accepted,
    Synced(SyncResult),
    Failed(ReconcileError),
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Malformed => "malformed",
            Disposition::UnknownReader => "unknown_reader",
            Disposition::InvalidEpc => "invalid_epc",
            Disposition::Duplicate => "duplicate",
            Disposition::Unmapped => "unmapped",
            Disposition::Accepted => "accepted",
            Disposition::Synced(_) => "synced",
            Disposition::Failed(_) => "failed",
        }
    }
}

pub struct Pipeline {
    registry: ReaderRegistry,
    dedup: Arc<DedupCache>,
    catalog: ProductCatalog,
    reconciler: Option<Reconciler>,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(
        registry: ReaderRegistry,
        dedup: Arc<DedupCache>,
        catalog: ProductCatalog,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { registry, dedup, catalog, reconciler: None, metrics }
    }

    /// Pipeline over the reader table and product catalog in `config`
    pub fn from_config(config: &Config, dedup: Arc<DedupCache>, metrics: Arc<Metrics>) -> Self {
        Self::new(
            ReaderRegistry::new(config.readers()),
            dedup,
            ProductCatalog::new(config.products()),
            metrics,
        )
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = Some(reconciler);
        self
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    pub async fn process_line(&self, raw: &[u8]) -> Disposition {
        self.process_line_at(raw, Instant::now()).await
    }

    /// Process one frame with `now` as the dedup clock
    pub async fn process_line_at(&self, raw: &[u8], now: Instant) -> Disposition {
        let start = Instant::now();
        let disposition = self.dispatch(raw, now).await;
        self.metrics.record_frame_processed(start.elapsed().as_micros() as u64);
        disposition
    }

    async fn dispatch(&self, raw: &[u8], now: Instant) -> Disposition {
        let event = match decode_frame(raw) {
            Ok(event) => event,
            Err(e) => {
                let raw = String::from_utf8_lossy(raw);
                warn!(error = %e, raw = %raw.trim_end(), "frame_malformed");
                self.metrics.record_malformed();
                return Disposition::Malformed;
            }
        };

        let reader = match self.registry.resolve(&event.reader_id) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(reader_id = %e.0, epc = %event.epc, "reader_unknown");
                self.metrics.record_unknown_reader();
                return Disposition::UnknownReader;
            }
        };

        if !validate_epc(&event.epc) {
            warn!(
                reader_id = %event.reader_id,
                epc = %event.epc,
                len = %event.epc.chars().count(),
                "epc_invalid"
            );
            self.metrics.record_invalid_epc();
            return Disposition::InvalidEpc;
        }

        let window = reader.duplicate_window;
        if !self.dedup.check_and_record_at(&event.epc, &reader.location, window, now) {
            debug!(epc = %event.epc, location = %reader.location, "epc_duplicate_suppressed");
            self.metrics.record_duplicate();
            return Disposition::Duplicate;
        }
        self.metrics.record_accepted();

        let Some(product) = self.catalog.product_for(&event.epc) else {
            warn!(epc = %event.epc, location = %reader.location, "epc_unmapped");
            self.metrics.record_unmapped();
            return Disposition::Unmapped;
        };

        let Some(reconciler) = &self.reconciler else {
            info!(
                epc = %event.epc,
                location = %reader.location,
                product = %product,
                metadata = %event.metadata,
                "sighting_accepted"
            );
            return Disposition::Accepted;
        };

        match reconciler.reconcile(&event.epc, &reader.location, product).await {
            Ok(result) => Disposition::Synced(result),
            Err(e) => {
                error!(
                    epc = %event.epc,
                    location = %reader.location,
                    product = %product,
                    kind = %e.kind(),
                    error = %e,
                    "reconcile_failed"
                );
                Disposition::Failed(e)
            }
        }
    }
}

/// Feed newline-terminated frames from `reader` through `pipeline` in order
///
/// Each frame is fully processed before the next is read. A read that
/// produces nothing within `read_interval` just polls again. Returns on
/// EOF or shutdown; a source I/O error ends the loop with an error.
pub async fn run_ingestion<R>(
    source_name: &str,
    mut reader: R,
    pipeline: Arc<Pipeline>,
    read_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError>
where
    R: AsyncBufRead + Unpin,
{
    info!(
        source = %source_name,
        read_interval_ms = %read_interval.as_millis(),
        "ingestion_started"
    );

    let mut buf: Vec<u8> = Vec::with_capacity(128);
    let mut frames: u64 = 0;

    loop {
        if *shutdown.borrow() {
            info!(source = %source_name, frames = %frames, "ingestion_shutdown");
            return Ok(());
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(source = %source_name, frames = %frames, "ingestion_shutdown");
                    return Ok(());
                }
            }
            read = tokio::time::timeout(read_interval, reader.read_until(b'\n', &mut buf)) => {
                match read {
                    // Nothing complete yet; partial bytes stay in buf
                    Err(_) => continue,
                    Ok(Ok(0)) => {
                        if !buf.is_empty() {
                            pipeline.process_line(&buf).await;
                            frames += 1;
                        }
                        info!(source = %source_name, frames = %frames, "ingestion_eof");
                        return Ok(());
                    }
                    Ok(Ok(_)) => {
                        pipeline.process_line(&buf).await;
                        frames += 1;
                        buf.clear();
                    }
                    Ok(Err(e)) => {
                        error!(source = %source_name, error = %e, "ingestion_read_failed");
                        return Err(TransportError::Read {
                            source_name: source_name.to_string(),
                            source: e,
                        });
                    }
                }
            }
        }
    }
}
