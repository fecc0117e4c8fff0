//! Error taxonomy for the ingestion and reconciliation pipeline
//!
//! Per-frame errors (`DecodeError`, `UnknownReaderError`) are local and never
//! stop an ingestion loop. `ReconcileError` is returned to the caller of a
//! single reconciliation. `StoreError` covers the external store itself and
//! knows which failures are worth retrying.

use crate::domain::types::{EntityKind, RecordId};
use std::time::Duration;
use thiserror::Error;

/// A raw frame that could not be turned into a `ReadEvent`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8 text")]
    NotText,
    #[error("expected 3 comma-separated fields, found {found}")]
    FieldCount { found: usize },
}

/// Reader id with no entry in the reader configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown reader id: {0}")]
pub struct UnknownReaderError(pub String);

/// Failure talking to the external inventory store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("store authentication failed for user {0}")]
    AuthenticationFailed(String),

    #[error("store rejected call {method}: {message}")]
    Rpc { method: String, message: String },

    #[error("invalid store response: {0}")]
    InvalidResponse(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient failures that a later attempt may not hit
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Timeout(_) | StoreError::Unavailable(_) => true,
            StoreError::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            StoreError::AuthenticationFailed(_)
            | StoreError::Rpc { .. }
            | StoreError::InvalidResponse(_) => false,
        }
    }

    /// Whether a failed write may still have been committed by the store.
    /// Only a refused connection or an RPC fault rules that out.
    pub fn may_have_applied(&self) -> bool {
        match self {
            StoreError::Timeout(_)
            | StoreError::Unavailable(_)
            | StoreError::InvalidResponse(_) => true,
            StoreError::Transport(e) => !(e.is_connect() || e.is_builder()),
            StoreError::AuthenticationFailed(_) | StoreError::Rpc { .. } => false,
        }
    }
}

/// Failure of a single reconciliation attempt
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no {kind} named {name:?} in the inventory store")]
    LookupFailed { kind: EntityKind, name: String },

    #[error("EPC {epc} is bound to product {existing} but was claimed by product {claimed}")]
    ProductConflict { epc: String, existing: RecordId, claimed: RecordId },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("tag {tag_id} for EPC {epc} was created but inventory was not adjusted: {source}")]
    PartialApplication {
        epc: String,
        tag_id: RecordId,
        #[source]
        source: StoreError,
    },
}

impl ReconcileError {
    /// Short label for logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::LookupFailed { .. } => "lookup_failed",
            ReconcileError::ProductConflict { .. } => "product_conflict",
            ReconcileError::Store(_) => "store_error",
            ReconcileError::PartialApplication { .. } => "partial_application",
        }
    }
}

/// Failure of a frame source; ends that transport's ingestion loop
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("read from {source_name} failed: {source}")]
    Read {
        source_name: String,
        #[source]
        source: std::io::Error,
    },
}
