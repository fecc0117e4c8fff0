//! Services - business logic and state management
//!
//! This module contains the core pipeline services:
//! - `decoder` - Reader frame decoding
//! - `validator` - EPC format check
//! - `registry` - Reader id to location/window resolution
//! - `dedup` - Per-location duplicate suppression
//! - `catalog` - EPC prefix to product mapping
//! - `reconciler` - Create-or-update against the inventory store
//! - `retry` - Timeout and backoff for store calls
//! - `pipeline` - Per-frame composition and the ingestion loop

pub mod catalog;
pub mod decoder;
pub mod dedup;
pub mod pipeline;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod validator;

// Re-export commonly used types
pub use catalog::ProductCatalog;
pub use dedup::DedupCache;
pub use pipeline::{run_ingestion, Disposition, Pipeline};
pub use reconciler::Reconciler;
pub use registry::ReaderRegistry;
pub use retry::{RetryPolicy, WriteError};
