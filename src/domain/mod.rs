//! Domain models - core business types and error taxonomy
//!
//! This module contains the canonical data types used throughout the system:
//! - `ReadEvent` - one decoded reader frame
//! - `ReaderConfig` - location and dedup window of a physical reader
//! - `TagRecord` / `NewTag` - the external store's EPC binding
//! - `SyncResult` - outcome of a reconciliation
//! - `error` - decode, store and reconciliation errors

pub mod error;
pub mod types;

// Re-export commonly used types at module level
pub use error::{DecodeError, ReconcileError, StoreError, TransportError, UnknownReaderError};
pub use types::{EntityKind, NewTag, ReadEvent, ReaderConfig, RecordId, SyncResult, TagRecord};
