//! Shared types for the RFID sync pipeline

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Newtype wrapper for external store record IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(transparent)]
pub struct RecordId(pub i64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One decoded reader frame: `reader_id,epc,metadata`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadEvent {
    pub reader_id: String,
    pub epc: String,
    pub metadata: String,
}

/// Static per-reader settings, loaded once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderConfig {
    pub reader_id: String,
    pub location: String,
    pub duplicate_window: Duration,
}

/// Named entity kinds the store can resolve by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Product,
    Location,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Product => "product",
            EntityKind::Location => "location",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External record binding an EPC to a product and its last scan context
#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    pub id: RecordId,
    pub epc_code: String,
    pub product_id: RecordId,
    pub last_scan_time: Option<DateTime<Utc>>,
    pub last_scan_location: Option<RecordId>,
}

/// Fields for a tag record that does not exist yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewTag {
    pub epc_code: String,
    pub product_id: RecordId,
    pub location_id: RecordId,
    pub scan_time: DateTime<Utc>,
}

/// Outcome of a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum SyncResult {
    /// First sighting: tag record created, inventory now at `quantity`
    Created { tag_id: RecordId, quantity: f64 },
    /// Known tag: scan time and location refreshed, inventory untouched
    Updated { tag_id: RecordId },
}

impl SyncResult {
    pub fn tag_id(&self) -> RecordId {
        match self {
            SyncResult::Created { tag_id, .. } | SyncResult::Updated { tag_id } => *tag_id,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncResult::Created { .. } => "created",
            SyncResult::Updated { .. } => "updated",
        }
    }
}
