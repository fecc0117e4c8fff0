//! External inventory store interface
//!
//! The reconciler talks to the store only through `InventoryStore`. Two
//! implementations exist:
//! - `odoo` - Odoo JSON-RPC (`rfid.tag`, `stock.quant`, ...)
//! - `memory` - in-process maps for dry runs and tests

mod memory;
mod odoo;

pub use memory::MemoryStore;
pub use odoo::{OdooConnection, OdooStore};

use crate::domain::error::StoreError;
use crate::domain::types::{EntityKind, NewTag, RecordId, TagRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait InventoryStore: Send + Sync {
    /// Resolve a product or location by exact name
    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<RecordId>, StoreError>;

    async fn find_tag_by_epc(&self, epc: &str) -> Result<Option<TagRecord>, StoreError>;

    async fn create_tag(&self, tag: &NewTag) -> Result<RecordId, StoreError>;

    async fn update_tag(
        &self,
        id: RecordId,
        scan_time: DateTime<Utc>,
        location_id: RecordId,
    ) -> Result<(), StoreError>;

    /// Remove a tag record (compensation for a half-applied sighting)
    async fn delete_tag(&self, id: RecordId) -> Result<(), StoreError>;

    async fn read_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
    ) -> Result<Option<f64>, StoreError>;

    async fn write_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
        quantity: f64,
    ) -> Result<(), StoreError>;

    async fn create_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
        quantity: f64,
    ) -> Result<(), StoreError>;
}
