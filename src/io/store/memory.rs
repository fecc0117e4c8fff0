//! In-memory inventory store
//!
//! Used for dry runs (`store.backend = "memory"`) and tests. Products and
//! locations must be seeded by name; tags and inventory levels are created
//! by the reconciler like they would be in the ERP.

use super::InventoryStore;
use crate::domain::error::StoreError;
use crate::domain::types::{EntityKind, NewTag, RecordId, TagRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct State {
    next_id: i64,
    names: HashMap<(EntityKind, String), RecordId>,
    tags: HashMap<RecordId, TagRecord>,
    levels: HashMap<(RecordId, RecordId), f64>,
}

impl State {
    fn allocate_id(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId(self.next_id)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a product or location name, returning its id (idempotent)
    pub fn add_named(&self, kind: EntityKind, name: &str) -> RecordId {
        let mut state = self.state.lock();
        if let Some(id) = state.names.get(&(kind, name.to_string())) {
            return *id;
        }
        let id = state.allocate_id();
        state.names.insert((kind, name.to_string()), id);
        id
    }

    pub fn with_product(self, name: &str) -> Self {
        self.add_named(EntityKind::Product, name);
        self
    }

    pub fn with_location(self, name: &str) -> Self {
        self.add_named(EntityKind::Location, name);
        self
    }

    /// Snapshot of all tag records for an EPC
    pub fn tags_for_epc(&self, epc: &str) -> Vec<TagRecord> {
        let state = self.state.lock();
        state.tags.values().filter(|t| t.epc_code == epc).cloned().collect()
    }

    pub fn tag_count(&self) -> usize {
        self.state.lock().tags.len()
    }

    pub fn inventory_level(&self, product_id: RecordId, location_id: RecordId) -> Option<f64> {
        self.state.lock().levels.get(&(product_id, location_id)).copied()
    }
}

#[async_trait]
impl InventoryStore for MemoryStore {
    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<RecordId>, StoreError> {
        Ok(self.state.lock().names.get(&(kind, name.to_string())).copied())
    }

    async fn find_tag_by_epc(&self, epc: &str) -> Result<Option<TagRecord>, StoreError> {
        let state = self.state.lock();
        // Lowest id first, matching an ERP search ordered by id
        Ok(state.tags.values().filter(|t| t.epc_code == epc).min_by_key(|t| t.id.0).cloned())
    }

    async fn create_tag(&self, tag: &NewTag) -> Result<RecordId, StoreError> {
        let mut state = self.state.lock();
        let id = state.allocate_id();
        state.tags.insert(
            id,
            TagRecord {
                id,
                epc_code: tag.epc_code.clone(),
                product_id: tag.product_id,
                last_scan_time: Some(tag.scan_time),
                last_scan_location: Some(tag.location_id),
            },
        );
        Ok(id)
    }

    async fn update_tag(
        &self,
        id: RecordId,
        scan_time: DateTime<Utc>,
        location_id: RecordId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let tag = state.tags.get_mut(&id).ok_or_else(|| StoreError::Rpc {
            method: "update_tag".to_string(),
            message: format!("tag {id} does not exist"),
        })?;
        tag.last_scan_time = Some(scan_time);
        tag.last_scan_location = Some(location_id);
        Ok(())
    }

    async fn delete_tag(&self, id: RecordId) -> Result<(), StoreError> {
        self.state.lock().tags.remove(&id);
        Ok(())
    }

    async fn read_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
    ) -> Result<Option<f64>, StoreError> {
        Ok(self.inventory_level(product_id, location_id))
    }

    async fn write_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
        quantity: f64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        match state.levels.get_mut(&(product_id, location_id)) {
            Some(level) => {
                *level = quantity;
                Ok(())
            }
            None => Err(StoreError::Rpc {
                method: "write_inventory_level".to_string(),
                message: format!("no level for product {product_id} at {location_id}"),
            }),
        }
    }

    async fn create_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
        quantity: f64,
    ) -> Result<(), StoreError> {
        self.state.lock().levels.insert((product_id, location_id), quantity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_named_lookup() {
        let store = MemoryStore::new().with_product("Widget").with_location("Dock1");
        let product = store.find_by_name(EntityKind::Product, "Widget").await.unwrap();
        assert!(product.is_some());
        assert_eq!(store.find_by_name(EntityKind::Location, "Widget").await.unwrap(), None);
        assert_eq!(store.add_named(EntityKind::Product, "Widget"), product.unwrap());
    }

    #[tokio::test]
    async fn test_tag_lifecycle() {
        let store = MemoryStore::new();
        let product = store.add_named(EntityKind::Product, "Widget");
        let dock = store.add_named(EntityKind::Location, "Dock1");
        let aisle = store.add_named(EntityKind::Location, "Aisle4");
        let t0 = Utc::now();

        let id = store
            .create_tag(&NewTag {
                epc_code: "E1".to_string(),
                product_id: product,
                location_id: dock,
                scan_time: t0,
            })
            .await
            .unwrap();

        let tag = store.find_tag_by_epc("E1").await.unwrap().unwrap();
        assert_eq!(tag.id, id);
        assert_eq!(tag.last_scan_location, Some(dock));

        store.update_tag(id, t0, aisle).await.unwrap();
        assert_eq!(store.tags_for_epc("E1")[0].last_scan_location, Some(aisle));

        store.delete_tag(id).await.unwrap();
        assert!(store.find_tag_by_epc("E1").await.unwrap().is_none());
        assert!(store.update_tag(id, t0, aisle).await.is_err());
    }

    #[tokio::test]
    async fn test_inventory_levels() {
        let store = MemoryStore::new();
        let p = RecordId(1);
        let l = RecordId(2);
        assert_eq!(store.read_inventory_level(p, l).await.unwrap(), None);
        assert!(store.write_inventory_level(p, l, 2.0).await.is_err());

        store.create_inventory_level(p, l, 1.0).await.unwrap();
        store.write_inventory_level(p, l, 2.0).await.unwrap();
        assert_eq!(store.read_inventory_level(p, l).await.unwrap(), Some(2.0));
    }
}
