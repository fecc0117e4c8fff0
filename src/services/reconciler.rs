//! Create-or-update reconciliation of a tag sighting against the inventory store
//!
//! Tag lifecycle per EPC:
//! - Unknown -> Known(product): tag record created, inventory +1
//! - Known(product) -> Known(product): scan time and location refreshed
//! - Known(A) claimed by B: conflict, nothing written
//!
//! Creating the tag and adjusting inventory are two store calls. If the
//! adjustment is known not to have landed the new tag is deleted again, so
//! the next sighting of the EPC starts from Unknown and increments exactly
//! once. A write that times out is read back before it is ever resent.

use crate::domain::error::{ReconcileError, StoreError};
use crate::domain::types::{EntityKind, NewTag, RecordId, SyncResult};
use crate::infra::metrics::Metrics;
use crate::io::store::InventoryStore;
use crate::services::retry::{RetryPolicy, WriteError};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct Reconciler {
    store: Arc<dyn InventoryStore>,
    retry: RetryPolicy,
    metrics: Option<Arc<Metrics>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn InventoryStore>, retry: RetryPolicy) -> Self {
        Self { store, retry, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Reconcile one accepted sighting, stamped with the current time
    pub async fn reconcile(
        &self,
        epc: &str,
        location: &str,
        product: &str,
    ) -> Result<SyncResult, ReconcileError> {
        self.reconcile_at(epc, location, product, Utc::now()).await
    }

    pub async fn reconcile_at(
        &self,
        epc: &str,
        location: &str,
        product: &str,
        scan_time: DateTime<Utc>,
    ) -> Result<SyncResult, ReconcileError> {
        let start = Instant::now();
        let result = self.apply(epc, location, product, scan_time).await;

        if let Some(m) = &self.metrics {
            m.record_reconcile_latency(start.elapsed().as_millis() as u64);
            match &result {
                Ok(SyncResult::Created { .. }) => m.record_tag_created(),
                Ok(SyncResult::Updated { .. }) => m.record_tag_updated(),
                Err(ReconcileError::LookupFailed { .. }) => m.record_lookup_failure(),
                Err(ReconcileError::ProductConflict { .. }) => m.record_conflict(),
                Err(ReconcileError::Store(_)) => m.record_store_error(),
                Err(ReconcileError::PartialApplication { .. }) => m.record_partial_application(),
            }
        }

        result
    }

    async fn apply(
        &self,
        epc: &str,
        location: &str,
        product: &str,
        scan_time: DateTime<Utc>,
    ) -> Result<SyncResult, ReconcileError> {
        let product_id = self.lookup(EntityKind::Product, product).await?;
        let location_id = self.lookup(EntityKind::Location, location).await?;

        let existing = self
            .retry
            .call("find_tag_by_epc", self.metrics(), || self.store.find_tag_by_epc(epc))
            .await?;

        if let Some(tag) = existing {
            if tag.product_id != product_id {
                return Err(ReconcileError::ProductConflict {
                    epc: epc.to_string(),
                    existing: tag.product_id,
                    claimed: product_id,
                });
            }

            self.retry
                .call("update_tag", self.metrics(), || {
                    self.store.update_tag(tag.id, scan_time, location_id)
                })
                .await?;

            debug!(epc = %epc, tag_id = %tag.id, location = %location, "tag_updated");
            return Ok(SyncResult::Updated { tag_id: tag.id });
        }

        let new_tag = NewTag {
            epc_code: epc.to_string(),
            product_id,
            location_id,
            scan_time,
        };
        let created = self
            .retry
            .call_verified(
                "create_tag",
                self.metrics(),
                || self.store.create_tag(&new_tag),
                || self.tag_id_for(epc),
            )
            .await;
        let tag_id = match created {
            Ok(tag_id) => tag_id,
            Err(WriteError::NotApplied(e)) => return Err(e.into()),
            Err(WriteError::Indeterminate(e)) => {
                warn!(epc = %epc, error = %e, "tag_creation_indeterminate");
                return Err(e.into());
            }
        };

        match self.increment_inventory(product_id, location_id).await {
            Ok(quantity) => {
                info!(
                    epc = %epc,
                    tag_id = %tag_id,
                    product = %product,
                    location = %location,
                    quantity = %quantity,
                    "tag_created"
                );
                Ok(SyncResult::Created { tag_id, quantity })
            }
            Err(WriteError::NotApplied(e)) => Err(self.compensate(epc, tag_id, e).await),
            Err(WriteError::Indeterminate(e)) => {
                // The +1 may have landed; keep the tag
                error!(
                    epc = %epc,
                    tag_id = %tag_id,
                    error = %e,
                    "inventory_adjustment_indeterminate"
                );
                Err(ReconcileError::PartialApplication { epc: epc.to_string(), tag_id, source: e })
            }
        }
    }

    async fn lookup(&self, kind: EntityKind, name: &str) -> Result<RecordId, ReconcileError> {
        self.retry
            .call("find_by_name", self.metrics(), || self.store.find_by_name(kind, name))
            .await?
            .ok_or_else(|| ReconcileError::LookupFailed { kind, name: name.to_string() })
    }

    async fn tag_id_for(&self, epc: &str) -> Result<Option<RecordId>, StoreError> {
        Ok(self.store.find_tag_by_epc(epc).await?.map(|tag| tag.id))
    }

    /// Add one unit at (product, location); returns the new quantity
    async fn increment_inventory(
        &self,
        product_id: RecordId,
        location_id: RecordId,
    ) -> Result<f64, WriteError> {
        let current = self
            .retry
            .call("read_inventory_level", self.metrics(), || {
                self.store.read_inventory_level(product_id, location_id)
            })
            .await
            .map_err(WriteError::NotApplied)?;

        let (op_name, quantity) = match current {
            Some(quantity) => ("write_inventory_level", quantity + 1.0),
            None => ("create_inventory_level", 1.0),
        };
        self.retry
            .call_verified(
                op_name,
                self.metrics(),
                || self.write_level(product_id, location_id, current.is_some(), quantity),
                || self.level_reached(product_id, location_id, quantity),
            )
            .await?;
        Ok(quantity)
    }

    async fn write_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
        exists: bool,
        quantity: f64,
    ) -> Result<(), StoreError> {
        if exists {
            self.store.write_inventory_level(product_id, location_id, quantity).await
        } else {
            self.store.create_inventory_level(product_id, location_id, quantity).await
        }
    }

    async fn level_reached(
        &self,
        product_id: RecordId,
        location_id: RecordId,
        quantity: f64,
    ) -> Result<Option<()>, StoreError> {
        let level = self.store.read_inventory_level(product_id, location_id).await?;
        Ok((level == Some(quantity)).then_some(()))
    }

    /// Undo a tag created for a sighting whose inventory change was not applied
    async fn compensate(&self, epc: &str, tag_id: RecordId, cause: StoreError) -> ReconcileError {
        let deleted = self
            .retry
            .call_verified(
                "delete_tag",
                self.metrics(),
                || self.store.delete_tag(tag_id),
                || self.tag_gone(epc),
            )
            .await;

        match deleted {
            Ok(()) => {
                warn!(epc = %epc, tag_id = %tag_id, error = %cause, "tag_creation_rolled_back");
                if let Some(m) = &self.metrics {
                    m.record_compensation();
                }
                ReconcileError::Store(cause)
            }
            Err(delete_error) => {
                error!(
                    epc = %epc,
                    tag_id = %tag_id,
                    error = %cause,
                    delete_error = %delete_error.into_inner(),
                    "tag_created_inventory_not_adjusted"
                );
                ReconcileError::PartialApplication { epc: epc.to_string(), tag_id, source: cause }
            }
        }
    }

    async fn tag_gone(&self, epc: &str) -> Result<Option<()>, StoreError> {
        Ok(self.store.find_tag_by_epc(epc).await?.is_none().then_some(()))
    }

    fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TagRecord;
    use crate::io::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    const EPC_A: &str = "AAAAAAAAAAAAAAAAAAAAAAAA";

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff_coefficient: 2,
            initial_interval: Duration::from_millis(1),
            maximum_interval: Some(Duration::from_millis(4)),
            call_timeout: Duration::from_secs(1),
        }
    }

    fn seeded() -> Arc<MemoryStore> {
        Arc::new(
            MemoryStore::new()
                .with_product("Widget")
                .with_product("Gadget")
                .with_location("Dock1")
                .with_location("Aisle4"),
        )
    }

    async fn id_of(store: &MemoryStore, kind: EntityKind, name: &str) -> RecordId {
        store.find_by_name(kind, name).await.unwrap().unwrap()
    }

    /// Memory store with switchable failures. A stall commits the write
    /// and then hangs past the call timeout, once.
    struct FlakyStore {
        inner: Arc<MemoryStore>,
        fail_inventory: AtomicBool,
        fail_delete: AtomicBool,
        fail_level_reads: AtomicBool,
        transient_find_failures: AtomicU32,
        stall_create_tag: AtomicBool,
        stall_inventory: AtomicBool,
        stall_breaks_level_reads: AtomicBool,
    }

    impl FlakyStore {
        fn new(inner: Arc<MemoryStore>) -> Self {
            Self {
                inner,
                fail_inventory: AtomicBool::new(false),
                fail_delete: AtomicBool::new(false),
                fail_level_reads: AtomicBool::new(false),
                transient_find_failures: AtomicU32::new(0),
                stall_create_tag: AtomicBool::new(false),
                stall_inventory: AtomicBool::new(false),
                stall_breaks_level_reads: AtomicBool::new(false),
            }
        }

        async fn stall_inventory_write(&self) {
            if self.stall_inventory.swap(false, Ordering::SeqCst) {
                if self.stall_breaks_level_reads.load(Ordering::SeqCst) {
                    self.fail_level_reads.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        fn rejected(method: &str) -> StoreError {
            StoreError::Rpc { method: method.to_string(), message: "rejected".to_string() }
        }
    }

    #[async_trait]
    impl InventoryStore for FlakyStore {
        async fn find_by_name(
            &self,
            kind: EntityKind,
            name: &str,
        ) -> Result<Option<RecordId>, StoreError> {
            self.inner.find_by_name(kind, name).await
        }

        async fn find_tag_by_epc(&self, epc: &str) -> Result<Option<TagRecord>, StoreError> {
            let remaining = self.transient_find_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_find_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("HTTP 503".to_string()));
            }
            self.inner.find_tag_by_epc(epc).await
        }

        async fn create_tag(&self, tag: &NewTag) -> Result<RecordId, StoreError> {
            let id = self.inner.create_tag(tag).await?;
            if self.stall_create_tag.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(id)
        }

        async fn update_tag(
            &self,
            id: RecordId,
            scan_time: DateTime<Utc>,
            location_id: RecordId,
        ) -> Result<(), StoreError> {
            self.inner.update_tag(id, scan_time, location_id).await
        }

        async fn delete_tag(&self, id: RecordId) -> Result<(), StoreError> {
            if self.fail_delete.load(Ordering::SeqCst) {
                return Err(Self::rejected("delete_tag"));
            }
            self.inner.delete_tag(id).await
        }

        async fn read_inventory_level(
            &self,
            product_id: RecordId,
            location_id: RecordId,
        ) -> Result<Option<f64>, StoreError> {
            if self.fail_level_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("HTTP 503".to_string()));
            }
            self.inner.read_inventory_level(product_id, location_id).await
        }

        async fn write_inventory_level(
            &self,
            product_id: RecordId,
            location_id: RecordId,
            quantity: f64,
        ) -> Result<(), StoreError> {
            if self.fail_inventory.load(Ordering::SeqCst) {
                return Err(Self::rejected("write_inventory_level"));
            }
            self.inner.write_inventory_level(product_id, location_id, quantity).await?;
            self.stall_inventory_write().await;
            Ok(())
        }

        async fn create_inventory_level(
            &self,
            product_id: RecordId,
            location_id: RecordId,
            quantity: f64,
        ) -> Result<(), StoreError> {
            if self.fail_inventory.load(Ordering::SeqCst) {
                return Err(Self::rejected("create_inventory_level"));
            }
            self.inner.create_inventory_level(product_id, location_id, quantity).await?;
            self.stall_inventory_write().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_first_sighting_creates_tag_and_inventory() {
        let store = seeded();
        let reconciler = Reconciler::new(store.clone(), policy());

        let result = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        assert!(matches!(result, SyncResult::Created { quantity, .. } if quantity == 1.0));

        let widget = id_of(&store, EntityKind::Product, "Widget").await;
        let dock = id_of(&store, EntityKind::Location, "Dock1").await;
        assert_eq!(store.inventory_level(widget, dock), Some(1.0));
        assert_eq!(store.tags_for_epc(EPC_A).len(), 1);
    }

    #[tokio::test]
    async fn test_repeat_sighting_updates_without_inventory_change() {
        let store = seeded();
        let reconciler = Reconciler::new(store.clone(), policy());

        let created = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        for _ in 0..3 {
            let updated = reconciler.reconcile(EPC_A, "Aisle4", "Widget").await.unwrap();
            assert_eq!(updated, SyncResult::Updated { tag_id: created.tag_id() });
        }

        let widget = id_of(&store, EntityKind::Product, "Widget").await;
        let dock = id_of(&store, EntityKind::Location, "Dock1").await;
        let aisle = id_of(&store, EntityKind::Location, "Aisle4").await;
        assert_eq!(store.inventory_level(widget, dock), Some(1.0));
        assert_eq!(store.inventory_level(widget, aisle), None);
        assert_eq!(store.tags_for_epc(EPC_A).len(), 1);
        assert_eq!(store.tags_for_epc(EPC_A)[0].last_scan_location, Some(aisle));
    }

    #[tokio::test]
    async fn test_distinct_epcs_increment_existing_level() {
        let store = seeded();
        let reconciler = Reconciler::new(store.clone(), policy());

        reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        let second = reconciler
            .reconcile("BBBBBBBBBBBBBBBBBBBBBBBB", "Dock1", "Widget")
            .await
            .unwrap();
        assert!(matches!(second, SyncResult::Created { quantity, .. } if quantity == 2.0));
    }

    #[tokio::test]
    async fn test_product_conflict_writes_nothing() {
        let store = seeded();
        let metrics = Arc::new(Metrics::new());
        let reconciler = Reconciler::new(store.clone(), policy()).with_metrics(metrics.clone());

        reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        let before = store.tags_for_epc(EPC_A);

        let err = reconciler.reconcile(EPC_A, "Dock1", "Gadget").await.unwrap_err();
        assert!(matches!(err, ReconcileError::ProductConflict { .. }));
        assert_eq!(store.tags_for_epc(EPC_A), before);

        let gadget = id_of(&store, EntityKind::Product, "Gadget").await;
        let dock = id_of(&store, EntityKind::Location, "Dock1").await;
        assert_eq!(store.inventory_level(gadget, dock), None);
        assert_eq!(metrics.conflicts(), 1);
    }

    #[tokio::test]
    async fn test_unknown_location_is_lookup_failure() {
        let store = seeded();
        let reconciler = Reconciler::new(store.clone(), policy());

        let err = reconciler.reconcile(EPC_A, "Nowhere", "Widget").await.unwrap_err();
        match err {
            ReconcileError::LookupFailed { kind, name } => {
                assert_eq!(kind, EntityKind::Location);
                assert_eq!(name, "Nowhere");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.tag_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_product_is_lookup_failure() {
        let store = seeded();
        let reconciler = Reconciler::new(store.clone(), policy());

        let err = reconciler.reconcile(EPC_A, "Dock1", "Sprocket").await.unwrap_err();
        assert!(matches!(err, ReconcileError::LookupFailed { kind: EntityKind::Product, .. }));
        assert_eq!(store.tag_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_inventory_adjustment_rolls_back_tag() {
        let memory = seeded();
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let metrics = Arc::new(Metrics::new());
        let reconciler = Reconciler::new(flaky.clone(), policy()).with_metrics(metrics.clone());

        flaky.fail_inventory.store(true, Ordering::SeqCst);
        let err = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Store(StoreError::Rpc { .. })));
        assert_eq!(memory.tag_count(), 0);
        assert_eq!(metrics.report().compensations, 1);

        // Next sighting starts over and increments exactly once
        flaky.fail_inventory.store(false, Ordering::SeqCst);
        let result = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        assert!(matches!(result, SyncResult::Created { quantity, .. } if quantity == 1.0));
    }

    #[tokio::test]
    async fn test_failed_rollback_reports_partial_application() {
        let memory = seeded();
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let reconciler = Reconciler::new(flaky.clone(), policy());

        flaky.fail_inventory.store(true, Ordering::SeqCst);
        flaky.fail_delete.store(true, Ordering::SeqCst);
        let err = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap_err();
        assert_eq!(err.kind(), "partial_application");
        assert_eq!(memory.tag_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_store_errors_are_retried() {
        let memory = seeded();
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        flaky.transient_find_failures.store(2, Ordering::SeqCst);
        let metrics = Arc::new(Metrics::new());
        let reconciler = Reconciler::new(flaky, policy()).with_metrics(metrics.clone());

        let result = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        assert_eq!(result.as_str(), "created");
        assert_eq!(metrics.report().store_retries, 2);
    }

    fn stalling_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy { max_attempts, call_timeout: Duration::from_millis(50), ..policy() }
    }

    #[tokio::test]
    async fn test_create_tag_committed_before_timeout_is_not_duplicated() {
        let memory = seeded();
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        flaky.stall_create_tag.store(true, Ordering::SeqCst);
        let reconciler = Reconciler::new(flaky, stalling_policy(3));

        let result = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        assert!(matches!(result, SyncResult::Created { quantity, .. } if quantity == 1.0));
        assert_eq!(memory.tags_for_epc(EPC_A).len(), 1);

        let widget = id_of(&memory, EntityKind::Product, "Widget").await;
        let dock = id_of(&memory, EntityKind::Location, "Dock1").await;
        assert_eq!(memory.inventory_level(widget, dock), Some(1.0));
    }

    #[tokio::test]
    async fn test_inventory_committed_before_timeout_counts_once() {
        let memory = seeded();
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        flaky.stall_inventory.store(true, Ordering::SeqCst);
        let metrics = Arc::new(Metrics::new());
        let reconciler = Reconciler::new(flaky, RetryPolicy::no_retry(Duration::from_millis(50)))
            .with_metrics(metrics.clone());

        let result = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        assert!(matches!(result, SyncResult::Created { quantity, .. } if quantity == 1.0));
        let again = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        assert_eq!(again, SyncResult::Updated { tag_id: result.tag_id() });

        let widget = id_of(&memory, EntityKind::Product, "Widget").await;
        let dock = id_of(&memory, EntityKind::Location, "Dock1").await;
        assert_eq!(memory.inventory_level(widget, dock), Some(1.0));
        assert_eq!(memory.tags_for_epc(EPC_A).len(), 1);
        assert_eq!(metrics.report().compensations, 0);
    }

    #[tokio::test]
    async fn test_increment_committed_before_timeout_is_not_reapplied() {
        let memory = seeded();
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        let reconciler = Reconciler::new(flaky.clone(), stalling_policy(3));

        reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        flaky.stall_inventory.store(true, Ordering::SeqCst);
        let second = reconciler
            .reconcile("BBBBBBBBBBBBBBBBBBBBBBBB", "Dock1", "Widget")
            .await
            .unwrap();
        assert!(matches!(second, SyncResult::Created { quantity, .. } if quantity == 2.0));

        let widget = id_of(&memory, EntityKind::Product, "Widget").await;
        let dock = id_of(&memory, EntityKind::Location, "Dock1").await;
        assert_eq!(memory.inventory_level(widget, dock), Some(2.0));
    }

    #[tokio::test]
    async fn test_unconfirmed_inventory_write_keeps_tag() {
        let memory = seeded();
        let flaky = Arc::new(FlakyStore::new(memory.clone()));
        flaky.stall_inventory.store(true, Ordering::SeqCst);
        flaky.stall_breaks_level_reads.store(true, Ordering::SeqCst);
        let metrics = Arc::new(Metrics::new());
        let reconciler = Reconciler::new(flaky.clone(), stalling_policy(3))
            .with_metrics(metrics.clone());

        let err = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap_err();
        assert_eq!(err.kind(), "partial_application");
        assert_eq!(memory.tag_count(), 1);
        assert_eq!(metrics.report().compensations, 0);

        // The committed +1 is not applied a second time on re-sighting
        flaky.fail_level_reads.store(false, Ordering::SeqCst);
        let again = reconciler.reconcile(EPC_A, "Dock1", "Widget").await.unwrap();
        assert_eq!(again.as_str(), "updated");

        let widget = id_of(&memory, EntityKind::Product, "Widget").await;
        let dock = id_of(&memory, EntityKind::Location, "Dock1").await;
        assert_eq!(memory.inventory_level(widget, dock), Some(1.0));
    }
}
