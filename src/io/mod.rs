//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `serial` - Serial port / stdin frame sources
//! - `store` - Inventory store trait with Odoo and in-memory backends
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod prometheus;
pub mod serial;
pub mod store;

// Re-export commonly used types
pub use serial::SerialSource;
pub use store::{InventoryStore, MemoryStore, OdooConnection, OdooStore};
