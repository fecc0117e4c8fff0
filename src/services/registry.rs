//! Reader id to location/window resolution
//!
//! Built once from the typed reader table in config; lookups are exact
//! key matches. Unknown ids are a distinct error so callers can route
//! "new hardware seen" separately from bad tag data.

use crate::domain::error::UnknownReaderError;
use crate::domain::types::ReaderConfig;
use rustc_hash::FxHashMap;

/// Maps reader ids to their static configuration
pub struct ReaderRegistry {
    readers: FxHashMap<String, ReaderConfig>,
}

impl ReaderRegistry {
    pub fn new(readers: &[ReaderConfig]) -> Self {
        let readers = readers.iter().map(|r| (r.reader_id.clone(), r.clone())).collect();
        Self { readers }
    }

    /// Resolve a reader id to its configuration
    pub fn resolve(&self, reader_id: &str) -> Result<&ReaderConfig, UnknownReaderError> {
        self.readers.get(reader_id).ok_or_else(|| UnknownReaderError(reader_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.readers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.is_empty()
    }
}
