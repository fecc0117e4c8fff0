//! EPC to product name mapping
//!
//! SGTIN-style EPCs carry company prefix and item reference near the start
//! of the code, so products are configured by EPC prefix. The longest
//! matching prefix wins; matching ignores ASCII case.

use crate::infra::config::ProductMapping;

pub struct ProductCatalog {
    /// Sorted by prefix length, longest first
    entries: Vec<(String, String)>,
}

impl ProductCatalog {
    pub fn new(mappings: &[ProductMapping]) -> Self {
        let mut entries: Vec<(String, String)> = mappings
            .iter()
            .map(|m| (m.epc_prefix.to_ascii_uppercase(), m.name.clone()))
            .collect();
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries }
    }

    /// Product name for an EPC, if any prefix matches
    pub fn product_for(&self, epc: &str) -> Option<&str> {
        let epc = epc.to_ascii_uppercase();
        self.entries
            .iter()
            .find(|(prefix, _)| epc.starts_with(prefix.as_str()))
            .map(|(_, name)| name.as_str())
    }

    /// Distinct configured product names, sorted
    pub fn product_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.iter().map(|(_, n)| n.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
