//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::ReaderConfig;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Odoo,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Odoo => "odoo",
            StoreBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SiteConfig {
    #[serde(default = "default_site_id")]
    pub id: String,
}

fn default_site_id() -> String {
    "rfid".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Pause between frame-source polls when no frame is waiting
    #[serde(default = "default_read_interval_secs")]
    pub read_interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { read_interval_secs: default_read_interval_secs() }
    }
}

fn default_read_interval_secs() -> u64 {
    1
}

/// One physical transport; `device = "-"` reads frames from stdin
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub name: Option<String>,
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
}

impl TransportConfig {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.device)
    }

    pub fn is_stdin(&self) -> bool {
        self.device == "-"
    }
}

fn default_baud() -> u32 {
    115200
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderToml {
    pub location: String,
    pub duplicate_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Entries older than `eviction_factor` x their window are swept
    #[serde(default = "default_eviction_factor")]
    pub eviction_factor: u32,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            eviction_factor: default_eviction_factor(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_eviction_factor() -> u32 {
    4
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// EPC prefix to product name mapping (longest prefix wins)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProductMapping {
    pub epc_prefix: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// Upper bound for a single external store call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { backend: default_store_backend(), call_timeout_ms: default_call_timeout_ms() }
    }
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Odoo
}

fn default_call_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct OdooConfig {
    #[serde(default = "default_odoo_url")]
    pub url: String,
    #[serde(default = "default_odoo_db")]
    pub db: String,
    #[serde(default = "default_odoo_username")]
    pub username: String,
    #[serde(default = "default_odoo_password")]
    pub password: String,
}

impl Default for OdooConfig {
    fn default() -> Self {
        Self {
            url: default_odoo_url(),
            db: default_odoo_db(),
            username: default_odoo_username(),
            password: default_odoo_password(),
        }
    }
}

fn default_odoo_url() -> String {
    "http://localhost:8069".to_string()
}

fn default_odoo_db() -> String {
    "warehouseDB".to_string()
}

fn default_odoo_username() -> String {
    "admin".to_string()
}

fn default_odoo_password() -> String {
    "admin".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_coefficient")]
    pub backoff_coefficient: u32,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval_ms(),
            backoff_coefficient: default_backoff_coefficient(),
            max_interval_ms: default_max_interval_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval_ms() -> u64 {
    200
}

fn default_backoff_coefficient() -> u32 {
    2
}

fn default_max_interval_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default)]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs(), prometheus_port: 0 }
    }
}

fn default_metrics_interval_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub transports: Vec<TransportConfig>,
    #[serde(default)]
    pub readers: HashMap<String, ReaderToml>,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub products: Vec<ProductMapping>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub odoo: OdooConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    read_interval_secs: u64,
    transports: Vec<TransportConfig>,
    readers: Vec<ReaderConfig>,
    dedup_eviction_factor: u32,
    dedup_sweep_interval_secs: u64,
    products: Vec<ProductMapping>,
    store_backend: StoreBackend,
    store_call_timeout_ms: u64,
    odoo_url: String,
    odoo_db: String,
    odoo_username: String,
    odoo_password: String,
    retry_max_attempts: u32,
    retry_initial_interval_ms: u64,
    retry_backoff_coefficient: u32,
    retry_max_interval_ms: u64,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            read_interval_secs: default_read_interval_secs(),
            transports: vec![TransportConfig {
                name: Some("reader-1".to_string()),
                device: "/dev/ttyUSB0".to_string(),
                baud: default_baud(),
            }],
            readers: vec![ReaderConfig {
                reader_id: "1".to_string(),
                location: "WH/Stock".to_string(),
                duplicate_window: Duration::from_secs(10),
            }],
            dedup_eviction_factor: default_eviction_factor(),
            dedup_sweep_interval_secs: default_sweep_interval_secs(),
            products: Vec::new(),
            store_backend: default_store_backend(),
            store_call_timeout_ms: default_call_timeout_ms(),
            odoo_url: default_odoo_url(),
            odoo_db: default_odoo_db(),
            odoo_username: default_odoo_username(),
            odoo_password: default_odoo_password(),
            retry_max_attempts: default_max_attempts(),
            retry_initial_interval_ms: default_initial_interval_ms(),
            retry_backoff_coefficient: default_backoff_coefficient(),
            retry_max_interval_ms: default_max_interval_ms(),
            metrics_interval_secs: default_metrics_interval_secs(),
            prometheus_port: 0,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine config file path from an explicit argument or environment
    pub fn resolve_config_path(explicit: Option<&str>) -> String {
        if let Some(path) = explicit {
            return path.to_string();
        }

        // Check CONFIG_FILE environment variable
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self::from_toml(toml_config, path.display().to_string()))
    }

    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        // Typed reader table, sorted for stable logging
        let mut readers: Vec<ReaderConfig> = toml_config
            .readers
            .into_iter()
            .map(|(reader_id, r)| ReaderConfig {
                reader_id,
                location: r.location,
                duplicate_window: Duration::from_secs(r.duplicate_window_secs),
            })
            .collect();
        readers.sort_by(|a, b| a.reader_id.cmp(&b.reader_id));

        Self {
            site_id: toml_config.site.id,
            read_interval_secs: toml_config.ingest.read_interval_secs,
            transports: toml_config.transports,
            readers,
            // A factor below 1 would evict entries that still suppress
            dedup_eviction_factor: toml_config.dedup.eviction_factor.max(1),
            dedup_sweep_interval_secs: toml_config.dedup.sweep_interval_secs,
            products: toml_config.products,
            store_backend: toml_config.store.backend,
            store_call_timeout_ms: toml_config.store.call_timeout_ms,
            odoo_url: toml_config.odoo.url,
            odoo_db: toml_config.odoo.db,
            odoo_username: toml_config.odoo.username,
            odoo_password: toml_config.odoo.password,
            retry_max_attempts: toml_config.retry.max_attempts.max(1),
            retry_initial_interval_ms: toml_config.retry.initial_interval_ms,
            retry_backoff_coefficient: toml_config.retry.backoff_coefficient,
            retry_max_interval_ms: toml_config.retry.max_interval_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file,
        }
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    /// Poll timeout for a transport read; never zero
    pub fn read_interval(&self) -> Duration {
        Duration::from_secs(self.read_interval_secs.max(1))
    }

    pub fn transports(&self) -> &[TransportConfig] {
        &self.transports
    }

    pub fn readers(&self) -> &[ReaderConfig] {
        &self.readers
    }

    pub fn dedup_eviction_factor(&self) -> u32 {
        self.dedup_eviction_factor
    }

    pub fn dedup_sweep_interval_secs(&self) -> u64 {
        self.dedup_sweep_interval_secs
    }

    pub fn products(&self) -> &[ProductMapping] {
        &self.products
    }

    pub fn store_backend(&self) -> StoreBackend {
        self.store_backend
    }

    pub fn store_call_timeout(&self) -> Duration {
        Duration::from_millis(self.store_call_timeout_ms)
    }

    pub fn odoo_url(&self) -> &str {
        &self.odoo_url
    }

    pub fn odoo_db(&self) -> &str {
        &self.odoo_db
    }

    pub fn odoo_username(&self) -> &str {
        &self.odoo_username
    }

    pub fn odoo_password(&self) -> &str {
        &self.odoo_password
    }

    pub fn retry_max_attempts(&self) -> u32 {
        self.retry_max_attempts
    }

    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.retry_initial_interval_ms)
    }

    pub fn retry_backoff_coefficient(&self) -> u32 {
        self.retry_backoff_coefficient
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.retry_max_interval_ms)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Distinct location names referenced by the reader table
    pub fn locations(&self) -> Vec<&str> {
        let mut locations: Vec<&str> = self.readers.iter().map(|r| r.location.as_str()).collect();
        locations.sort_unstable();
        locations.dedup();
        locations
    }

    /// Builder method for tests to replace the reader table
    #[cfg(test)]
    pub fn with_readers(mut self, readers: Vec<ReaderConfig>) -> Self {
        self.readers = readers;
        self
    }

    /// Builder method for tests to replace the product catalog
    #[cfg(test)]
    pub fn with_products(mut self, products: Vec<ProductMapping>) -> Self {
        self.products = products;
        self
    }
}
