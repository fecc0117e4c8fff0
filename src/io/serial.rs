//! Reader frame sources
//!
//! A transport is either a serial port (tokio-serial, 8N1 at the configured
//! baud) or stdin when `device = "-"`. Both are line oriented and feed
//! `run_ingestion`.

use crate::domain::error::TransportError;
use crate::infra::config::TransportConfig;
use crate::services::pipeline::{run_ingestion, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info};

pub struct SerialSource {
    name: String,
    device: String,
    stdin: bool,
    baud: u32,
    read_interval: Duration,
}

impl SerialSource {
    pub fn new(transport: &TransportConfig, read_interval: Duration) -> Self {
        Self {
            name: transport.display_name().to_string(),
            device: transport.device.clone(),
            stdin: transport.is_stdin(),
            baud: transport.baud,
            read_interval,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open the transport and ingest frames until EOF, shutdown or I/O failure
    pub async fn run(
        self,
        pipeline: Arc<Pipeline>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        if self.stdin {
            info!(source = %self.name, "stdin_source_opened");
            let reader = BufReader::new(tokio::io::stdin());
            return run_ingestion(&self.name, reader, pipeline, self.read_interval, shutdown).await;
        }

        let port = tokio_serial::new(&self.device, self.baud)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| {
                error!(device = %self.device, error = %e, "serial_port_open_failed");
                TransportError::Open { device: self.device.clone(), source: e }
            })?;

        info!(source = %self.name, device = %self.device, baud = %self.baud, "serial_port_opened");
        let reader = BufReader::new(port);
        run_ingestion(&self.name, reader, pipeline, self.read_interval, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::Config;
    use crate::infra::metrics::Metrics;
    use crate::services::dedup::DedupCache;

    #[test]
    fn test_source_from_transport_config() {
        let transport = TransportConfig {
            name: None,
            device: "/dev/ttyUSB3".to_string(),
            baud: 9600,
        };
        let source = SerialSource::new(&transport, Duration::from_secs(1));
        assert_eq!(source.name(), "/dev/ttyUSB3");
        assert_eq!(source.baud, 9600);
        assert!(!source.stdin);

        let stdin = TransportConfig { name: None, device: "-".to_string(), baud: 9600 };
        assert!(SerialSource::new(&stdin, Duration::from_secs(1)).stdin);
    }

    #[tokio::test]
    async fn test_missing_device_is_open_error() {
        let transport = TransportConfig {
            name: Some("ghost".to_string()),
            device: "/dev/rfid-sync-does-not-exist".to_string(),
            baud: 115200,
        };
        let config = Config::default();
        let pipeline = Arc::new(Pipeline::from_config(
            &config,
            Arc::new(DedupCache::new()),
            Arc::new(Metrics::new()),
        ));
        let (_tx, rx) = watch::channel(false);

        let result =
            SerialSource::new(&transport, Duration::from_millis(10)).run(pipeline, rx).await;
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }
}
