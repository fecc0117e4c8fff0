//! Prometheus metrics HTTP endpoint
//!
//! Exposes pipeline metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{
    Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS, METRICS_RECONCILE_BOUNDS,
};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let sum = avg * count;
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.snapshot();
    let mut output = String::with_capacity(4096);

    write_frame_metrics(&mut output, site_id, &summary);
    write_reconcile_metrics(&mut output, site_id, &summary);
    write_dedup_metrics(&mut output, site_id, &summary);

    output
}

fn write_frame_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    let counters: [(&str, &str, u64); 6] = [
        ("rfid_frames_total", "Total frames read", s.frames_total),
        ("rfid_frames_malformed_total", "Frames that failed to decode", s.frames_malformed),
        (
            "rfid_frames_unknown_reader_total",
            "Frames from unconfigured readers",
            s.frames_unknown_reader,
        ),
        ("rfid_frames_invalid_epc_total", "Frames with an invalid EPC", s.frames_invalid_epc),
        (
            "rfid_frames_duplicate_total",
            "Frames suppressed by the dedup window",
            s.frames_duplicate,
        ),
        (
            "rfid_frames_unmapped_total",
            "Accepted sightings with no product mapping",
            s.frames_unmapped,
        ),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }
    write_metric(
        output,
        "rfid_sightings_accepted_total",
        "Sightings that passed dedup",
        MetricType::Counter,
        site,
        s.sightings_accepted,
    );

    write_histogram(
        output,
        "rfid_frame_latency_us",
        "Frame processing latency in microseconds",
        site,
        &s.frame_lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        s.avg_frame_latency_us,
    );
    write_metric(
        output,
        "rfid_frame_latency_p99_us",
        "99th percentile frame latency",
        MetricType::Gauge,
        site,
        s.frame_lat_p99_us,
    );
}

fn write_reconcile_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    let counters: [(&str, &str, u64); 8] = [
        ("rfid_tags_created_total", "Tag records created", s.tags_created),
        ("rfid_tags_updated_total", "Tag records refreshed", s.tags_updated),
        ("rfid_product_conflicts_total", "EPCs claimed by a second product", s.conflicts),
        (
            "rfid_lookup_failures_total",
            "Product or location names missing in the store",
            s.lookup_failures,
        ),
        ("rfid_store_errors_total", "Reconciliations failed by store errors", s.store_errors),
        (
            "rfid_store_retries_total",
            "Store calls retried after a transient failure",
            s.store_retries,
        ),
        ("rfid_compensations_total", "Tag creations rolled back", s.compensations),
        (
            "rfid_partial_applications_total",
            "Tags created without inventory adjustment",
            s.partial_applications,
        ),
    ];
    for (name, help, val) in counters {
        write_metric(output, name, help, MetricType::Counter, site, val);
    }

    write_histogram(
        output,
        "rfid_reconcile_latency_ms",
        "Reconciliation latency in milliseconds",
        site,
        &s.reconcile_lat_buckets,
        &METRICS_RECONCILE_BOUNDS,
        s.reconcile_avg_ms,
    );
    write_metric(
        output,
        "rfid_reconcile_latency_max_ms",
        "Maximum reconciliation latency",
        MetricType::Gauge,
        site,
        s.reconcile_max_ms,
    );
}

fn write_dedup_metrics(output: &mut String, site: &str, s: &MetricsSummary) {
    write_metric(
        output,
        "rfid_dedup_entries",
        "Locations in the dedup table at the last sweep",
        MetricType::Gauge,
        site,
        s.dedup_entries,
    );
    write_metric(
        output,
        "rfid_dedup_evicted_total",
        "Dedup entries evicted by the sweep",
        MetricType::Counter,
        site,
        s.dedup_evicted,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&metrics, &site_id);
            let mut response = text_response(StatusCode::OK, body);
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                async move { handle_request(req, metrics, site_id).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_frame_processed(150);
        metrics.record_frame_processed(250);
        metrics.record_duplicate();
        metrics.record_tag_created();
        metrics.record_reconcile_latency(12);

        let output = format_prometheus_metrics(&metrics, "dock");

        assert!(output.contains("rfid_frames_total{site=\"dock\"} 2"));
        assert!(output.contains("rfid_frames_duplicate_total{site=\"dock\"} 1"));
        assert!(output.contains("rfid_tags_created_total{site=\"dock\"} 1"));
        assert!(output.contains("rfid_frame_latency_us_bucket{site=\"dock\",le=\"+Inf\"} 2"));
        assert!(output.contains("rfid_reconcile_latency_ms_bucket{site=\"dock\",le=\"20\"} 1"));
        assert!(output.contains("# TYPE rfid_dedup_entries gauge"));
    }

    #[test]
    fn test_scrape_does_not_drain_periodic_report() {
        let metrics = Metrics::new();
        metrics.record_frame_processed(150);

        let _ = format_prometheus_metrics(&metrics, "dock");
        assert_eq!(metrics.report().frame_lat_buckets.iter().sum::<u64>(), 1);
    }
}
