//! Prometheus metrics for the gateway.
//!
//! Tag I/O, command handling, and connector health are exported on
//! `/metrics`; `/ready` flips once every connector has been polled.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static READY: AtomicBool = AtomicBool::new(false);

// ============================================================================
// Tag Metrics
// ============================================================================

/// Tag values read from connectors
pub static TAG_READS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("mtp_tag_reads_total", "Tag values read from connectors").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Tag reads that produced a non-good quality
pub static TAG_READ_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mtp_tag_read_errors_total",
        "Tag reads that produced a non-good quality",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Tag writes acknowledged by a connector
pub static TAG_WRITES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mtp_tag_writes_total",
        "Tag writes acknowledged by a connector",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Writes rejected by the allowlist or rate limiter
pub static WRITES_DENIED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mtp_writes_denied_total",
        "Writes rejected by the allowlist or rate limiter",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Poll cycle duration per connector in milliseconds
pub static POLL_DURATION_MS: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(
            "mtp_poll_duration_ms",
            "Poll cycle duration per connector in milliseconds",
        )
        .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

// ============================================================================
// Service Metrics
// ============================================================================

/// Commands forwarded to a service proxy
pub static COMMANDS_ISSUED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mtp_commands_issued_total",
        "Commands forwarded to a service proxy",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Commands blocked by an active interlock
pub static COMMANDS_INTERLOCKED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mtp_commands_interlocked_total",
        "Commands blocked by an active interlock",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Commands not valid in the current state
pub static INVALID_TRANSITIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mtp_invalid_transitions_total",
        "Commands not valid in the current state",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Emergency stops executed
pub static EMERGENCY_STOPS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter =
        IntCounter::new("mtp_emergency_stops_total", "Emergency stops executed").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Communication loss events that triggered the configured policy
pub static COMM_LOSS_EVENTS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "mtp_comm_loss_events_total",
        "Communication loss events that triggered the configured policy",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Current PackML state code per service
pub static SERVICE_STATE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("mtp_service_state", "Current PackML state code per service"),
        &["service"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

// ============================================================================
// Connector Metrics
// ============================================================================

/// Connector link status (1 = connected, 0 = disconnected)
pub static CONNECTOR_CONNECTED: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new(
            "mtp_connector_connected",
            "Connector link status (1=connected, 0=disconnected)",
        ),
        &["connector"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::SeqCst);
}

pub fn is_ready() -> bool {
    READY.load(Ordering::SeqCst)
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let path = request.url().to_string();
            match path.as_str() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                    }
                    let mut response = Response::from_data(buffer);
                    if let Ok(header) = tiny_http::Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/plain; version=0.0.4"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    if is_ready() {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = TAG_READS.get();
    let _ = TAG_READ_ERRORS.get();
    let _ = TAG_WRITES.get();
    let _ = WRITES_DENIED.get();
    let _ = POLL_DURATION_MS.get_sample_count();
    let _ = COMMANDS_ISSUED.get();
    let _ = COMMANDS_INTERLOCKED.get();
    let _ = INVALID_TRANSITIONS.get();
    let _ = EMERGENCY_STOPS.get();
    let _ = COMM_LOSS_EVENTS.get();
    LazyLock::force(&SERVICE_STATE);
    LazyLock::force(&CONNECTOR_CONNECTED);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_exposes_gateway_metrics() {
        init_metrics();
        TAG_WRITES.inc();
        SERVICE_STATE.with_label_values(&["Dosing"]).set(3);

        let names: Vec<String> = REGISTRY
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "mtp_tag_writes_total"));
        assert!(names.iter().any(|n| n == "mtp_service_state"));
        assert_eq!(SERVICE_STATE.with_label_values(&["Dosing"]).get(), 3);
    }
}
