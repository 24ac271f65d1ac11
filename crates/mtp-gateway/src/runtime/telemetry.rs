use mtp_io::metrics::{init_metrics, serve_metrics, SERVICE_STATE};
use mtp_io::ServiceManager;
use std::thread;
use tracing::info;

pub fn init() {
    init_metrics();
}

pub fn start_metrics_server(addr: Option<&str>) -> Option<thread::JoinHandle<()>> {
    addr.map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.to_string())
    })
}

/// Seed the per-service state gauge before the first transition.
pub async fn publish_service_states(services: &ServiceManager) {
    for name in services.service_names() {
        if let Some(state) = services.service_state(&name).await {
            SERVICE_STATE
                .with_label_values(&[name.as_str()])
                .set(i64::from(state.code()));
        }
    }
}
