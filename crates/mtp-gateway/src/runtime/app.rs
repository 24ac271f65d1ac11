use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use mtp_io::{ConfigError, GatewayConfig, GatewayError, ServiceEvent, ServiceManager, TagManager};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("no configuration file given (use --config <PATH>)")]
    MissingConfig,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("failed to open audit log {path}: {source}")]
    Audit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

pub fn run_from_args() -> ExitCode {
    let config = RuntimeConfig::from_env();
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway failed");
            eprintln!("mtp-gateway: {e}");
            ExitCode::FAILURE
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<(), AppError> {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    let path = config.config_path.as_deref().ok_or(AppError::MissingConfig)?;
    let gateway = GatewayConfig::load(path, config.override_path.as_deref())?;
    for warning in gateway.warnings() {
        warn!(warning = %warning, "Configuration warning");
    }
    info!(
        name = %gateway.gateway.name,
        version = %gateway.gateway.version,
        connectors = gateway.connectors.len(),
        tags = gateway.tags.len(),
        services = gateway.services.len(),
        interlocks = gateway.interlocks.len(),
        "Configuration loaded"
    );

    if config.check_config {
        println!(
            "Configuration OK: {} connectors, {} tags, {} services",
            gateway.connectors.len(),
            gateway.tags.len(),
            gateway.services.len()
        );
        return Ok(());
    }

    telemetry::init();
    let _metrics_handle = telemetry::start_metrics_server(config.metrics_addr.as_deref());
    let audit_logger = init_audit_logger(config.audit_path.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(AppError::Runtime)?;
    runtime.block_on(serve(gateway, &config, audit_logger))
}

async fn serve(
    gateway: GatewayConfig,
    config: &RuntimeConfig,
    audit_logger: Option<Arc<AuditLogger>>,
) -> Result<(), AppError> {
    let safety = Arc::new(gateway.safety_controller()?);
    let tags = Arc::new(TagManager::new(
        gateway.tags.clone(),
        gateway.connector_bindings(config.simulate),
        safety,
    )?);
    let services = Arc::new(ServiceManager::new(
        &gateway.services,
        Arc::clone(&tags),
        gateway.interlock_evaluator(),
        gateway.runtime.clone(),
    ));

    if let Some(logger) = &audit_logger {
        let sink = Arc::clone(logger);
        services.subscribe(Arc::new(move |event: &ServiceEvent| {
            if let Err(e) = sink.record_service_event(event) {
                warn!(error = %e, "Failed to write audit entry");
            }
        }));
        audit(
            logger,
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "gateway": gateway.gateway.name,
                "simulate": config.simulate,
                "services": services.service_names(),
            }),
        );
    }

    tags.start();
    services.start();
    telemetry::publish_service_states(&services).await;
    info!(
        simulate = config.simulate,
        comm_loss_action = ?gateway.runtime.comm_loss_action,
        "Gateway running"
    );

    wait_for_shutdown(config.run_seconds).await;

    services.stop().await;
    tags.stop().await;

    let stats = tags.statistics();
    info!(
        total_reads = stats.total_reads,
        total_writes = stats.total_writes,
        total_errors = stats.total_errors,
        good_quality = stats.good_quality_count,
        bad_quality = stats.bad_quality_count,
        "Gateway stopped"
    );

    if let Some(logger) = &audit_logger {
        audit(
            logger,
            AuditEventType::SystemShutdown,
            serde_json::json!({
                "total_reads": stats.total_reads,
                "total_writes": stats.total_writes,
                "total_errors": stats.total_errors,
            }),
        );
    }
    Ok(())
}

async fn wait_for_shutdown(run_seconds: Option<u64>) {
    match run_seconds {
        Some(seconds) => {
            info!(seconds, "Running for limited duration");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
            }
        }
        None => match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received"),
            Err(e) => error!(error = %e, "Failed to listen for interrupt"),
        },
    }
}

fn audit(logger: &AuditLogger, event_type: AuditEventType, details: serde_json::Value) {
    if let Err(e) = logger.log_event(event_type, details) {
        warn!(error = %e, "Failed to write audit entry");
    }
}

fn init_audit_logger(audit_path: Option<&Path>) -> Result<Option<Arc<AuditLogger>>, AppError> {
    let Some(path) = audit_path else {
        return Ok(None);
    };
    let logger = AuditLogger::new(path).map_err(|source| AppError::Audit {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(Arc::new(logger)))
}
