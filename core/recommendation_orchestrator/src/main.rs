use platform::{AuditLog, CorrelationId};
use recommendation_orchestrator::aggregator::AggregationSweep;
use recommendation_orchestrator::alert::WebhookAlerter;
use recommendation_orchestrator::capabilities::{
    AlertCallback, LogOnlyApplier, NoPredictions, NullMetricsProbe,
};
use recommendation_orchestrator::config_service;
use recommendation_orchestrator::cost::CostCalculator;
use recommendation_orchestrator::outcome::OutcomeTracker;
use recommendation_orchestrator::rollback::RollbackController;
use recommendation_orchestrator::{LifecycleEngine, Repository};
use shared_types::AppConfig;
use std::env;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Resolves on SIGINT (ctrl-c), initiating graceful shutdown.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to install ctrl-c handler: {e}");
    }
}

/// Run `tick` every `period` until shutdown. Missed ticks are skipped, not
/// bursted, and an in-flight tick is drained before the loop exits.
async fn run_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    tick: F,
) where
    F: Fn() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(loop_name = name, "background loop shutting down");
                return;
            }
            _ = interval.tick() => {
                tick().await;
            }
        }
    }
}

fn load_config() -> AppConfig {
    let config_path =
        env::var("CONFIG_PATH").unwrap_or_else(|_| "data/config.toml".to_string());
    let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

    match config_service::load_app_config_with_env(&config_path, &app_env) {
        Ok(config) => {
            info!(path = %config_path, env = %app_env, "configuration loaded");
            config
        }
        Err(e) => {
            warn!(
                path = %config_path,
                error = %e,
                "configuration not loaded, using built-in defaults"
            );
            AppConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenvy::dotenv().ok();

    platform::init_tracing("recommendation_orchestrator").expect("failed to init tracing");

    let metrics_addr = env::var("METRICS_ADDR").unwrap_or_else(|_| "127.0.0.1:9000".to_string());
    match metrics_addr.parse() {
        Ok(addr) => {
            if let Err(e) = platform::init_metrics(addr) {
                warn!(addr = %metrics_addr, error = %e, "failed to initialize metrics exporter");
            } else {
                info!(addr = %metrics_addr, "metrics exporter listening");
            }
        }
        Err(e) => {
            warn!(addr = %metrics_addr, error = %e, "invalid METRICS_ADDR, metrics disabled");
        }
    }

    let config = load_config();

    if let Some(parent) = std::path::Path::new(&config.storage.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let repository = match Repository::new(&config.storage.db_path) {
        Ok(repo) => repo,
        Err(e) => {
            error!(db_path = %config.storage.db_path, error = %e, "failed to open repository");
            return Ok(());
        }
    };
    if let Err(e) = repository.init_schema().await {
        error!(error = %e, "failed to initialize schema");
        return Ok(());
    }

    let audit = AuditLog::new();

    // Capability wiring. Real deployments construct the engine as a library
    // with a cluster-backed applier and telemetry probe; the stand-ins keep
    // the control loop observable without a cluster.
    let applier = Arc::new(LogOnlyApplier);
    let probe = Arc::new(NullMetricsProbe);
    let prediction_source = Arc::new(NoPredictions);
    let alerter: Option<Arc<dyn AlertCallback>> = if config.alerts.webhook_url.is_empty() {
        None
    } else {
        Some(Arc::new(WebhookAlerter::new(config.alerts.webhook_url.clone())))
    };

    let engine = Arc::new(LifecycleEngine::new(
        repository.clone(),
        applier,
        config.engine.clone(),
        audit.clone(),
    ));
    let tracker = Arc::new(OutcomeTracker::new(
        repository.clone(),
        probe,
        config.engine.clone(),
    ));
    let controller = Arc::new(RollbackController::new(
        repository.clone(),
        engine.clone(),
        alerter,
        audit.clone(),
        config.engine.clone(),
    ));
    let sweep = Arc::new(AggregationSweep::new(
        prediction_source,
        repository.clone(),
        engine.clone(),
        CostCalculator::new(config.cost.clone()),
        config.engine.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let sweep_handle = {
        let sweep = sweep.clone();
        let rx = shutdown_tx.subscribe();
        let period = Duration::from_secs(config.loops.aggregation_interval_secs);
        tokio::spawn(async move {
            run_loop("aggregation_sweep", period, rx, || {
                let sweep = sweep.clone();
                platform::instrument_operation(CorrelationId::new(), "aggregation_sweep", async move {
                    if let Err(e) = sweep.run_once().await {
                        warn!(error = %e, "aggregation sweep failed");
                    }
                })
            })
            .await;
        })
    };

    let tracker_handle = {
        let tracker = tracker.clone();
        let rx = shutdown_tx.subscribe();
        let period = Duration::from_secs(config.loops.outcome_poll_interval_secs);
        tokio::spawn(async move {
            run_loop("outcome_poll", period, rx, || {
                let tracker = tracker.clone();
                platform::instrument_operation(CorrelationId::new(), "outcome_poll", async move {
                    if let Err(e) = tracker.poll_once().await {
                        warn!(error = %e, "outcome poll failed");
                    }
                })
            })
            .await;
        })
    };

    let controller_handle = {
        let controller = controller.clone();
        let rx = shutdown_tx.subscribe();
        let period = Duration::from_secs(config.loops.rollback_scan_interval_secs);
        tokio::spawn(async move {
            run_loop("rollback_scan", period, rx, || {
                let controller = controller.clone();
                platform::instrument_operation(CorrelationId::new(), "rollback_scan", async move {
                    match controller.scan_once().await {
                        Ok(summary) if summary.rolled_back > 0 => {
                            info!(
                                rolled_back = summary.rolled_back,
                                alerts_sent = summary.alerts_sent,
                                "rollback scan acted"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "rollback scan failed"),
                    }
                })
            })
            .await;
        })
    };

    info!("recommendation orchestrator started");

    shutdown_signal().await;
    info!("shutdown signal received, draining background loops");
    let _ = shutdown_tx.send(());

    for (name, handle) in [
        ("aggregation_sweep", sweep_handle),
        ("outcome_poll", tracker_handle),
        ("rollback_scan", controller_handle),
    ] {
        if let Err(e) = handle.await {
            warn!(loop_name = name, error = %e, "background loop join failed");
        }
    }

    info!("recommendation orchestrator stopped");
    Ok(())
}
