//! Headless alarm host speaking newline-delimited JSON over stdin/stdout.
//!
//! Loads `config.toml`, opens the SQLite alarm store, arms alarms on
//! in-process tokio timers and dispatches fired alarms to the built-in
//! handlers. All diagnostics go to stderr (and optionally a daily log
//! file) so that stdout stays a clean protocol channel.

use anyhow::Context;
use chime::alarm::{
    AlarmService, BootstrapTable, DispatchContextManager, HandlerRegistryBuilder, SqliteAlarmStore,
    TokioWakeFacility, WakeScheduler, handler_fn,
};
use chime::config::{ChimeConfig, LoggingConfig};
use chime::host::channel::{AlarmHost, forward_outcomes};
use chime::host::stdio::run_stdio_bridge;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Name of the bootstrap clients pass to `alarm.start`.
const BUILTIN_BOOTSTRAP: &str = "builtin";

fn builtin_handlers(builder: &mut HandlerRegistryBuilder) -> chime::Result<()> {
    builder.register(
        "log_alarm",
        handler_fn(|inv| async move {
            tracing::info!(
                alarm_id = %inv.alarm_id,
                fired_at_millis = inv.fired_at_millis,
                args = ?inv.args,
                "alarm fired"
            );
        }),
    )?;
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.filter));

    let (file_layer, guard) = if logging.file_logging {
        let appender =
            tracing_appender::rolling::daily(chime::chime_dirs::logs_dir(), "chime-host.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = ChimeConfig::default_config_path();
    let config = ChimeConfig::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let _log_guard = init_tracing(&config.logging);

    tracing::info!("chime-host starting");

    let db_path = config.store.resolved_path();
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = Arc::new(
        SqliteAlarmStore::open(&db_path)
            .with_context(|| format!("opening alarm store {}", db_path.display()))?,
    );

    let mut bootstrap = BootstrapTable::default();
    bootstrap.register(BUILTIN_BOOTSTRAP, builtin_handlers)?;

    let (fire_tx, fire_rx) = mpsc::unbounded_channel();
    let wake = WakeScheduler::new(Arc::new(TokioWakeFacility::new(fire_tx)?));

    let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
    let dispatch = Arc::new(
        DispatchContextManager::new(store.clone(), bootstrap.clone())
            .with_config(&config.dispatch)
            .with_wake_scheduler(wake.clone())
            .with_outcomes(outcome_tx),
    );
    let service = Arc::new(AlarmService::new(store, wake, bootstrap));

    // Timers died with the previous process; re-arm what the store still holds.
    match service.reconcile() {
        Ok(report) => tracing::info!(
            rearmed = report.rearmed.len(),
            dropped = report.dropped.len(),
            failed = report.failed.len(),
            "startup reconcile finished"
        ),
        Err(e) => tracing::warn!(error = %e, "startup reconcile failed"),
    }

    let (event_tx, _) = broadcast::channel(config.host.event_capacity.max(1));
    let pump = tokio::spawn(Arc::clone(&dispatch).run_fire_pump(fire_rx));
    let forwarder = forward_outcomes(event_tx.clone(), outcome_rx);

    let result = run_stdio_bridge(
        AlarmHost::new(service, dispatch),
        config.host.request_capacity,
        event_tx,
    )
    .await;

    pump.abort();
    forwarder.abort();

    result.map_err(|e| {
        tracing::error!(error = %e, "chime-host exited with error");
        anyhow::anyhow!("chime-host failed: {e}")
    })?;

    tracing::info!("chime-host shut down cleanly");
    Ok(())
}
