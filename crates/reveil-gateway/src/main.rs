use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use reveil_core::{config::ReveilConfig, AlarmStore, CoreError};
use reveil_playback::SpotifyClient;
use reveil_scheduler::{
    FanoutSink, JsonlSink, ProbeSettings, ReadinessProber, SchedulerEngine, SchedulerSettings,
    StateStore, TcpConnectivity, TelemetrySink, TracingSink,
};
use tracing::{info, warn};

mod app;
mod http;

#[derive(Parser, Debug)]
#[command(name = "reveil-gateway", about = "Alarm scheduler with an HTTP status surface")]
struct Cli {
    /// Path to the TOML config file (defaults to ~/.reveil/reveil.toml).
    #[arg(long, env = "REVEIL_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "reveil_gateway=info,reveil_scheduler=info,reveil_core=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();
    let config = ReveilConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ReveilConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    ensure_parent_dir(&config.scheduler.state_path);
    info!(path = %db_path, "opening SQLite database");

    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;

    let store = match AlarmStore::open(db, config.alarm.clone()) {
        Ok(store) => store,
        Err(CoreError::InvalidAlarm(reason)) => {
            warn!(%reason, "configured alarm rejected, starting from stored or default definition");
            AlarmStore::open(rusqlite::Connection::open(db_path)?, None)?
        }
        Err(e) => return Err(e.into()),
    };
    let store = Arc::new(store);

    let playback = Arc::new(SpotifyClient::new(&config.playback)?);
    let connectivity = Arc::new(TcpConnectivity::new(
        config.readiness.network_probe_addr.clone(),
    ));
    let prober = ReadinessProber::new(
        connectivity,
        playback.clone(),
        ProbeSettings::from(&config.readiness),
    );

    let mut telemetry = FanoutSink::new().with(Arc::new(TracingSink));
    if let Some(path) = &config.telemetry.jsonl_path {
        ensure_parent_dir(path);
        info!(path = %path, "appending telemetry events as JSON lines");
        telemetry = telemetry.with(Arc::new(JsonlSink::new(path)));
    }
    let telemetry: Arc<dyn TelemetrySink> = Arc::new(telemetry);

    let engine = SchedulerEngine::new(
        store.clone(),
        prober,
        playback,
        StateStore::new(&config.scheduler.state_path),
        telemetry,
        SchedulerSettings::from(&config.scheduler),
    )?;
    let status = engine.status();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(store, status));
    let router = app::build_router(state);

    info!("Reveil gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // an in-flight trigger window finishes before the engine sees this
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        warn!(error = %e, "scheduler task ended abnormally");
    }
    Ok(())
}

/// Create the parent directory of `path` if it doesn't exist.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
}
