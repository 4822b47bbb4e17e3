use anyhow::{Context, Result};
use pressurewatch::bus::types::Bus;
use pressurewatch::config::config::AppCfg;
use pressurewatch::core::types::Actor;
use pressurewatch::engine::actor::CycleActor;
use pressurewatch::engine::audit::AuditActor;
use pressurewatch::engine::cycle::CycleEngine;
use pressurewatch::persistence::database::PgRecordStore;
use pressurewatch::persistence::store::{MemoryRecordStore, RecordStore};
use pressurewatch::source::simulator::SimTelemetrySource;
use pressurewatch::source::throttled::ThrottledSource;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg_path = std::env::var("PRESSUREWATCH_CONFIG").unwrap_or_else(|_| "config.yml".into());
    let cfg = AppCfg::load(&cfg_path).with_context(|| format!("loading {cfg_path}"))?;

    // Root span for the supervisor/main thread
    let span = info_span!(
        "Supervisor",
        pid = %std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
    );
    let _enter = span.enter();

    info!(entities = cfg.universe.len(), "Starting up");
    if cfg.universe.is_empty() {
        warn!("universe is empty, cycles will evaluate nothing");
    }

    let bus = Bus::new();
    let shutdown = CancellationToken::new();

    let store: Arc<dyn RecordStore> = match cfg.store.database_url.as_deref() {
        Some(url) => {
            info!("Connecting record store (Postgres)");
            Arc::new(
                PgRecordStore::new(url, cfg.store.max_connections)
                    .await
                    .context("connecting record store")?,
            )
        }
        None => {
            info!("Using in-memory record store");
            Arc::new(MemoryRecordStore::new())
        }
    };

    let source = Arc::new(ThrottledSource::new(
        SimTelemetrySource::new(),
        cfg.source.rate_limit_per_minute,
        cfg.cycle.fetch_timeout,
    ));
    let engine = Arc::new(CycleEngine::new(&cfg, source, store));

    info!("Building actors");
    let cycle = CycleActor::new(
        bus.clone(),
        engine,
        cfg.universe.clone(),
        cfg.cycle.cadence,
        shutdown.clone(),
    );
    let audit = AuditActor::new(bus.clone(), shutdown.clone());

    info!("Spawning actors");
    let mut actors = tokio::task::JoinSet::new();
    // Audit first so it is subscribed before the first report goes out.
    actors.spawn(audit.run().instrument(info_span!("Audit")));
    tokio::task::yield_now().await;
    actors.spawn(cycle.run().instrument(info_span!("Cycle")));

    tokio::select! {
        _ = async {
            while let Some(res) = actors.join_next().await {
                match res {
                    Ok(Ok(())) => info!("Actor exited cleanly"),
                    Ok(Err(e)) => error!(?e, "Actor returned error"),
                    Err(panic) => error!(?panic, "Actor panicked/cancelled"),
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down supervisor loop");
            shutdown.cancel();
        }
    }

    info!("Waiting for graceful shutdown of actors");
    while let Some(res) = actors.join_next().await {
        match res {
            Ok(Ok(())) => info!("Actor exited cleanly"),
            Ok(Err(e)) => error!(?e, "Actor returned error"),
            Err(panic) => error!(?panic, "Actor panicked/cancelled"),
        }
    }

    info!("Supervisor exit");
    Ok(())
}
