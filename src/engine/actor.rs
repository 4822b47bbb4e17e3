use crate::bus::types::Bus;
use crate::core::types::{Actor, Entity};
use crate::engine::cycle::CycleEngine;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives the engine on a fixed cadence and publishes what each cycle produced.
pub struct CycleActor {
    pub bus: Bus,
    pub engine: Arc<CycleEngine>,
    pub universe: Vec<Entity>,
    pub cadence: Duration,
    pub shutdown: CancellationToken,
}

impl CycleActor {
    pub fn new(
        bus: Bus,
        engine: Arc<CycleEngine>,
        universe: Vec<Entity>,
        cadence: Duration,
        shutdown: CancellationToken,
    ) -> CycleActor {
        Self {
            bus,
            engine,
            universe,
            cadence,
            shutdown,
        }
    }

    async fn tick(&self) {
        match self.engine.run_cycle(&self.universe).await {
            Ok(report) => {
                for alert in &report.alerts {
                    if let Err(e) = self.bus.alerts.publish(alert.clone()).await {
                        error!("Failed to publish flash alert: {}", e);
                    }
                }
                if let Err(e) = self.bus.cycle_reports.publish(report).await {
                    error!("Failed to publish cycle report: {}", e);
                }
            }
            // Abandons this cycle only; the next tick starts fresh.
            Err(e) => warn!(error = %e, "cycle abandoned"),
        }
    }
}

#[async_trait]
impl Actor for CycleActor {
    async fn run(self) -> Result<()> {
        info!(
            entities = self.universe.len(),
            cadence = ?self.cadence,
            "CycleActor started"
        );
        let mut interval = tokio::time::interval(self.cadence);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("CycleActor: shutdown requested");
                    break;
                }
                _ = interval.tick() => {
                    // A cycle in flight is allowed to finish before shutdown is observed.
                    self.tick().await;
                }
            }
        }

        info!("CycleActor stopped cleanly");
        Ok(())
    }
}
