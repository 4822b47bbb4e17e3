use crate::bus::types::Bus;
use crate::core::types::{Actor, EntityId};
use crate::engine::cycle::{CycleReport, CycleStatus};
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Condensed, loggable view of one cycle.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditSummary {
    pub cycle_id: u64,
    pub status: CycleStatus,
    pub evaluated: usize,
    pub granted: usize,
    pub actionable: Vec<EntityId>,
    /// Actionable and confirmed at today's checkpoint.
    pub eligible: Vec<EntityId>,
    pub faults: usize,
    pub alerts: usize,
    pub store_failures: usize,
    pub no_action: bool,
}

pub fn summarize(report: &CycleReport) -> AuditSummary {
    AuditSummary {
        cycle_id: report.cycle_id,
        status: report.status,
        evaluated: report.outcomes.len(),
        granted: report.outcomes.iter().filter(|o| o.granted).count(),
        actionable: report.actionable().map(|o| o.entity.clone()).collect(),
        eligible: report
            .outcomes
            .iter()
            .filter(|o| o.eligible())
            .map(|o| o.entity.clone())
            .collect(),
        faults: report.faults.len(),
        alerts: report.alerts.len(),
        store_failures: report.store_failures.len(),
        no_action: report.is_no_action(),
    }
}

/// Audit trail consumer: logs every report and alert seen on the bus.
pub struct AuditActor {
    pub bus: Bus,
    pub shutdown: CancellationToken,
}

impl AuditActor {
    pub fn new(bus: Bus, shutdown: CancellationToken) -> AuditActor {
        Self { bus, shutdown }
    }

    fn record(report: &CycleReport) {
        let summary = summarize(report);
        match serde_json::to_string(&summary) {
            Ok(line) => info!(target: "audit", cycle = summary.cycle_id, "{line}"),
            Err(e) => error!("Failed to encode audit summary: {}", e),
        }
        for f in &report.faults {
            warn!(target: "audit", entity = %f.entity, fault = %f.fault, "entity fault");
        }
        for failure in &report.store_failures {
            warn!(target: "audit", %failure, "record store failure");
        }
        for (entity, verdict) in &report.confirmations {
            info!(target: "audit", %entity, ?verdict, "confirmation verdict");
        }
        for o in report.actionable() {
            info!(
                target: "audit",
                entity = %o.entity,
                score = o.score.value,
                pressure = o.pressure.value,
                prior = ?o.prior_score,
                "actionable"
            );
        }
    }
}

#[async_trait]
impl Actor for AuditActor {
    async fn run(self) -> Result<()> {
        info!("AuditActor started");
        let mut reports = self.bus.cycle_reports.subscribe();
        let mut alerts = self.bus.alerts.subscribe();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("AuditActor: shutdown requested");
                    break;
                }

                res = reports.recv() => match res {
                    Ok(report) => Self::record(&report),
                    Err(RecvError::Lagged(n)) => {
                        error!("AuditActor lagged by {n} cycle reports");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        error!("AuditActor report channel closed");
                        break;
                    }
                },

                res = alerts.recv() => match res {
                    Ok(alert) => info!(
                        target: "audit",
                        entity = %alert.entity,
                        delta = alert.delta,
                        kinds = ?alert.kinds,
                        "flash alert"
                    ),
                    Err(RecvError::Lagged(n)) => {
                        error!("AuditActor lagged by {n} flash alerts");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        error!("AuditActor alert channel closed");
                        break;
                    }
                },
            }
        }

        info!("AuditActor stopped cleanly");
        Ok(())
    }
}
