//! One evaluation cycle over a set of entities.
//!
//! Load durable records, gate on the market regime, admit through the
//! scheduler, fetch with bounded parallelism, then evaluate, score and
//! aggregate each entity before flushing records back to the store. Only a
//! regime failure escapes as an error.

use crate::alert::detector::{FlashAlert, FlashAlertDetector, IndexHistory, IndexSample};
use crate::config::config::AppCfg;
use crate::confirmation::machine::{
    CheckpointObservation, ConfirmationTracker, ConfirmationVerdict,
};
use crate::core::error::{CycleError, EntityFault, FaultRecord, SourceError};
use crate::core::types::{Entity, EntityId, FetchSpec, RegimeSnapshot, TelemetrySnapshot};
use crate::persistence::store::{EntityRecord, RecordStore};
use crate::pipeline::gate_pipeline::GatePipeline;
use crate::pipeline::types::{EntityEvaluation, GateResult};
use crate::pressure::aggregator::{PressureAggregator, PressureReading};
use crate::scheduler::budget::Admission;
use crate::scheduler::scheduler::RequestScheduler;
use crate::scoring::composite::{ActionTier, CompositeScore, CompositeScorer};
use crate::source::client::TelemetrySource;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{Instrument, debug, info, info_span, warn};

const HISTORY_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    RegimeBlocked,
}

#[derive(Clone, Debug, Serialize)]
pub struct EntityOutcome {
    pub entity: EntityId,
    pub granted: bool,
    /// The grant was boosted after repeated starvation.
    pub escalated: bool,
    pub evaluation: EntityEvaluation,
    pub score: CompositeScore,
    pub prior_score: Option<f64>,
    pub pressure: PressureReading,
    /// Verdict of the case for this session, or of one already armed for the next.
    pub confirmation: Option<ConfirmationVerdict>,
}

impl EntityOutcome {
    pub fn eligible(&self) -> bool {
        self.score.tier == ActionTier::Actionable
            && self
                .confirmation
                .is_some_and(ConfirmationVerdict::grants_eligibility)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub status: CycleStatus,
    pub regime: Arc<GateResult>,
    pub outcomes: Vec<EntityOutcome>,
    pub faults: Vec<FaultRecord>,
    pub alerts: Vec<FlashAlert>,
    /// Verdicts reached during this cycle.
    pub confirmations: Vec<(EntityId, ConfirmationVerdict)>,
    pub store_failures: Vec<String>,
}

impl CycleReport {
    /// A regime block, or nothing reached the actionable tier.
    pub fn is_no_action(&self) -> bool {
        self.status == CycleStatus::RegimeBlocked || self.actionable().next().is_none()
    }

    pub fn actionable(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.score.tier == ActionTier::Actionable)
    }

    pub fn outcome(&self, entity: &str) -> Option<&EntityOutcome> {
        self.outcomes.iter().find(|o| o.entity == entity)
    }
}

/// Owns every piece of cross-cycle state. Shared behind an `Arc` by the actor.
pub struct CycleEngine {
    source: Arc<dyn TelemetrySource>,
    store: Arc<dyn RecordStore>,
    scheduler: RequestScheduler,
    pipeline: GatePipeline,
    scorer: CompositeScorer,
    pressure: PressureAggregator,
    confirmations: ConfirmationTracker,
    alerts: FlashAlertDetector,
    histories: Mutex<HashMap<EntityId, IndexHistory>>,
    last_scores: Mutex<HashMap<EntityId, CompositeScore>>,
    /// Entities whose durable record has been read into memory.
    loaded: Mutex<HashSet<EntityId>>,
    concurrency: usize,
    fetch_timeout: Duration,
    next_cycle: AtomicU64,
}

impl CycleEngine {
    pub fn new(
        cfg: &AppCfg,
        source: Arc<dyn TelemetrySource>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let scheduler = RequestScheduler::new(cfg.scheduler.clone());
        let confirmations =
            ConfirmationTracker::new(cfg.confirmation.clone(), scheduler.calendar().clone());
        Self {
            source,
            store,
            pipeline: GatePipeline::new(&cfg.pipeline),
            scorer: CompositeScorer::new(cfg.scoring.clone()),
            pressure: PressureAggregator::new(cfg.pressure.clone()),
            alerts: FlashAlertDetector::new(cfg.alert.clone()),
            scheduler,
            confirmations,
            histories: Mutex::new(HashMap::new()),
            last_scores: Mutex::new(HashMap::new()),
            loaded: Mutex::new(HashSet::new()),
            concurrency: cfg.cycle.concurrency.max(1),
            fetch_timeout: cfg.cycle.fetch_timeout,
            next_cycle: AtomicU64::new(1),
        }
    }

    pub fn scheduler(&self) -> &RequestScheduler {
        &self.scheduler
    }

    pub fn pressure(&self) -> &PressureAggregator {
        &self.pressure
    }

    pub fn confirmations(&self) -> &ConfirmationTracker {
        &self.confirmations
    }

    pub async fn run_cycle(&self, entities: &[Entity]) -> Result<CycleReport, CycleError> {
        self.run_cycle_at(entities, Utc::now()).await
    }

    pub async fn run_cycle_at(
        &self,
        entities: &[Entity],
        now: DateTime<Utc>,
    ) -> Result<CycleReport, CycleError> {
        let cycle_id = self.next_cycle.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let res = self
            .execute(cycle_id, entities, now)
            .instrument(info_span!("cycle", id = cycle_id))
            .await;
        metrics::histogram!("cycle_duration_seconds").record(started.elapsed().as_secs_f64());
        res
    }

    async fn execute(
        &self,
        cycle_id: u64,
        entities: &[Entity],
        now: DateTime<Utc>,
    ) -> Result<CycleReport, CycleError> {
        let mut store_failures = Vec::new();
        self.load(entities, &mut store_failures).await;

        let regime = self.pipeline.evaluate_regime(&self.fetch_regime().await?)?;
        let mut report = CycleReport {
            cycle_id,
            started_at: now,
            status: CycleStatus::Completed,
            regime: Arc::clone(&regime),
            outcomes: Vec::with_capacity(entities.len()),
            faults: Vec::new(),
            alerts: Vec::new(),
            confirmations: Vec::new(),
            store_failures,
        };
        if regime.is_block() {
            info!(reasons = ?regime.reasons, "regime blocked, no action this cycle");
            report.status = CycleStatus::RegimeBlocked;
            return Ok(report);
        }

        let mut admissions: HashMap<&str, Admission> = HashMap::with_capacity(entities.len());
        for entity in self.scheduler.admission_order(entities) {
            admissions.insert(entity.id.as_str(), self.scheduler.admit(entity, now));
        }

        let grants: Vec<(&Entity, FetchSpec)> = entities
            .iter()
            .filter_map(|e| match admissions.get(e.id.as_str()) {
                Some(Admission::Grant(g)) => Some((e, FetchSpec::limited_to(g.burst))),
                _ => None,
            })
            .collect();
        debug!(granted = grants.len(), total = entities.len(), "admission complete");

        let mut fetched: HashMap<EntityId, (FetchSpec, Result<TelemetrySnapshot, SourceError>)> =
            stream::iter(grants)
                .map(|(entity, spec)| async move {
                    let res = self.fetch(entity, &spec).await;
                    (entity.id.clone(), (spec, res))
                })
                .buffer_unordered(self.concurrency)
                .collect::<HashMap<_, _>>()
                .boxed()
                .await;

        for entity in entities {
            let mut cause = String::from("not admitted");
            let (granted, escalated) = match admissions.remove(entity.id.as_str()) {
                Some(Admission::Grant(g)) => (true, g.escalated),
                Some(Admission::Deny(reason)) => {
                    debug!(entity = %entity.id, %reason, "admission denied");
                    cause = reason.to_string();
                    report.faults.push(fault(entity, EntityFault::Denied(reason)));
                    (false, false)
                }
                None => (false, false),
            };

            let snapshot = match fetched.remove(&entity.id) {
                Some((spec, Ok(snap))) => {
                    for metric in spec.metrics.iter().copied().filter(|m| !snap.has(*m)) {
                        warn!(entity = %entity.id, ?metric, "snapshot missing requested data");
                        report
                            .faults
                            .push(fault(entity, EntityFault::MalformedSnapshot { metric }));
                    }
                    Some(snap)
                }
                Some((_, Err(err))) => {
                    warn!(entity = %entity.id, error = %err, "fetch failed, scoring neutral");
                    cause = err.to_string();
                    report.faults.push(fault(entity, err.into()));
                    None
                }
                None => None,
            };

            let step = self.evaluate_entity(entity, snapshot.as_ref(), &cause, &regime, now);
            report.alerts.extend(step.alert);
            if let Some(verdict) = step.resolved {
                report.confirmations.push((entity.id.clone(), verdict));
            }
            report.outcomes.push(EntityOutcome {
                granted,
                escalated,
                ..step.outcome
            });
        }
        report.confirmations.extend(self.confirmations.expire(now));

        self.flush(entities, &mut report.store_failures).await;

        for o in &report.outcomes {
            let outcome = if o.evaluation.blocked_by.is_some() {
                "blocked"
            } else if !o.granted {
                "denied"
            } else if !o.evaluation.observed {
                "unobserved"
            } else {
                "scored"
            };
            metrics::counter!("cycle_entities_total", "outcome" => outcome).increment(1);
        }
        info!(
            entities = report.outcomes.len(),
            actionable = report.actionable().count(),
            faults = report.faults.len(),
            alerts = report.alerts.len(),
            store_failures = report.store_failures.len(),
            "cycle complete"
        );
        Ok(report)
    }

    fn evaluate_entity(
        &self,
        entity: &Entity,
        snapshot: Option<&TelemetrySnapshot>,
        cause: &str,
        regime: &Arc<GateResult>,
        now: DateTime<Utc>,
    ) -> EntityStep {
        let evaluation = match snapshot {
            Some(snap) => self.pipeline.evaluate(entity, Some(snap), regime),
            None => self.pipeline.evaluate_unobserved(entity, regime, cause),
        };
        let score = self.scorer.score(evaluation.results());

        let mut new_kinds = BTreeSet::new();
        for event in &evaluation.evidence {
            let mut event = event.clone();
            // Provider clocks may run ahead of the cycle clock.
            event.detected_at = event.detected_at.min(now);
            let kind = event.kind;
            if self.pressure.record(event, now) {
                new_kinds.insert(kind);
            }
        }
        let reading = self.pressure.index(&entity.id, now);

        let alert = {
            let mut histories = self.histories.lock();
            let history = histories
                .entry(entity.id.clone())
                .or_insert_with(|| IndexHistory::new(HISTORY_CAPACITY));
            history.push(IndexSample {
                at: now,
                value: reading.value,
                new_kinds: new_kinds.into_iter().collect(),
            });
            self.alerts.check(&entity.id, history, now)
        };

        // A case armed this cycle waits for a later observation.
        let mut resolved = None;
        if self.confirmations.arm(&entity.id, &reading, now).is_none()
            && self.confirmations.checkpoint_due(&entity.id, now)
        {
            if let Some(obs) = snapshot.and_then(CheckpointObservation::from_snapshot) {
                resolved = self.confirmations.resolve(&entity.id, &obs, now);
            }
        }
        let session = self.scheduler.calendar().session_date(now);
        let confirmation = self
            .confirmations
            .case(&entity.id)
            .filter(|c| c.session >= session)
            .map(|c| c.verdict);

        let prior_score = self
            .last_scores
            .lock()
            .insert(entity.id.clone(), score.clone())
            .map(|s| s.value);
        debug!(
            entity = %entity.id,
            score = score.value,
            tier = ?score.tier,
            pressure = reading.value,
            "entity evaluated"
        );

        EntityStep {
            outcome: EntityOutcome {
                entity: entity.id.clone(),
                granted: false,
                escalated: false,
                evaluation,
                score,
                prior_score,
                pressure: reading,
                confirmation,
            },
            alert,
            resolved,
        }
    }

    async fn fetch_regime(&self) -> Result<RegimeSnapshot, CycleError> {
        let res = match tokio::time::timeout(self.fetch_timeout, self.source.fetch_regime()).await {
            Ok(res) => res,
            Err(_) => Err(SourceError::Timeout(self.fetch_timeout)),
        };
        res.map_err(|e| {
            warn!(error = %e, "regime fetch failed, abandoning cycle");
            CycleError::RegimeGateFailure(e.to_string())
        })
    }

    async fn fetch(
        &self,
        entity: &Entity,
        spec: &FetchSpec,
    ) -> Result<TelemetrySnapshot, SourceError> {
        match tokio::time::timeout(self.fetch_timeout, self.source.fetch(entity, spec)).await {
            Ok(res) => res,
            Err(_) => Err(SourceError::Timeout(self.fetch_timeout)),
        }
    }

    /// Reads the window ledger every cycle and each entity record once.
    /// A failed read is retried next cycle.
    async fn load(&self, entities: &[Entity], failures: &mut Vec<String>) {
        match self.store.load_window().await {
            Ok(Some(ledger)) => self.scheduler.restore_window(ledger),
            Ok(None) => {}
            Err(err) => {
                warn!(error = %format!("{err:#}"), "window ledger load failed");
                failures.push(format!("load window: {err:#}"));
            }
        }

        let pending: Vec<&Entity> = {
            let loaded = self.loaded.lock();
            entities.iter().filter(|e| !loaded.contains(&e.id)).collect()
        };
        let results: Vec<(&Entity, anyhow::Result<Option<EntityRecord>>)> = stream::iter(pending)
            .map(|e| async move { (e, self.store.load_entity(&e.id).await) })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .boxed()
            .await;

        for (entity, res) in results {
            match res {
                Ok(record) => {
                    if let Some(record) = record {
                        self.restore(record);
                    }
                    self.loaded.lock().insert(entity.id.clone());
                }
                Err(err) => {
                    warn!(entity = %entity.id, error = %format!("{err:#}"), "record load failed");
                    failures.push(format!("load {}: {err:#}", entity.id));
                }
            }
        }
    }

    /// In-memory state wins over a stored record; evidence is merged.
    fn restore(&self, record: EntityRecord) {
        let EntityRecord {
            entity,
            events,
            budget,
            last_score,
            history,
            confirmation,
        } = record;
        debug!(entity = %entity, events = events.len(), "restoring record");

        self.pressure.restore(&entity, events);
        if let Some(budget) = budget.filter(|_| self.scheduler.budget(&entity).is_none()) {
            self.scheduler.restore_budget(budget);
        }
        if let Some(case) = confirmation {
            self.confirmations.restore(case);
        }
        if let Some(score) = last_score {
            self.last_scores.lock().entry(entity.clone()).or_insert(score);
        }
        if !history.is_empty() {
            self.histories
                .lock()
                .entry(entity)
                .or_insert_with(|| IndexHistory::from_samples(HISTORY_CAPACITY, history));
        }
    }

    fn record_for(&self, entity: &str) -> EntityRecord {
        EntityRecord {
            entity: entity.to_string(),
            events: self.pressure.events(entity),
            budget: self.scheduler.budget(entity),
            last_score: self.last_scores.lock().get(entity).cloned(),
            history: self
                .histories
                .lock()
                .get(entity)
                .map(|h| h.samples().cloned().collect())
                .unwrap_or_default(),
            confirmation: self.confirmations.case(entity),
        }
    }

    async fn flush(&self, entities: &[Entity], failures: &mut Vec<String>) {
        let records: Vec<EntityRecord> = entities.iter().map(|e| self.record_for(&e.id)).collect();
        let results: Vec<(EntityId, anyhow::Result<()>)> = stream::iter(records)
            .map(|record| async move {
                let res = self.store.save_entity(&record).await;
                (record.entity, res)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        for (entity, res) in results {
            if let Err(err) = res {
                warn!(entity = %entity, error = %format!("{err:#}"), "record flush failed");
                failures.push(format!("save {entity}: {err:#}"));
            }
        }

        if let Some(ledger) = self.scheduler.window_ledger() {
            if let Err(err) = self.store.save_window(&ledger).await {
                warn!(error = %format!("{err:#}"), "window ledger flush failed");
                failures.push(format!("save window: {err:#}"));
            }
        }
    }
}

struct EntityStep {
    outcome: EntityOutcome,
    alert: Option<FlashAlert>,
    resolved: Option<ConfirmationVerdict>,
}

fn fault(entity: &Entity, fault: EntityFault) -> FaultRecord {
    FaultRecord {
        entity: entity.id.clone(),
        fault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        BookAggregates, FlowAggregates, MetricKind, PriorityTier, Quote, TapeAggregates,
    };
    use crate::persistence::store::MemoryRecordStore;
    use crate::pressure::aggregator::PressureLevel;
    use crate::scheduler::budget::DenyReason;
    use crate::source::simulator::SimTelemetrySource;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use rust_decimal::Decimal;

    fn cfg() -> AppCfg {
        let mut cfg = AppCfg::default();
        cfg.scheduler.utc_offset_minutes = 0;
        cfg.cycle.fetch_timeout = Duration::from_millis(50);
        cfg
    }

    fn open() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap()
    }

    fn mins(m: i64) -> DateTime<Utc> {
        open() + ChronoDuration::minutes(m)
    }

    fn universe() -> Vec<Entity> {
        vec![
            Entity::new("KRE", "financials", PriorityTier::Hot),
            Entity::new("XLE", "energy", PriorityTier::Warm),
        ]
    }

    fn engine(sim: &Arc<SimTelemetrySource>, store: &Arc<MemoryRecordStore>) -> CycleEngine {
        CycleEngine::new(&cfg(), sim.clone(), store.clone())
    }

    /// Heavy put flow, tape breaking below VWAP, ask-side book.
    fn bearish(entity: &str, at: DateTime<Utc>) -> TelemetrySnapshot {
        TelemetrySnapshot {
            entity: entity.to_string(),
            taken_at: at,
            quote: Some(Quote {
                bid: Decimal::new(9799, 2),
                ask: Decimal::new(9801, 2),
                last: Decimal::new(9800, 2),
                bid_size: Decimal::new(300, 0),
                ask_size: Decimal::new(900, 0),
            }),
            tape: Some(TapeAggregates {
                prev_close: Some(Decimal::new(10000, 2)),
                session_open: Some(Decimal::new(9920, 2)),
                vwap: Some(Decimal::new(9860, 2)),
                volume: Some(3_000_000),
                avg_volume: Some(1_000_000),
                dark_pool_volume: Some(1_200_000),
                block_prints: Some(6),
            }),
            flow: Some(FlowAggregates {
                call_premium: Some(1.0e6),
                put_premium: Some(4.0e6),
                call_sweeps: Some(0),
                put_sweeps: Some(6),
                iv_rank_change: Some(8.0),
                oi_change_pct: Some(15.0),
            }),
            book: Some(BookAggregates {
                spread_bps: Some(3.0),
                baseline_spread_bps: Some(2.0),
                bid_depth: Some(4_000.0),
                ask_depth: Some(10_000.0),
                nearest_level: Some(Decimal::new(9000, 2)),
            }),
        }
    }

    #[tokio::test]
    async fn regime_failure_aborts_before_any_fetch() {
        let sim = Arc::new(SimTelemetrySource::new());
        sim.set_regime(Err(SourceError::Unavailable("index feed down".into())));
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);

        let err = engine.run_cycle_at(&universe(), mins(5)).await.unwrap_err();
        assert!(matches!(err, CycleError::RegimeGateFailure(_)));
        assert_eq!(sim.fetch_count(), 0);
        assert!(engine.scheduler().window_ledger().is_none());
    }

    #[tokio::test]
    async fn missing_critical_regime_field_is_fatal() {
        let sim = Arc::new(SimTelemetrySource::new());
        sim.set_regime(Ok(RegimeSnapshot {
            benchmark_change_pct: Some(0.1),
            ..Default::default()
        }));
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);

        assert!(engine.run_cycle_at(&universe(), mins(5)).await.is_err());
        assert_eq!(sim.fetch_count(), 0);
    }

    #[tokio::test]
    async fn regime_block_is_no_action() {
        let sim = Arc::new(SimTelemetrySource::new());
        sim.set_regime(Ok(RegimeSnapshot {
            benchmark_change_pct: Some(-4.5),
            volatility_level: Some(48.0),
            ..Default::default()
        }));
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);

        let report = engine.run_cycle_at(&universe(), mins(5)).await.unwrap();
        assert_eq!(report.status, CycleStatus::RegimeBlocked);
        assert!(report.is_no_action());
        assert!(report.outcomes.is_empty());
        assert_eq!(sim.fetch_count(), 0);
    }

    #[tokio::test]
    async fn timeouts_score_neutral_and_are_recorded() {
        let sim = Arc::new(SimTelemetrySource::new().with_delay(Duration::from_millis(500)));
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);

        let report = engine.run_cycle_at(&universe(), mins(5)).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        for o in &report.outcomes {
            assert!(o.granted);
            assert!(!o.evaluation.observed);
            assert!(o.evaluation.stages.iter().all(|s| s.sub_score == 0.0));
            assert!(o.evaluation.stages[0].reasons[0].contains("timed out"));
            assert!(o.evaluation.evidence.is_empty());
            assert_eq!(o.pressure.value, 0.0);
        }
        let timeouts = report
            .faults
            .iter()
            .filter(|f| {
                matches!(&f.fault, EntityFault::SourceUnavailable { reason } if reason.contains("timed out"))
            })
            .count();
        assert_eq!(timeouts, 2);
        assert!(report.is_no_action());
    }

    #[tokio::test]
    async fn bearish_snapshot_builds_pressure_and_alerts() {
        let sim = Arc::new(SimTelemetrySource::new());
        sim.script(bearish("KRE", mins(5)));
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);

        let report = engine.run_cycle_at(&universe(), mins(5)).await.unwrap();
        assert_eq!(report.status, CycleStatus::Completed);
        assert_eq!(sim.fetch_count(), 2);

        let kre = report.outcome("KRE").unwrap();
        assert!(kre.granted);
        assert!(kre.evaluation.blocked_by.is_none());
        assert_eq!(kre.evaluation.evidence.len(), 9);
        assert_eq!(kre.pressure.level, PressureLevel::Act);
        assert_eq!(kre.pressure.bias, Some(crate::core::types::Direction::Down));
        assert!(kre.score.value > 0.0 && kre.score.value <= 1.0);
        assert_eq!(kre.prior_score, None);
        assert_eq!(kre.confirmation, Some(ConfirmationVerdict::Pending));

        assert_eq!(report.alerts.len(), 1);
        assert_eq!(report.alerts[0].entity, "KRE");
        assert!(report.store_failures.is_empty());

        let stored = store.load_entity("KRE").await.unwrap().unwrap();
        assert_eq!(stored.events.len(), 9);
        assert!(stored.budget.is_some());
        assert_eq!(stored.history.len(), 1);
        assert!(stored.confirmation.is_some());
        assert_eq!(store.load_window().await.unwrap().unwrap().used_count, 2);
    }

    #[tokio::test]
    async fn flushed_records_survive_into_a_fresh_engine() {
        let store = Arc::new(MemoryRecordStore::new());
        let sim = Arc::new(SimTelemetrySource::new());
        sim.script(bearish("KRE", mins(5)));
        let first = engine(&sim, &store);
        let before = first.run_cycle_at(&universe(), mins(5)).await.unwrap();
        let before_value = before.outcome("KRE").unwrap().pressure.value;

        // Restarted process: nothing in memory, cooldown comes back from the store.
        let sim2 = Arc::new(SimTelemetrySource::new());
        let second = engine(&sim2, &store);
        let report = second.run_cycle_at(&universe(), mins(7)).await.unwrap();

        let kre = report.outcome("KRE").unwrap();
        assert!(!kre.granted);
        assert!(report.faults.iter().any(|f| f.entity == "KRE"
            && matches!(f.fault, EntityFault::Denied(DenyReason::CooldownActive { .. }))));
        assert_eq!(kre.prior_score, Some(before.outcome("KRE").unwrap().score.value));
        assert!(kre.pressure.value > 0.9 && kre.pressure.value <= before_value);
        assert_eq!(sim2.fetch_count(), 0);
        assert_eq!(second.scheduler().window_ledger().unwrap().used_count, 2);
    }

    #[tokio::test]
    async fn store_outage_does_not_abort_the_cycle() {
        let sim = Arc::new(SimTelemetrySource::new());
        sim.script(bearish("KRE", mins(5)));
        let store = Arc::new(MemoryRecordStore::new());
        store.set_offline(true);
        let engine = engine(&sim, &store);

        let report = engine.run_cycle_at(&universe(), mins(5)).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        // window load, two entity loads, two entity saves, window save
        assert_eq!(report.store_failures.len(), 6);
        assert!(report.outcome("KRE").unwrap().pressure.value > 0.0);

        // Back online: the failed loads are retried, memory is kept.
        store.set_offline(false);
        let report = engine.run_cycle_at(&universe(), mins(20)).await.unwrap();
        assert!(report.store_failures.is_empty());
        assert!(store.load_entity("KRE").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_requested_family_is_a_fault() {
        let sim = Arc::new(SimTelemetrySource::new());
        let mut snap = bearish("KRE", mins(5));
        snap.book = None;
        sim.script(snap);
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);

        let report = engine.run_cycle_at(&universe(), mins(5)).await.unwrap();
        assert!(report.faults.iter().any(|f| f.entity == "KRE"
            && f.fault == EntityFault::MalformedSnapshot { metric: MetricKind::Book }));
        let kre = report.outcome("KRE").unwrap();
        assert!(kre.evaluation.observed);
        assert!(kre.pressure.value > 0.0);
    }

    #[tokio::test]
    async fn outside_session_denies_everything() {
        let sim = Arc::new(SimTelemetrySource::new());
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);

        let report = engine
            .run_cycle_at(&universe(), open() - ChronoDuration::hours(2))
            .await
            .unwrap();
        assert_eq!(sim.fetch_count(), 0);
        assert!(report.outcomes.iter().all(|o| !o.granted));
        assert!(report.faults.iter().all(|f| f.fault == EntityFault::Denied(DenyReason::OutsideSession)));
    }

    #[tokio::test]
    async fn checkpoint_confirms_armed_case() {
        let sim = Arc::new(SimTelemetrySource::new());
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);
        let kre = vec![Entity::new("KRE", "financials", PriorityTier::Hot)];

        sim.script(bearish("KRE", mins(5)));
        let report = engine.run_cycle_at(&kre, mins(5)).await.unwrap();
        assert_eq!(report.outcomes[0].confirmation, Some(ConfirmationVerdict::Pending));
        assert!(report.confirmations.is_empty());

        // Checkpoint at open + 15m; the gap down matches the armed direction.
        sim.script(bearish("KRE", mins(20)));
        let report = engine.run_cycle_at(&kre, mins(20)).await.unwrap();
        let confirmed = ConfirmationVerdict::Confirmed { urgent: false };
        assert_eq!(report.confirmations, vec![("KRE".to_string(), confirmed)]);
        assert_eq!(report.outcomes[0].confirmation, Some(confirmed));
        assert!(report.outcomes[0].prior_score.is_some());
    }

    #[tokio::test]
    async fn unobserved_checkpoint_expires_inconclusive() {
        let sim = Arc::new(SimTelemetrySource::new());
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);
        let kre = vec![Entity::new("KRE", "financials", PriorityTier::Hot)];

        sim.script(bearish("KRE", mins(5)));
        engine.run_cycle_at(&kre, mins(5)).await.unwrap();

        sim.fail("KRE", SourceError::Unavailable("maintenance".into()));
        let report = engine.run_cycle_at(&kre, mins(90)).await.unwrap();
        assert_eq!(
            report.confirmations,
            vec![("KRE".to_string(), ConfirmationVerdict::Inconclusive)]
        );
        assert!(!report.outcomes[0].eligible());
    }

    #[tokio::test]
    async fn regime_is_fetched_once_and_shared_by_every_entity() {
        let sim = Arc::new(SimTelemetrySource::new());
        sim.script(bearish("KRE", mins(5)));
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);
        let mut entities = universe();
        entities.push(Entity::new("XLF", "financials", PriorityTier::Cold));

        let report = engine.run_cycle_at(&entities, mins(5)).await.unwrap();
        assert_eq!(sim.regime_fetch_count(), 1);
        assert_eq!(report.outcomes.len(), 3);
        for o in &report.outcomes {
            assert!(Arc::ptr_eq(&report.regime, &o.evaluation.regime));
        }
    }

    #[tokio::test]
    async fn sustained_surge_alerts_once() {
        let sim = Arc::new(SimTelemetrySource::new());
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);
        let kre = vec![Entity::new("KRE", "financials", PriorityTier::Hot)];

        let mut fired = Vec::new();
        for m in (5..=65).step_by(5) {
            sim.script(bearish("KRE", mins(m)));
            let report = engine.run_cycle_at(&kre, mins(m)).await.unwrap();
            fired.extend(report.alerts.iter().map(|a| a.at));
        }
        assert_eq!(fired, vec![mins(5)]);
    }

    #[tokio::test]
    async fn late_arm_is_validated_at_next_checkpoint() {
        let sim = Arc::new(SimTelemetrySource::new());
        let store = Arc::new(MemoryRecordStore::new());
        let engine = engine(&sim, &store);
        let kre = vec![Entity::new("KRE", "financials", PriorityTier::Hot)];

        sim.script(bearish("KRE", mins(120)));
        let report = engine.run_cycle_at(&kre, mins(120)).await.unwrap();
        assert!(report.confirmations.is_empty());
        assert_eq!(report.outcomes[0].confirmation, Some(ConfirmationVerdict::Pending));

        let next_checkpoint = open() + ChronoDuration::days(1) + ChronoDuration::minutes(20);
        sim.script(bearish("KRE", next_checkpoint));
        let report = engine.run_cycle_at(&kre, next_checkpoint).await.unwrap();
        let confirmed = ConfirmationVerdict::Confirmed { urgent: false };
        assert_eq!(report.confirmations, vec![("KRE".to_string(), confirmed)]);
        assert_eq!(report.outcomes[0].confirmation, Some(confirmed));
    }
}
