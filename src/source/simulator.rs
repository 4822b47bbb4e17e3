use crate::core::error::SourceError;
use crate::core::types::{
    BookAggregates, Entity, EntityId, FetchSpec, FlowAggregates, MetricKind, Quote,
    RegimeSnapshot, TapeAggregates, TelemetrySnapshot,
};
use crate::source::client::TelemetrySource;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Scriptable in-process source. Unscripted entities get a quiet synthetic snapshot.
pub struct SimTelemetrySource {
    scripted: Mutex<HashMap<EntityId, Result<TelemetrySnapshot, SourceError>>>,
    regime: Mutex<Result<RegimeSnapshot, SourceError>>,
    delay: Option<Duration>,
    fetches: AtomicUsize,
    regime_fetches: AtomicUsize,
}

impl Default for SimTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTelemetrySource {
    pub fn new() -> Self {
        Self {
            scripted: Mutex::new(HashMap::new()),
            regime: Mutex::new(Ok(calm_regime())),
            delay: None,
            fetches: AtomicUsize::new(0),
            regime_fetches: AtomicUsize::new(0),
        }
    }

    /// Every entity fetch sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(&self, snapshot: TelemetrySnapshot) {
        self.scripted
            .lock()
            .insert(snapshot.entity.clone(), Ok(snapshot));
    }

    pub fn fail(&self, entity: impl Into<String>, err: SourceError) {
        self.scripted.lock().insert(entity.into(), Err(err));
    }

    pub fn set_regime(&self, regime: Result<RegimeSnapshot, SourceError>) {
        *self.regime.lock() = regime;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn regime_fetch_count(&self) -> usize {
        self.regime_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TelemetrySource for SimTelemetrySource {
    async fn fetch(
        &self,
        entity: &Entity,
        spec: &FetchSpec,
    ) -> Result<TelemetrySnapshot, SourceError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.scripted.lock().get(&entity.id).cloned();
        let snap = match scripted {
            Some(res) => res?,
            None => synthetic(&entity.id, n),
        };
        Ok(restrict(snap, spec))
    }

    async fn fetch_regime(&self) -> Result<RegimeSnapshot, SourceError> {
        self.regime_fetches.fetch_add(1, Ordering::SeqCst);
        self.regime.lock().clone()
    }
}

/// Drops metric families the fetch spec did not ask for.
fn restrict(mut snap: TelemetrySnapshot, spec: &FetchSpec) -> TelemetrySnapshot {
    if !spec.wants(MetricKind::Quote) {
        snap.quote = None;
    }
    if !spec.wants(MetricKind::Tape) {
        snap.tape = None;
    }
    if !spec.wants(MetricKind::Flow) {
        snap.flow = None;
    }
    if !spec.wants(MetricKind::Book) {
        snap.book = None;
    }
    snap
}

fn calm_regime() -> RegimeSnapshot {
    RegimeSnapshot {
        taken_at: Some(Utc::now()),
        benchmark_change_pct: Some(0.2),
        volatility_level: Some(15.0),
        volatility_change_pct: Some(-1.0),
        breadth_ratio: Some(0.55),
    }
}

/// A slow deterministic drift so the demo binary has something to look at.
fn synthetic(entity: &str, n: usize) -> TelemetrySnapshot {
    let phase = (n % 12) as i64;
    let last = Decimal::new(10_000 + phase * 15, 2);
    let put_heavy = phase >= 8;

    TelemetrySnapshot {
        entity: entity.to_string(),
        taken_at: Utc::now(),
        quote: Some(Quote {
            bid: last - Decimal::new(1, 2),
            ask: last + Decimal::new(1, 2),
            last,
            bid_size: Decimal::new(500, 0),
            ask_size: Decimal::new(500, 0),
        }),
        tape: Some(TapeAggregates {
            prev_close: Some(Decimal::new(10_000, 2)),
            session_open: Some(Decimal::new(10_010, 2)),
            vwap: Some(Decimal::new(10_040, 2)),
            volume: Some(1_000_000 + phase as u64 * 150_000),
            avg_volume: Some(1_000_000),
            dark_pool_volume: Some(300_000),
            block_prints: Some(phase as u32 / 3),
        }),
        flow: Some(FlowAggregates {
            call_premium: Some(if put_heavy { 1.0e6 } else { 2.0e6 }),
            put_premium: Some(if put_heavy { 3.0e6 } else { 1.5e6 }),
            call_sweeps: Some(1),
            put_sweeps: Some(if put_heavy { 4 } else { 1 }),
            iv_rank_change: Some(phase as f64),
            oi_change_pct: Some(phase as f64 * 1.5),
        }),
        book: Some(BookAggregates {
            spread_bps: Some(2.0),
            baseline_spread_bps: Some(2.0),
            bid_depth: Some(10_000.0),
            ask_depth: Some(10_000.0),
            nearest_level: Some(Decimal::new(9_500, 2)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PriorityTier;

    #[tokio::test]
    async fn fetch_respects_spec_and_scripts() {
        let sim = SimTelemetrySource::new();
        let aapl = Entity::new("AAPL", "tech", PriorityTier::Hot);

        let snap = sim.fetch(&aapl, &FetchSpec::limited_to(2)).await.unwrap();
        assert!(snap.has(MetricKind::Quote));
        assert!(snap.has(MetricKind::Tape));
        assert!(!snap.has(MetricKind::Flow));
        assert!(!snap.has(MetricKind::Book));

        sim.fail("AAPL", SourceError::Denied("quota".into()));
        let err = sim.fetch(&aapl, &FetchSpec::full()).await.unwrap_err();
        assert_eq!(err, SourceError::Denied("quota".into()));
        assert_eq!(sim.fetch_count(), 2);
    }

    #[tokio::test]
    async fn regime_can_be_scripted() {
        let sim = SimTelemetrySource::new();
        assert!(sim.fetch_regime().await.unwrap().benchmark_change_pct.is_some());
        sim.set_regime(Err(SourceError::Unavailable("down".into())));
        assert!(sim.fetch_regime().await.is_err());
        assert_eq!(sim.regime_fetch_count(), 2);
    }
}
