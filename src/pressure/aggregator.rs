//! Per-entity, time-decayed evidence aggregation.
//!
//! `index = min(1, (1 + k·(distinct − 1)) · Σ w(kind) · strength · e^(−λ·hours))`
//!
//! Only events with `now − ttl ≤ detected_at ≤ now` are live. The ledger is
//! the only durable state; readings are recomputed on demand.

use crate::config::config::{EvidenceWeights, PressureCfg, PressureThresholds, to_delta};
use crate::core::types::{Direction, EntityId, EvidenceEvent, EvidenceKind, clamp_unit};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    None,
    Watch,
    Prepare,
    Act,
}

impl PressureLevel {
    pub fn classify(value: f64, t: &PressureThresholds) -> Self {
        if value >= t.act {
            PressureLevel::Act
        } else if value >= t.prepare {
            PressureLevel::Prepare
        } else if value >= t.watch {
            PressureLevel::Watch
        } else {
            PressureLevel::None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PressureReading {
    pub value: f64,
    pub level: PressureLevel,
    pub bias: Option<Direction>,
    pub distinct_kinds: usize,
    pub live_events: usize,
}

impl PressureReading {
    pub fn zero() -> Self {
        Self {
            value: 0.0,
            level: PressureLevel::None,
            bias: None,
            distinct_kinds: 0,
            live_events: 0,
        }
    }
}

fn event_order(a: &EvidenceEvent, b: &EvidenceEvent) -> Ordering {
    a.detected_at
        .cmp(&b.detected_at)
        .then(a.kind.cmp(&b.kind))
        .then(a.direction.cmp(&b.direction))
        .then(a.strength.total_cmp(&b.strength))
}

/// Sorted, de-duplicated event list for one entity.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EvidenceLedger {
    events: Vec<EvidenceEvent>,
}

impl EvidenceLedger {
    pub fn from_events(events: impl IntoIterator<Item = EvidenceEvent>) -> Self {
        let mut ledger = Self::default();
        ledger.merge(events);
        ledger
    }

    /// Returns false when an identical event is already present.
    pub fn insert(&mut self, event: EvidenceEvent) -> bool {
        match self.events.binary_search_by(|e| event_order(e, &event)) {
            Ok(_) => false,
            Err(pos) => {
                self.events.insert(pos, event);
                true
            }
        }
    }

    pub fn merge(&mut self, events: impl IntoIterator<Item = EvidenceEvent>) {
        for e in events {
            self.insert(e);
        }
    }

    /// Drops events detected before `cutoff`. Returns how many were removed.
    pub fn prune_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.events.len();
        self.events.retain(|e| e.detected_at >= cutoff);
        before - self.events.len()
    }

    pub fn events(&self) -> &[EvidenceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

fn base_weight(w: &EvidenceWeights, kind: EvidenceKind) -> f64 {
    match kind {
        EvidenceKind::SweepFlow => w.sweep_flow,
        EvidenceKind::PremiumSkew => w.premium_skew,
        EvidenceKind::IvExpansion => w.iv_expansion,
        EvidenceKind::OpenInterestBuild => w.open_interest_build,
        EvidenceKind::DarkPoolBlock => w.dark_pool_block,
        EvidenceKind::VolumeSurge => w.volume_surge,
        EvidenceKind::VwapRejection => w.vwap_rejection,
        EvidenceKind::SpreadStress => w.spread_stress,
        EvidenceKind::BookImbalance => w.book_imbalance,
    }
}

/// Pure index computation over an event slice.
pub fn compute_index(events: &[EvidenceEvent], now: DateTime<Utc>, cfg: &PressureCfg) -> PressureReading {
    let oldest = now - to_delta(cfg.ttl);
    let mut sum = 0.0;
    let mut directional = 0.0;
    let mut kinds = BTreeSet::new();
    let mut live = 0;

    for e in events
        .iter()
        .filter(|e| e.detected_at <= now && e.detected_at >= oldest)
    {
        let hours = (now - e.detected_at).num_milliseconds() as f64 / 3_600_000.0;
        let c = base_weight(&cfg.base_weights, e.kind) * e.strength * (-cfg.decay_per_hour * hours).exp();
        sum += c;
        directional += c * e.direction.sign();
        kinds.insert(e.kind);
        live += 1;
    }

    if live == 0 {
        return PressureReading::zero();
    }

    let bonus = 1.0 + cfg.diversity_coefficient * (kinds.len() as f64 - 1.0);
    let value = clamp_unit((bonus * sum).min(1.0));
    PressureReading {
        value,
        level: PressureLevel::classify(value, &cfg.levels),
        bias: Direction::of(directional),
        distinct_kinds: kinds.len(),
        live_events: live,
    }
}

/// Owns every entity's ledger. One lock per entity.
pub struct PressureAggregator {
    cfg: PressureCfg,
    ledgers: RwLock<HashMap<EntityId, Arc<Mutex<EvidenceLedger>>>>,
}

impl PressureAggregator {
    pub fn new(cfg: PressureCfg) -> Self {
        Self {
            cfg,
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    fn ledger(&self, entity: &str) -> Arc<Mutex<EvidenceLedger>> {
        if let Some(l) = self.ledgers.read().get(entity) {
            return Arc::clone(l);
        }
        let mut map = self.ledgers.write();
        Arc::clone(map.entry(entity.to_string()).or_default())
    }

    /// Appends one event and prunes anything past the TTL.
    pub fn record(&self, event: EvidenceEvent, now: DateTime<Utc>) -> bool {
        let ledger = self.ledger(&event.entity);
        let mut ledger = ledger.lock();
        let added = ledger.insert(event);
        ledger.prune_before(now - to_delta(self.cfg.ttl));
        added
    }

    pub fn index(&self, entity: &str, now: DateTime<Utc>) -> PressureReading {
        let Some(ledger) = self.ledgers.read().get(entity).cloned() else {
            return PressureReading::zero();
        };
        let ledger = ledger.lock();
        compute_index(ledger.events(), now, &self.cfg)
    }

    pub fn events(&self, entity: &str) -> Vec<EvidenceEvent> {
        self.ledgers
            .read()
            .get(entity)
            .map(|l| l.lock().events().to_vec())
            .unwrap_or_default()
    }

    /// Merges a persisted history. Order-independent with concurrent records.
    pub fn restore(&self, entity: &str, events: Vec<EvidenceEvent>) {
        self.ledger(entity).lock().merge(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
    }

    fn ev(kind: EvidenceKind, dir: Direction, strength: f64, at: DateTime<Utc>) -> EvidenceEvent {
        EvidenceEvent::new("KRE", kind, dir, strength, at)
    }

    #[test]
    fn single_event_decays_exponentially() {
        let agg = PressureAggregator::new(PressureCfg::default());
        agg.record(ev(EvidenceKind::SweepFlow, Direction::Down, 1.0, t0()), t0());

        let fresh = agg.index("KRE", t0());
        assert!((fresh.value - 0.30).abs() < 1e-9);
        assert_eq!(fresh.level, PressureLevel::Watch);
        assert_eq!(fresh.bias, Some(Direction::Down));

        let later = agg.index("KRE", t0() + Duration::hours(10));
        assert!((later.value - 0.30 * (-1.0f64).exp()).abs() < 1e-9);
        assert_eq!(later.level, PressureLevel::None);
    }

    #[test]
    fn diverse_evidence_beats_repeated_kind() {
        let cfg = PressureCfg::default();
        let at = |m| t0() - Duration::minutes(m);
        let diverse = vec![
            ev(EvidenceKind::IvExpansion, Direction::Up, 1.0, at(0)),
            ev(EvidenceKind::OpenInterestBuild, Direction::Up, 1.0, at(1)),
            ev(EvidenceKind::VolumeSurge, Direction::Up, 1.0, at(2)),
        ];
        let repeated = vec![
            ev(EvidenceKind::IvExpansion, Direction::Up, 1.0, at(0)),
            ev(EvidenceKind::IvExpansion, Direction::Up, 1.0, at(1)),
            ev(EvidenceKind::IvExpansion, Direction::Up, 1.0, at(2)),
        ];
        let a = compute_index(&diverse, t0(), &cfg);
        let b = compute_index(&repeated, t0(), &cfg);
        assert_eq!(a.distinct_kinds, 3);
        assert_eq!(b.distinct_kinds, 1);
        assert!(a.value > b.value);
    }

    #[test]
    fn ttl_and_future_events_excluded() {
        let agg = PressureAggregator::new(PressureCfg::default());
        let stale = ev(EvidenceKind::DarkPoolBlock, Direction::Up, 1.0, t0() - Duration::hours(73));
        let future = ev(EvidenceKind::DarkPoolBlock, Direction::Up, 1.0, t0() + Duration::minutes(5));
        agg.restore("KRE", vec![stale.clone(), future.clone()]);

        // Restore does not prune; the computation still ignores both.
        assert_eq!(agg.index("KRE", t0()), PressureReading::zero());

        // The next write prunes the stale one but keeps the future one.
        agg.record(ev(EvidenceKind::VolumeSurge, Direction::Up, 0.5, t0()), t0());
        let events = agg.events("KRE");
        assert!(!events.contains(&stale));
        assert!(events.contains(&future));
        assert_eq!(agg.index("KRE", t0()).live_events, 1);
        assert_eq!(agg.index("KRE", t0() + Duration::minutes(5)).live_events, 2);
    }

    #[test]
    fn merge_is_commutative_and_deduplicated() {
        let e1 = ev(EvidenceKind::SweepFlow, Direction::Down, 0.8, t0());
        let e2 = ev(EvidenceKind::SpreadStress, Direction::Down, 0.4, t0());
        let e3 = ev(EvidenceKind::SweepFlow, Direction::Down, 0.6, t0() - Duration::minutes(30));

        let a = EvidenceLedger::from_events(vec![e1.clone(), e2.clone(), e3.clone()]);
        let mut b = EvidenceLedger::from_events(vec![e3.clone(), e1.clone()]);
        b.merge(vec![e2.clone(), e1.clone()]);
        assert_eq!(a, b);
        assert_eq!(b.len(), 3);
        assert_eq!(b.events()[0], e3);
    }

    #[test]
    fn persisted_history_reloads_to_same_index() {
        let cfg = PressureCfg::default();
        let agg = PressureAggregator::new(cfg.clone());
        for (m, kind) in [(0, EvidenceKind::SweepFlow), (20, EvidenceKind::PremiumSkew)] {
            agg.record(ev(kind, Direction::Down, 0.7, t0() + Duration::minutes(m)), t0());
        }
        let json = serde_json::to_string(&agg.events("KRE")).unwrap();

        let reloaded = PressureAggregator::new(cfg);
        reloaded.restore("KRE", serde_json::from_str(&json).unwrap());
        let now = t0() + Duration::hours(2);
        assert_eq!(agg.index("KRE", now), reloaded.index("KRE", now));
    }

    #[test]
    fn bias_follows_weighted_direction() {
        let cfg = PressureCfg::default();
        let events = vec![
            ev(EvidenceKind::SweepFlow, Direction::Down, 1.0, t0()),
            ev(EvidenceKind::VolumeSurge, Direction::Up, 1.0, t0()),
        ];
        assert_eq!(compute_index(&events, t0(), &cfg).bias, Some(Direction::Down));
    }

    fn arb_kind() -> impl Strategy<Value = EvidenceKind> {
        prop_oneof![
            Just(EvidenceKind::SweepFlow),
            Just(EvidenceKind::PremiumSkew),
            Just(EvidenceKind::IvExpansion),
            Just(EvidenceKind::DarkPoolBlock),
            Just(EvidenceKind::SpreadStress),
        ]
    }

    proptest! {
        #[test]
        fn index_bounded_and_monotone(
            raw in proptest::collection::vec((arb_kind(), 0.0f64..=1.0, 0i64..600), 1..25),
            gap in 1i64..600,
        ) {
            let cfg = PressureCfg::default();
            let agg = PressureAggregator::new(cfg);
            let now = t0();
            for (kind, strength, mins_ago) in raw {
                let before = agg.index("KRE", now).value;
                agg.record(ev(kind, Direction::Up, strength, now - Duration::minutes(mins_ago)), now);
                let after = agg.index("KRE", now).value;
                prop_assert!((0.0..=1.0).contains(&after));
                prop_assert!(after + 1e-12 >= before);
            }
            let v0 = agg.index("KRE", now).value;
            let v1 = agg.index("KRE", now + Duration::minutes(gap)).value;
            prop_assert!(v1 <= v0 + 1e-12);
        }
    }
}
