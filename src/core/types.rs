use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

#[async_trait::async_trait]
pub trait Actor: Send + Sync + 'static {
    async fn run(self) -> Result<()>;
}

pub type EntityId = String;

// ----------- Universe -----------------

/// Priority classification. Drives the scheduler cooldown length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTier {
    Hot,
    Warm,
    Cold,
}

impl PriorityTier {
    /// Lower ranks are admitted first.
    pub fn rank(self) -> u8 {
        match self {
            PriorityTier::Hot => 0,
            PriorityTier::Warm => 1,
            PriorityTier::Cold => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub sector: String,
    pub tier: PriorityTier,
}

impl Entity {
    pub fn new(id: impl Into<String>, sector: impl Into<String>, tier: PriorityTier) -> Self {
        Self {
            id: id.into(),
            sector: sector.into(),
            tier,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn sign(self) -> f64 {
        match self {
            Direction::Up => 1.0,
            Direction::Down => -1.0,
        }
    }

    /// Direction of a signed value; `None` for zero or NaN.
    pub fn of(value: f64) -> Option<Direction> {
        if value > 0.0 {
            Some(Direction::Up)
        } else if value < 0.0 {
            Some(Direction::Down)
        } else {
            None
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }
}

// ----------- Telemetry -----------------

/// Metric families a single fetch can cover. Ordered by fetch priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Quote,
    Tape,
    Flow,
    Book,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::Quote,
        MetricKind::Tape,
        MetricKind::Flow,
        MetricKind::Book,
    ];
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchSpec {
    pub metrics: Vec<MetricKind>,
}

impl FetchSpec {
    pub fn full() -> Self {
        Self {
            metrics: MetricKind::ALL.to_vec(),
        }
    }

    /// Keeps the first `burst` metric families. A burst of zero still fetches the quote.
    pub fn limited_to(burst: u32) -> Self {
        let n = (burst.max(1) as usize).min(MetricKind::ALL.len());
        Self {
            metrics: MetricKind::ALL[..n].to_vec(),
        }
    }

    pub fn wants(&self, metric: MetricKind) -> bool {
        self.metrics.contains(&metric)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub bid_size: Decimal,
    pub ask_size: Decimal,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TapeAggregates {
    #[serde(default)]
    pub prev_close: Option<Decimal>,
    #[serde(default)]
    pub session_open: Option<Decimal>,
    #[serde(default)]
    pub vwap: Option<Decimal>,
    #[serde(default)]
    pub volume: Option<u64>,
    #[serde(default)]
    pub avg_volume: Option<u64>,
    #[serde(default)]
    pub dark_pool_volume: Option<u64>,
    #[serde(default)]
    pub block_prints: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowAggregates {
    #[serde(default)]
    pub call_premium: Option<f64>,
    #[serde(default)]
    pub put_premium: Option<f64>,
    #[serde(default)]
    pub call_sweeps: Option<u32>,
    #[serde(default)]
    pub put_sweeps: Option<u32>,
    /// Change in IV rank since the previous session, in points.
    #[serde(default)]
    pub iv_rank_change: Option<f64>,
    /// Open interest change since the previous session, in percent.
    #[serde(default)]
    pub oi_change_pct: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BookAggregates {
    #[serde(default)]
    pub spread_bps: Option<f64>,
    #[serde(default)]
    pub baseline_spread_bps: Option<f64>,
    #[serde(default)]
    pub bid_depth: Option<f64>,
    #[serde(default)]
    pub ask_depth: Option<f64>,
    /// Nearest structural price level (support below, resistance above).
    #[serde(default)]
    pub nearest_level: Option<Decimal>,
}

/// Immutable bundle of one entity's telemetry. Consumed by exactly one pipeline run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub entity: EntityId,
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub quote: Option<Quote>,
    #[serde(default)]
    pub tape: Option<TapeAggregates>,
    #[serde(default)]
    pub flow: Option<FlowAggregates>,
    #[serde(default)]
    pub book: Option<BookAggregates>,
}

impl TelemetrySnapshot {
    pub fn empty(entity: impl Into<String>, taken_at: DateTime<Utc>) -> Self {
        Self {
            entity: entity.into(),
            taken_at,
            quote: None,
            tape: None,
            flow: None,
            book: None,
        }
    }

    pub fn last_price(&self) -> Option<f64> {
        self.quote.as_ref().and_then(|q| to_f64(q.last))
    }

    pub fn has(&self, metric: MetricKind) -> bool {
        match metric {
            MetricKind::Quote => self.quote.is_some(),
            MetricKind::Tape => self.tape.is_some(),
            MetricKind::Flow => self.flow.is_some(),
            MetricKind::Book => self.book.is_some(),
        }
    }
}

/// Index-level telemetry, fetched once per cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub benchmark_change_pct: Option<f64>,
    #[serde(default)]
    pub volatility_level: Option<f64>,
    #[serde(default)]
    pub volatility_change_pct: Option<f64>,
    #[serde(default)]
    pub breadth_ratio: Option<f64>,
}

// ----------- Evidence -----------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    SweepFlow,
    PremiumSkew,
    IvExpansion,
    OpenInterestBuild,
    DarkPoolBlock,
    VolumeSurge,
    VwapRejection,
    SpreadStress,
    BookImbalance,
}

/// A single detected condition. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEvent {
    pub entity: EntityId,
    pub kind: EvidenceKind,
    pub direction: Direction,
    pub strength: f64,
    pub detected_at: DateTime<Utc>,
}

impl EvidenceEvent {
    pub fn new(
        entity: impl Into<String>,
        kind: EvidenceKind,
        direction: Direction,
        strength: f64,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            entity: entity.into(),
            kind,
            direction,
            strength: clamp_unit(strength),
            detected_at,
        }
    }
}

pub fn to_f64(d: Decimal) -> Option<f64> {
    d.to_f64()
}

/// Clamp into [0, 1]; NaN maps to 0.
pub fn clamp_unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

/// Percent change from `base` to `value`. `None` when base is zero.
pub fn pct_change(value: f64, base: f64) -> Option<f64> {
    if base == 0.0 || !base.is_finite() || !value.is_finite() {
        return None;
    }
    Some((value - base) / base * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_spec_respects_burst() {
        assert_eq!(FetchSpec::limited_to(2).metrics, vec![MetricKind::Quote, MetricKind::Tape]);
        assert_eq!(FetchSpec::limited_to(0).metrics, vec![MetricKind::Quote]);
        assert_eq!(FetchSpec::limited_to(9), FetchSpec::full());
    }

    #[test]
    fn evidence_strength_is_clamped() {
        let ev = EvidenceEvent::new("X", EvidenceKind::SweepFlow, Direction::Down, 1.7, Utc::now());
        assert_eq!(ev.strength, 1.0);
        let ev = EvidenceEvent::new("X", EvidenceKind::SweepFlow, Direction::Down, f64::NAN, Utc::now());
        assert_eq!(ev.strength, 0.0);
    }

    #[test]
    fn direction_of_signed_values() {
        assert_eq!(Direction::of(0.4), Some(Direction::Up));
        assert_eq!(Direction::of(-0.1), Some(Direction::Down));
        assert_eq!(Direction::of(0.0), None);
        assert_eq!(pct_change(99.0, 100.0), Some(-1.0));
        assert_eq!(pct_change(1.0, 0.0), None);
    }
}
