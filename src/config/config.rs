use crate::core::types::{Entity, PriorityTier};
use crate::pressure::aggregator::PressureLevel;
use anyhow::{Context, Result};
use chrono::{NaiveTime, Timelike};
use config::{Config, File};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppCfg {
    pub cycle: CycleCfg,
    pub source: SourceCfg,
    pub scheduler: SchedulerCfg,
    pub pipeline: PipelineCfg,
    pub scoring: ScoringCfg,
    pub pressure: PressureCfg,
    pub confirmation: ConfirmationCfg,
    pub alert: AlertCfg,
    pub store: StoreCfg,
    pub universe: Vec<Entity>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct CycleCfg {
    #[serde(with = "humantime_serde")]
    pub cadence: Duration,
    /// Maximum in-flight adapter calls per cycle.
    pub concurrency: usize,
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
}

impl Default for CycleCfg {
    fn default() -> Self {
        Self {
            cadence: Duration::from_secs(300),
            concurrency: 8,
            fetch_timeout: Duration::from_secs(4),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct SourceCfg {
    /// Provider call-rate ceiling.
    pub rate_limit_per_minute: u32,
}

impl Default for SourceCfg {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerCfg {
    pub session_open: NaiveTime,
    pub utc_offset_minutes: i32,
    #[serde(with = "humantime_serde")]
    pub window_length: Duration,
    pub window_count: u32,
    /// Grants available per window, across all entities.
    pub window_budget: u32,
    /// Metric families one grant may fetch.
    pub burst_allowance: u32,
    /// Consecutive budget denials before an entity is escalated.
    pub starvation_cycles: u32,
    pub cooldowns: TierCooldowns,
}

impl Default for SchedulerCfg {
    fn default() -> Self {
        Self {
            session_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            utc_offset_minutes: -300,
            window_length: Duration::from_secs(30 * 60),
            window_count: 13,
            window_budget: 40,
            burst_allowance: 4,
            starvation_cycles: 3,
            cooldowns: TierCooldowns::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TierCooldowns {
    #[serde(with = "humantime_serde")]
    pub hot: Duration,
    #[serde(with = "humantime_serde")]
    pub warm: Duration,
    #[serde(with = "humantime_serde")]
    pub cold: Duration,
}

impl Default for TierCooldowns {
    fn default() -> Self {
        Self {
            hot: Duration::from_secs(5 * 60),
            warm: Duration::from_secs(15 * 60),
            cold: Duration::from_secs(60 * 60),
        }
    }
}

impl TierCooldowns {
    pub fn for_tier(&self, tier: PriorityTier) -> Duration {
        match tier {
            PriorityTier::Hot => self.hot,
            PriorityTier::Warm => self.warm,
            PriorityTier::Cold => self.cold,
        }
    }
}

// ---------- Pipeline ----------

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineCfg {
    /// Sub-score used by entity stages when no snapshot could be fetched.
    pub neutral_sub_score: f64,
    pub regime: RegimeCfg,
    pub flow: FlowStageCfg,
    pub tape: TapeStageCfg,
    pub book: BookStageCfg,
    pub entry_timing: EntryTimingCfg,
    pub structural: StructuralCfg,
}

impl Default for PipelineCfg {
    fn default() -> Self {
        Self {
            neutral_sub_score: 0.0,
            regime: RegimeCfg::default(),
            flow: FlowStageCfg::default(),
            tape: TapeStageCfg::default(),
            book: BookStageCfg::default(),
            entry_timing: EntryTimingCfg::default(),
            structural: StructuralCfg::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct RegimeCfg {
    /// Benchmark change at or below which the whole cycle is blocked.
    pub crash_change_pct: f64,
    /// Volatility level at or above which the whole cycle is blocked.
    pub panic_volatility: f64,
    pub drawdown_change_pct: f64,
    pub spike_change_pct: f64,
    pub breadth_collapse_ratio: f64,
    pub cap: f64,
    pub weights: RegimeWeights,
}

impl Default for RegimeCfg {
    fn default() -> Self {
        Self {
            crash_change_pct: -3.0,
            panic_volatility: 40.0,
            drawdown_change_pct: -1.0,
            spike_change_pct: 10.0,
            breadth_collapse_ratio: 0.3,
            cap: 1.0,
            weights: RegimeWeights::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct RegimeWeights {
    pub benchmark_drawdown: f64,
    pub volatility_spike: f64,
    pub breadth_collapse: f64,
}

impl Default for RegimeWeights {
    fn default() -> Self {
        Self {
            benchmark_drawdown: 0.40,
            volatility_spike: 0.35,
            breadth_collapse: 0.25,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowStageCfg {
    pub cap: f64,
    pub min_signals: usize,
    pub weights: FlowWeights,
    pub min_sweeps: u32,
    /// Dominant-side premium over the other side.
    pub skew_ratio: f64,
    pub iv_rank_jump: f64,
    pub oi_build_pct: f64,
}

impl Default for FlowStageCfg {
    fn default() -> Self {
        Self {
            cap: 1.0,
            min_signals: 2,
            weights: FlowWeights::default(),
            min_sweeps: 3,
            skew_ratio: 2.0,
            iv_rank_jump: 5.0,
            oi_build_pct: 10.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct FlowWeights {
    pub sweep_cluster: f64,
    pub premium_skew: f64,
    pub iv_expansion: f64,
    pub open_interest_build: f64,
}

impl Default for FlowWeights {
    fn default() -> Self {
        Self {
            sweep_cluster: 0.35,
            premium_skew: 0.30,
            iv_expansion: 0.20,
            open_interest_build: 0.15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct TapeStageCfg {
    pub cap: f64,
    pub min_signals: usize,
    pub weights: TapeWeights,
    /// Session volume over average volume.
    pub volume_multiple: f64,
    pub vwap_distance_pct: f64,
    /// Dark-pool share of session volume.
    pub dark_pool_share: f64,
    pub min_block_prints: u32,
}

impl Default for TapeStageCfg {
    fn default() -> Self {
        Self {
            cap: 1.0,
            min_signals: 2,
            weights: TapeWeights::default(),
            volume_multiple: 1.5,
            vwap_distance_pct: 0.3,
            dark_pool_share: 0.35,
            min_block_prints: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct TapeWeights {
    pub volume_surge: f64,
    pub vwap_rejection: f64,
    pub dark_pool_block: f64,
}

impl Default for TapeWeights {
    fn default() -> Self {
        Self {
            volume_surge: 0.40,
            vwap_rejection: 0.30,
            dark_pool_block: 0.30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct BookStageCfg {
    pub cap: f64,
    pub min_signals: usize,
    pub weights: BookWeights,
    pub spread_widening_ratio: f64,
    pub depth_imbalance_ratio: f64,
}

impl Default for BookStageCfg {
    fn default() -> Self {
        Self {
            cap: 1.0,
            min_signals: 1,
            weights: BookWeights::default(),
            spread_widening_ratio: 1.5,
            depth_imbalance_ratio: 2.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct BookWeights {
    pub spread_widening: f64,
    pub depth_imbalance: f64,
}

impl Default for BookWeights {
    fn default() -> Self {
        Self {
            spread_widening: 0.5,
            depth_imbalance: 0.5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct EntryTimingCfg {
    /// Move in the bias direction past which the opportunity is considered gone.
    pub max_materialized_move_pct: f64,
}

impl Default for EntryTimingCfg {
    fn default() -> Self {
        Self {
            max_materialized_move_pct: 3.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct StructuralCfg {
    pub enabled: bool,
    /// Opposing-side depth over bias-side depth that counts as strong counter-pressure.
    pub counter_pressure_ratio: f64,
    pub level_proximity_pct: f64,
}

impl Default for StructuralCfg {
    fn default() -> Self {
        Self {
            enabled: true,
            counter_pressure_ratio: 3.0,
            level_proximity_pct: 0.5,
        }
    }
}

// ---------- Scoring ----------

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringCfg {
    pub weights: StageWeights,
    pub tiers: TierThresholds,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct StageWeights {
    pub regime: f64,
    pub flow: f64,
    pub tape: f64,
    pub book: f64,
    pub entry_timing: f64,
    pub structural: f64,
}

impl Default for StageWeights {
    fn default() -> Self {
        Self {
            regime: 0.10,
            flow: 0.30,
            tape: 0.20,
            book: 0.10,
            entry_timing: 0.15,
            structural: 0.15,
        }
    }
}

impl StageWeights {
    pub fn total(&self) -> f64 {
        self.regime + self.flow + self.tape + self.book + self.entry_timing + self.structural
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct TierThresholds {
    pub monitor: f64,
    pub watchlist: f64,
    pub actionable: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            monitor: 0.35,
            watchlist: 0.55,
            actionable: 0.75,
        }
    }
}

// ---------- Pressure ----------

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct PressureCfg {
    /// Exponential decay rate λ, per hour.
    pub decay_per_hour: f64,
    /// Diversity coefficient k.
    pub diversity_coefficient: f64,
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub base_weights: EvidenceWeights,
    pub levels: PressureThresholds,
}

impl Default for PressureCfg {
    fn default() -> Self {
        Self {
            decay_per_hour: 0.10,
            diversity_coefficient: 0.15,
            ttl: Duration::from_secs(72 * 3600),
            base_weights: EvidenceWeights::default(),
            levels: PressureThresholds::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct EvidenceWeights {
    pub sweep_flow: f64,
    pub premium_skew: f64,
    pub iv_expansion: f64,
    pub open_interest_build: f64,
    pub dark_pool_block: f64,
    pub volume_surge: f64,
    pub vwap_rejection: f64,
    pub spread_stress: f64,
    pub book_imbalance: f64,
}

impl Default for EvidenceWeights {
    fn default() -> Self {
        Self {
            sweep_flow: 0.30,
            premium_skew: 0.25,
            iv_expansion: 0.15,
            open_interest_build: 0.15,
            dark_pool_block: 0.25,
            volume_surge: 0.15,
            vwap_rejection: 0.15,
            spread_stress: 0.10,
            book_imbalance: 0.10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct PressureThresholds {
    pub watch: f64,
    pub prepare: f64,
    pub act: f64,
}

impl Default for PressureThresholds {
    fn default() -> Self {
        Self {
            watch: 0.25,
            prepare: 0.50,
            act: 0.75,
        }
    }
}

// ---------- Confirmation / alerts ----------

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfirmationCfg {
    /// Checkpoint time relative to session open.
    #[serde(with = "humantime_serde")]
    pub checkpoint_offset: Duration,
    /// How long a Pending case may wait for a fresh observation past the checkpoint.
    #[serde(with = "humantime_serde")]
    pub checkpoint_grace: Duration,
    pub arm_level: PressureLevel,
    pub min_gap_pct: f64,
    pub urgent_spread_ratio: f64,
}

impl Default for ConfirmationCfg {
    fn default() -> Self {
        Self {
            checkpoint_offset: Duration::from_secs(15 * 60),
            checkpoint_grace: Duration::from_secs(45 * 60),
            arm_level: PressureLevel::Prepare,
            min_gap_pct: 0.3,
            urgent_spread_ratio: 2.0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct AlertCfg {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    pub delta_threshold: f64,
    pub min_distinct_kinds: usize,
    pub dedup_capacity: usize,
}

impl Default for AlertCfg {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60 * 60),
            delta_threshold: 0.25,
            min_distinct_kinds: 2,
            dedup_capacity: 4096,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreCfg {
    /// Postgres connection string. In-memory store when absent.
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
        }
    }
}

/// std -> chrono duration, saturating.
pub fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn unit(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

impl AppCfg {
    pub fn load(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("building config")?;

        let app: AppCfg = cfg.try_deserialize().context("deserializing config")?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.cycle.concurrency > 0, "cycle.concurrency must be > 0");
        anyhow::ensure!(
            self.cycle.concurrency as u64 <= self.source.rate_limit_per_minute as u64,
            "cycle.concurrency ({}) must not exceed source.rateLimitPerMinute ({})",
            self.cycle.concurrency,
            self.source.rate_limit_per_minute
        );
        anyhow::ensure!(
            !self.cycle.fetch_timeout.is_zero(),
            "cycle.fetchTimeout must be > 0"
        );

        let s = &self.scheduler;
        anyhow::ensure!(s.window_count > 0, "scheduler.windowCount must be > 0");
        anyhow::ensure!(
            !s.window_length.is_zero(),
            "scheduler.windowLength must be > 0"
        );
        let session_span = s
            .window_length
            .checked_mul(s.window_count)
            .unwrap_or(Duration::MAX);
        let open = Duration::from_secs(s.session_open.num_seconds_from_midnight() as u64);
        anyhow::ensure!(
            open.saturating_add(session_span) <= Duration::from_secs(24 * 3600),
            "scheduler windows must end by local midnight (sessionOpen {} + {} x {:?})",
            s.session_open,
            s.window_count,
            s.window_length
        );
        anyhow::ensure!(s.window_budget > 0, "scheduler.windowBudget must be > 0");
        anyhow::ensure!(
            s.utc_offset_minutes.abs() < 24 * 60,
            "scheduler.utcOffsetMinutes out of range"
        );

        let p = &self.pipeline;
        anyhow::ensure!(unit(p.neutral_sub_score), "pipeline.neutralSubScore must be in [0,1]");
        for (name, cap) in [
            ("regime", p.regime.cap),
            ("flow", p.flow.cap),
            ("tape", p.tape.cap),
            ("book", p.book.cap),
        ] {
            anyhow::ensure!(cap > 0.0 && cap <= 1.0, "pipeline.{name}.cap must be in (0,1]");
        }
        anyhow::ensure!(
            p.entry_timing.max_materialized_move_pct > 0.0,
            "pipeline.entryTiming.maxMaterializedMovePct must be > 0"
        );

        let w = &self.scoring.weights;
        for v in [w.regime, w.flow, w.tape, w.book, w.entry_timing, w.structural] {
            anyhow::ensure!(v >= 0.0, "scoring.weights must be non-negative");
        }
        anyhow::ensure!(
            (w.total() - 1.0).abs() < WEIGHT_TOLERANCE,
            "scoring.weights must sum to 1.0 (got {})",
            w.total()
        );
        anyhow::ensure!(
            p.structural.enabled || w.structural == 0.0,
            "scoring.weights.structural must be 0 when the structural stage is disabled"
        );
        let t = &self.scoring.tiers;
        anyhow::ensure!(
            0.0 < t.monitor && t.monitor <= t.watchlist && t.watchlist <= t.actionable && t.actionable <= 1.0,
            "scoring.tiers must be ordered within (0,1]"
        );

        let pr = &self.pressure;
        anyhow::ensure!(pr.decay_per_hour >= 0.0, "pressure.decayPerHour must be >= 0");
        anyhow::ensure!(
            pr.diversity_coefficient >= 0.0,
            "pressure.diversityCoefficient must be >= 0"
        );
        anyhow::ensure!(!pr.ttl.is_zero(), "pressure.ttl must be > 0");
        let l = &pr.levels;
        anyhow::ensure!(
            0.0 < l.watch && l.watch <= l.prepare && l.prepare <= l.act && l.act <= 1.0,
            "pressure.levels must be ordered within (0,1]"
        );

        anyhow::ensure!(
            self.alert.min_distinct_kinds >= 1,
            "alert.minDistinctKinds must be >= 1"
        );
        anyhow::ensure!(self.alert.dedup_capacity > 0, "alert.dedupCapacity must be > 0");
        anyhow::ensure!(!self.alert.window.is_zero(), "alert.window must be > 0");

        let mut seen = HashSet::new();
        for e in &self.universe {
            anyhow::ensure!(!e.id.is_empty(), "universe entries need an id");
            anyhow::ensure!(seen.insert(&e.id), "duplicate universe entity {}", e.id);
        }
        Ok(())
    }
}
