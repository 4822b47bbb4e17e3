//! Flow, tape and book stages.
//!
//! Each stage scans one metric family for a closed set of boolean signals.
//! True signals add their configured weight; the sum is capped and normalized,
//! and a stage that sees fewer than `min_signals` scores exactly zero.

use crate::config::config::{BookStageCfg, FlowStageCfg, TapeStageCfg};
use crate::core::types::{Direction, TelemetrySnapshot, clamp_unit, pct_change, to_f64};
use crate::pipeline::gate_pipeline::EntityStage;
use crate::pipeline::types::{
    BookSignal, FlowSignal, GateResult, HandoffFlag, Handoffs, Signal, SignalHit, StageId,
    TapeSignal,
};

/// `min(Σw, cap) / cap`, or 0 when fewer than `min_signals` are true.
pub fn capped_score(
    weights: impl IntoIterator<Item = f64>,
    true_count: usize,
    cap: f64,
    min_signals: usize,
) -> f64 {
    if true_count < min_signals || cap <= 0.0 {
        return 0.0;
    }
    let sum: f64 = weights.into_iter().sum();
    clamp_unit(sum.min(cap) / cap)
}

/// Strength of a ratio signal: 0.5 at the threshold, saturating at twice it.
fn strength(value: f64, threshold: f64) -> f64 {
    if threshold <= 0.0 {
        return 1.0;
    }
    clamp_unit(value / (2.0 * threshold))
}

/// `max / min`, infinite when only the larger side is non-zero.
fn dominance(a: f64, b: f64) -> Option<f64> {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if hi <= 0.0 {
        return None;
    }
    Some(if lo <= 0.0 { f64::INFINITY } else { hi / lo })
}

fn finish(
    stage: StageId,
    hits: Vec<SignalHit>,
    weight: impl Fn(Signal) -> f64,
    cap: f64,
    min_signals: usize,
) -> GateResult {
    let count = hits.len();
    let score = capped_score(hits.iter().map(|h| weight(h.signal)), count, cap, min_signals);
    let mut result = GateResult::pass(stage, score).with_signals(hits);
    if count > 0 && count < min_signals {
        result = result.with_reason(format!(
            "{count} signal(s) below minimum of {min_signals}"
        ));
    }
    result
}

pub struct FlowStage {
    cfg: FlowStageCfg,
}

impl FlowStage {
    pub fn new(cfg: FlowStageCfg) -> Self {
        Self { cfg }
    }

    fn weight(&self, signal: Signal) -> f64 {
        let w = &self.cfg.weights;
        match signal {
            Signal::Flow(FlowSignal::SweepCluster) => w.sweep_cluster,
            Signal::Flow(FlowSignal::PremiumSkew) => w.premium_skew,
            Signal::Flow(FlowSignal::IvExpansion) => w.iv_expansion,
            Signal::Flow(FlowSignal::OpenInterestBuild) => w.open_interest_build,
            _ => 0.0,
        }
    }
}

impl EntityStage for FlowStage {
    fn id(&self) -> StageId {
        StageId::Flow
    }

    fn min_signals(&self) -> usize {
        self.cfg.min_signals
    }

    fn evaluate(&self, snap: &TelemetrySnapshot, _upstream: &Handoffs) -> GateResult {
        let Some(flow) = snap.flow.as_ref() else {
            return GateResult::pass(StageId::Flow, 0.0).with_reason("flow data absent");
        };
        let c = &self.cfg;
        let mut hits = Vec::new();

        if let (Some(calls), Some(puts)) = (flow.call_sweeps, flow.put_sweeps) {
            let dominant = calls.max(puts);
            if dominant >= c.min_sweeps && calls != puts {
                hits.push(SignalHit {
                    signal: Signal::Flow(FlowSignal::SweepCluster),
                    strength: strength(dominant as f64, c.min_sweeps as f64),
                });
            }
        }

        let premiums = flow.call_premium.zip(flow.put_premium);
        if let Some(ratio) = premiums
            .and_then(|(call, put)| dominance(call, put))
            .filter(|r| *r >= c.skew_ratio)
        {
            hits.push(SignalHit {
                signal: Signal::Flow(FlowSignal::PremiumSkew),
                strength: strength(ratio, c.skew_ratio),
            });
        }

        if let Some(iv) = flow.iv_rank_change.filter(|iv| *iv >= c.iv_rank_jump) {
            hits.push(SignalHit {
                signal: Signal::Flow(FlowSignal::IvExpansion),
                strength: strength(iv, c.iv_rank_jump),
            });
        }

        if let Some(oi) = flow.oi_change_pct.filter(|oi| *oi >= c.oi_build_pct) {
            hits.push(SignalHit {
                signal: Signal::Flow(FlowSignal::OpenInterestBuild),
                strength: strength(oi, c.oi_build_pct),
            });
        }

        let mut result = finish(
            StageId::Flow,
            hits,
            |s| self.weight(s),
            c.cap,
            c.min_signals,
        );
        if let Some(direction) = premiums.and_then(|(call, put)| Direction::of(call - put)) {
            result = result.with_handoff(HandoffFlag::FlowBias { direction });
        }
        result
    }
}

pub struct TapeStage {
    cfg: TapeStageCfg,
}

impl TapeStage {
    pub fn new(cfg: TapeStageCfg) -> Self {
        Self { cfg }
    }

    fn weight(&self, signal: Signal) -> f64 {
        let w = &self.cfg.weights;
        match signal {
            Signal::Tape(TapeSignal::VolumeSurge) => w.volume_surge,
            Signal::Tape(TapeSignal::VwapRejection) => w.vwap_rejection,
            Signal::Tape(TapeSignal::DarkPoolBlock) => w.dark_pool_block,
            _ => 0.0,
        }
    }
}

impl EntityStage for TapeStage {
    fn id(&self) -> StageId {
        StageId::Tape
    }

    fn min_signals(&self) -> usize {
        self.cfg.min_signals
    }

    fn evaluate(&self, snap: &TelemetrySnapshot, _upstream: &Handoffs) -> GateResult {
        let Some(tape) = snap.tape.as_ref() else {
            return GateResult::pass(StageId::Tape, 0.0).with_reason("tape data absent");
        };
        let c = &self.cfg;
        let last = snap.last_price();
        let mut hits = Vec::new();

        if let (Some(vol), Some(avg)) = (tape.volume, tape.avg_volume.filter(|a| *a > 0)) {
            let multiple = vol as f64 / avg as f64;
            if multiple >= c.volume_multiple {
                hits.push(SignalHit {
                    signal: Signal::Tape(TapeSignal::VolumeSurge),
                    strength: strength(multiple, c.volume_multiple),
                });
            }
        }

        let vwap = tape.vwap.and_then(to_f64);
        if let Some(dist) = last
            .zip(vwap)
            .and_then(|(p, v)| pct_change(p, v))
            .filter(|d| d.abs() >= c.vwap_distance_pct)
        {
            hits.push(SignalHit {
                signal: Signal::Tape(TapeSignal::VwapRejection),
                strength: strength(dist.abs(), c.vwap_distance_pct),
            });
        }

        if let (Some(dark), Some(vol), Some(blocks)) = (
            tape.dark_pool_volume,
            tape.volume.filter(|v| *v > 0),
            tape.block_prints,
        ) {
            let share = dark as f64 / vol as f64;
            if share >= c.dark_pool_share && blocks >= c.min_block_prints {
                hits.push(SignalHit {
                    signal: Signal::Tape(TapeSignal::DarkPoolBlock),
                    strength: strength(share, c.dark_pool_share),
                });
            }
        }

        let mut result = finish(
            StageId::Tape,
            hits,
            |s| self.weight(s),
            c.cap,
            c.min_signals,
        );

        let prev_close = tape.prev_close.and_then(to_f64);
        if let Some(from_prev_close_pct) = last.zip(prev_close).and_then(|(p, b)| pct_change(p, b))
        {
            let from_open_pct = tape
                .session_open
                .and_then(to_f64)
                .zip(last)
                .and_then(|(open, p)| pct_change(p, open));
            result = result.with_handoff(HandoffFlag::MoveExtension {
                from_prev_close_pct,
                from_open_pct,
            });
        }
        result
    }
}

pub struct BookStage {
    cfg: BookStageCfg,
}

impl BookStage {
    pub fn new(cfg: BookStageCfg) -> Self {
        Self { cfg }
    }

    fn weight(&self, signal: Signal) -> f64 {
        match signal {
            Signal::Book(BookSignal::SpreadWidening) => self.cfg.weights.spread_widening,
            Signal::Book(BookSignal::DepthImbalance) => self.cfg.weights.depth_imbalance,
            _ => 0.0,
        }
    }
}

impl EntityStage for BookStage {
    fn id(&self) -> StageId {
        StageId::Book
    }

    fn min_signals(&self) -> usize {
        self.cfg.min_signals
    }

    fn evaluate(&self, snap: &TelemetrySnapshot, _upstream: &Handoffs) -> GateResult {
        let Some(book) = snap.book.as_ref() else {
            return GateResult::pass(StageId::Book, 0.0).with_reason("book data absent");
        };
        let c = &self.cfg;
        let mut hits = Vec::new();

        if let (Some(spread), Some(base)) = (
            book.spread_bps,
            book.baseline_spread_bps.filter(|b| *b > 0.0),
        ) {
            let ratio = spread / base;
            if ratio >= c.spread_widening_ratio {
                hits.push(SignalHit {
                    signal: Signal::Book(BookSignal::SpreadWidening),
                    strength: strength(ratio, c.spread_widening_ratio),
                });
            }
        }

        let depths = book.bid_depth.zip(book.ask_depth);
        if let Some(ratio) = depths
            .and_then(|(bid, ask)| dominance(bid, ask))
            .filter(|r| *r >= c.depth_imbalance_ratio)
        {
            hits.push(SignalHit {
                signal: Signal::Book(BookSignal::DepthImbalance),
                strength: strength(ratio, c.depth_imbalance_ratio),
            });
        }

        let mut result = finish(
            StageId::Book,
            hits,
            |s| self.weight(s),
            c.cap,
            c.min_signals,
        );
        if let Some((bid, ask)) = depths.filter(|(bid, ask)| *bid > 0.0 && *ask > 0.0) {
            result = result.with_handoff(HandoffFlag::DepthRatio {
                bid_to_ask: bid / ask,
            });
        }
        result
    }
}
