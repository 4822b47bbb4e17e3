use crate::config::config::EntryTimingCfg;
use crate::core::types::{TelemetrySnapshot, clamp_unit};
use crate::pipeline::gate_pipeline::EntityStage;
use crate::pipeline::types::{GateResult, Handoffs, Signal, SignalHit, StageId, TimingSignal};

/// Blocks entities whose move in the bias direction is already spent.
pub struct EntryTimingStage {
    cfg: EntryTimingCfg,
    neutral: f64,
}

impl EntryTimingStage {
    pub fn new(cfg: EntryTimingCfg, neutral: f64) -> Self {
        Self { cfg, neutral }
    }
}

impl EntityStage for EntryTimingStage {
    fn id(&self) -> StageId {
        StageId::EntryTiming
    }

    fn evaluate(&self, _snap: &TelemetrySnapshot, upstream: &Handoffs) -> GateResult {
        let (Some(bias), Some((from_prev_close, from_open))) =
            (upstream.bias(), upstream.move_extension())
        else {
            return GateResult::pass(StageId::EntryTiming, self.neutral)
                .with_reason("no bias or move extension to time");
        };

        let sign = bias.sign();
        let materialized = from_open
            .map(|open| (open * sign).max(from_prev_close * sign))
            .unwrap_or(from_prev_close * sign);
        let limit = self.cfg.max_materialized_move_pct;

        if materialized >= limit {
            return GateResult::block(
                StageId::EntryTiming,
                format!("{materialized:.2}% already moved {bias:?}, limit {limit:.2}%"),
            )
            .with_signals(vec![SignalHit {
                signal: Signal::Timing(TimingSignal::MoveMaterialized),
                strength: 1.0,
            }]);
        }

        let used = if limit > 0.0 {
            clamp_unit(materialized.max(0.0) / limit)
        } else {
            1.0
        };
        GateResult::pass(StageId::EntryTiming, 1.0 - used)
    }
}
