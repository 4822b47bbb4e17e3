use crate::config::config::StructuralCfg;
use crate::core::types::{Direction, TelemetrySnapshot, clamp_unit, pct_change, to_f64};
use crate::pipeline::gate_pipeline::EntityStage;
use crate::pipeline::types::{GateResult, Handoffs, Signal, SignalHit, StageId, StructuralSignal};

/// Blocks when heavy opposing depth sits right at a structural level.
pub struct StructuralStage {
    cfg: StructuralCfg,
    neutral: f64,
}

impl StructuralStage {
    pub fn new(cfg: StructuralCfg, neutral: f64) -> Self {
        Self { cfg, neutral }
    }
}

impl EntityStage for StructuralStage {
    fn id(&self) -> StageId {
        StageId::Structural
    }

    fn evaluate(&self, snap: &TelemetrySnapshot, upstream: &Handoffs) -> GateResult {
        let (Some(bias), Some(bid_to_ask)) = (upstream.bias(), upstream.depth_ratio()) else {
            return GateResult::pass(StageId::Structural, self.neutral)
                .with_reason("no bias or depth ratio");
        };

        // Opposing side over bias side.
        let counter = match bias {
            Direction::Up => 1.0 / bid_to_ask,
            Direction::Down => bid_to_ask,
        };
        let level = snap
            .book
            .as_ref()
            .and_then(|b| b.nearest_level)
            .and_then(to_f64);
        let distance = snap
            .last_price()
            .zip(level)
            .and_then(|(last, level)| pct_change(level, last))
            .map(f64::abs);
        let near = distance.is_some_and(|d| d <= self.cfg.level_proximity_pct);
        let heavy = counter >= self.cfg.counter_pressure_ratio;

        let mut hits = Vec::new();
        if heavy {
            hits.push(SignalHit {
                signal: Signal::Structural(StructuralSignal::CounterPressure),
                strength: clamp_unit(counter / (2.0 * self.cfg.counter_pressure_ratio)),
            });
        }
        if near {
            hits.push(SignalHit {
                signal: Signal::Structural(StructuralSignal::NearLevel),
                strength: distance
                    .map(|d| clamp_unit(1.0 - d / self.cfg.level_proximity_pct.max(f64::EPSILON)))
                    .unwrap_or(0.0),
            });
        }

        if heavy && near {
            return GateResult::block(
                StageId::Structural,
                format!("counter-pressure {counter:.2}x at structural level"),
            )
            .with_signals(hits);
        }

        let pressure = clamp_unit(counter / self.cfg.counter_pressure_ratio.max(f64::EPSILON));
        let exposure = if near { 1.0 } else { 0.5 };
        GateResult::pass(StageId::Structural, 1.0 - pressure * exposure).with_signals(hits)
    }
}
