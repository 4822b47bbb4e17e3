use crate::config::config::RegimeCfg;
use crate::core::error::CycleError;
use crate::core::types::{RegimeSnapshot, clamp_unit};
use crate::pipeline::evidence::capped_score;
use crate::pipeline::types::{GateResult, RegimeSignal, Signal, SignalHit, StageId};

/// Global market-conditions gate. Evaluated once per cycle.
pub struct RegimeGate {
    cfg: RegimeCfg,
}

impl RegimeGate {
    pub fn new(cfg: RegimeCfg) -> Self {
        Self { cfg }
    }

    /// Calm conditions score high. Missing benchmark or volatility data is fatal.
    pub fn evaluate(&self, snap: &RegimeSnapshot) -> Result<GateResult, CycleError> {
        let change = snap.benchmark_change_pct.ok_or_else(|| {
            CycleError::RegimeGateFailure("benchmark change missing".to_string())
        })?;
        let vol = snap.volatility_level.ok_or_else(|| {
            CycleError::RegimeGateFailure("volatility level missing".to_string())
        })?;
        if !change.is_finite() || !vol.is_finite() {
            return Err(CycleError::RegimeGateFailure(format!(
                "non-finite regime data: change={change} vol={vol}"
            )));
        }

        if change <= self.cfg.crash_change_pct {
            return Ok(GateResult::block(
                StageId::Regime,
                format!(
                    "benchmark {change:.2}% at or below crash threshold {:.2}%",
                    self.cfg.crash_change_pct
                ),
            ));
        }
        if vol >= self.cfg.panic_volatility {
            return Ok(GateResult::block(
                StageId::Regime,
                format!(
                    "volatility {vol:.1} at or above panic level {:.1}",
                    self.cfg.panic_volatility
                ),
            ));
        }

        let mut hits = Vec::new();
        if change <= self.cfg.drawdown_change_pct {
            hits.push(SignalHit {
                signal: Signal::Regime(RegimeSignal::BenchmarkDrawdown),
                strength: clamp_unit(change / self.cfg.crash_change_pct),
            });
        }
        if snap
            .volatility_change_pct
            .is_some_and(|vc| vc >= self.cfg.spike_change_pct)
        {
            hits.push(SignalHit {
                signal: Signal::Regime(RegimeSignal::VolatilitySpike),
                strength: clamp_unit(vol / self.cfg.panic_volatility),
            });
        }
        if let Some(breadth) = snap
            .breadth_ratio
            .filter(|b| *b <= self.cfg.breadth_collapse_ratio)
        {
            hits.push(SignalHit {
                signal: Signal::Regime(RegimeSignal::BreadthCollapse),
                strength: clamp_unit(1.0 - breadth),
            });
        }

        let w = &self.cfg.weights;
        let stress = capped_score(
            hits.iter().map(|h| match h.signal {
                Signal::Regime(RegimeSignal::BenchmarkDrawdown) => w.benchmark_drawdown,
                Signal::Regime(RegimeSignal::VolatilitySpike) => w.volatility_spike,
                Signal::Regime(RegimeSignal::BreadthCollapse) => w.breadth_collapse,
                _ => 0.0,
            }),
            hits.len(),
            self.cfg.cap,
            0,
        );

        let mut result = GateResult::pass(StageId::Regime, 1.0 - stress).with_signals(hits);
        if stress > 0.0 {
            result = result.with_reason(format!("regime stress {stress:.2}"));
        }
        Ok(result)
    }
}
