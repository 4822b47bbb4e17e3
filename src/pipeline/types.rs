use crate::core::types::{Direction, EntityId, EvidenceEvent, EvidenceKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    Regime,
    Flow,
    Tape,
    Book,
    EntryTiming,
    Structural,
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StageId::Regime => "regime",
            StageId::Flow => "flow",
            StageId::Tape => "tape",
            StageId::Book => "book",
            StageId::EntryTiming => "entry_timing",
            StageId::Structural => "structural",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Block,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RegimeSignal {
    BenchmarkDrawdown,
    VolatilitySpike,
    BreadthCollapse,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowSignal {
    SweepCluster,
    PremiumSkew,
    IvExpansion,
    OpenInterestBuild,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TapeSignal {
    VolumeSurge,
    VwapRejection,
    DarkPoolBlock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BookSignal {
    SpreadWidening,
    DepthImbalance,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimingSignal {
    MoveMaterialized,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StructuralSignal {
    CounterPressure,
    NearLevel,
}

/// Closed set of signals, one family per stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "stage", content = "signal", rename_all = "snake_case")]
pub enum Signal {
    Regime(RegimeSignal),
    Flow(FlowSignal),
    Tape(TapeSignal),
    Book(BookSignal),
    Timing(TimingSignal),
    Structural(StructuralSignal),
}

impl Signal {
    /// Evidence kind recorded when an evidence stage fires this signal.
    pub fn evidence_kind(self) -> Option<EvidenceKind> {
        match self {
            Signal::Flow(FlowSignal::SweepCluster) => Some(EvidenceKind::SweepFlow),
            Signal::Flow(FlowSignal::PremiumSkew) => Some(EvidenceKind::PremiumSkew),
            Signal::Flow(FlowSignal::IvExpansion) => Some(EvidenceKind::IvExpansion),
            Signal::Flow(FlowSignal::OpenInterestBuild) => Some(EvidenceKind::OpenInterestBuild),
            Signal::Tape(TapeSignal::VolumeSurge) => Some(EvidenceKind::VolumeSurge),
            Signal::Tape(TapeSignal::VwapRejection) => Some(EvidenceKind::VwapRejection),
            Signal::Tape(TapeSignal::DarkPoolBlock) => Some(EvidenceKind::DarkPoolBlock),
            Signal::Book(BookSignal::SpreadWidening) => Some(EvidenceKind::SpreadStress),
            Signal::Book(BookSignal::DepthImbalance) => Some(EvidenceKind::BookImbalance),
            Signal::Regime(_) | Signal::Timing(_) | Signal::Structural(_) => None,
        }
    }
}

/// A true signal and its measured strength in [0, 1].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalHit {
    pub signal: Signal,
    pub strength: f64,
}

/// Typed facts a stage hands to later stages. The only cross-stage input.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "flag", rename_all = "snake_case")]
pub enum HandoffFlag {
    FlowBias {
        direction: Direction,
    },
    MoveExtension {
        from_prev_close_pct: f64,
        from_open_pct: Option<f64>,
    },
    DepthRatio {
        bid_to_ask: f64,
    },
}

/// Accumulated handoffs from the stages evaluated so far.
#[derive(Clone, Debug, Default)]
pub struct Handoffs(Vec<HandoffFlag>);

impl Handoffs {
    pub fn extend(&mut self, flags: &[HandoffFlag]) {
        self.0.extend_from_slice(flags);
    }

    pub fn flow_bias(&self) -> Option<Direction> {
        self.0.iter().find_map(|f| match f {
            HandoffFlag::FlowBias { direction } => Some(*direction),
            _ => None,
        })
    }

    /// `(from_prev_close_pct, from_open_pct)`
    pub fn move_extension(&self) -> Option<(f64, Option<f64>)> {
        self.0.iter().find_map(|f| match f {
            HandoffFlag::MoveExtension {
                from_prev_close_pct,
                from_open_pct,
            } => Some((*from_prev_close_pct, *from_open_pct)),
            _ => None,
        })
    }

    pub fn depth_ratio(&self) -> Option<f64> {
        self.0.iter().find_map(|f| match f {
            HandoffFlag::DepthRatio { bid_to_ask } => Some(*bid_to_ask),
            _ => None,
        })
    }

    /// Flow bias, else the direction the tape has already moved.
    pub fn bias(&self) -> Option<Direction> {
        self.flow_bias()
            .or_else(|| self.move_extension().and_then(|(pct, _)| Direction::of(pct)))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub stage: StageId,
    pub verdict: Verdict,
    pub sub_score: f64,
    pub signals: Vec<SignalHit>,
    pub reasons: Vec<String>,
    #[serde(default)]
    pub handoffs: Vec<HandoffFlag>,
}

impl GateResult {
    pub fn pass(stage: StageId, sub_score: f64) -> Self {
        Self {
            stage,
            verdict: Verdict::Pass,
            sub_score: crate::core::types::clamp_unit(sub_score),
            signals: Vec::new(),
            reasons: Vec::new(),
            handoffs: Vec::new(),
        }
    }

    pub fn block(stage: StageId, reason: impl Into<String>) -> Self {
        Self {
            stage,
            verdict: Verdict::Block,
            sub_score: 0.0,
            signals: Vec::new(),
            reasons: vec![reason.into()],
            handoffs: Vec::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reasons.push(reason.into());
        self
    }

    pub fn with_signals(mut self, mut signals: Vec<SignalHit>) -> Self {
        signals.sort_by(|a, b| a.signal.cmp(&b.signal));
        self.signals = signals;
        self
    }

    pub fn with_handoff(mut self, flag: HandoffFlag) -> Self {
        self.handoffs.push(flag);
        self
    }

    pub fn is_block(&self) -> bool {
        self.verdict == Verdict::Block
    }

    pub fn has(&self, signal: Signal) -> bool {
        self.signals.iter().any(|h| h.signal == signal)
    }
}

/// Everything the pipeline produced for one entity in one cycle.
#[derive(Clone, Debug, Serialize)]
pub struct EntityEvaluation {
    pub entity: EntityId,
    /// Shared by every entity of the cycle.
    pub regime: Arc<GateResult>,
    /// Entity stages in evaluation order, ending at the first block.
    pub stages: Vec<GateResult>,
    pub blocked_by: Option<StageId>,
    pub evidence: Vec<EvidenceEvent>,
    /// Whether the stages ran on a fetched snapshot.
    pub observed: bool,
}

impl EntityEvaluation {
    /// Regime first, then entity stages.
    pub fn results(&self) -> impl Iterator<Item = &GateResult> {
        std::iter::once(self.regime.as_ref()).chain(self.stages.iter())
    }

    pub fn stage(&self, id: StageId) -> Option<&GateResult> {
        self.results().find(|r| r.stage == id)
    }

    pub fn bias(&self) -> Option<Direction> {
        let mut handoffs = Handoffs::default();
        for r in &self.stages {
            handoffs.extend(&r.handoffs);
        }
        handoffs.bias()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bias_prefers_flow_over_tape() {
        let mut h = Handoffs::default();
        h.extend(&[HandoffFlag::MoveExtension {
            from_prev_close_pct: 1.2,
            from_open_pct: None,
        }]);
        assert_eq!(h.bias(), Some(Direction::Up));

        h.extend(&[HandoffFlag::FlowBias {
            direction: Direction::Down,
        }]);
        assert_eq!(h.bias(), Some(Direction::Down));
        assert_eq!(h.depth_ratio(), None);
    }

    #[test]
    fn only_evidence_stages_map_to_kinds() {
        assert_eq!(
            Signal::Book(BookSignal::SpreadWidening).evidence_kind(),
            Some(EvidenceKind::SpreadStress)
        );
        assert_eq!(Signal::Regime(RegimeSignal::VolatilitySpike).evidence_kind(), None);
    }

    #[test]
    fn signals_are_kept_in_stable_order() {
        let r = GateResult::pass(StageId::Tape, 0.5).with_signals(vec![
            SignalHit {
                signal: Signal::Tape(TapeSignal::DarkPoolBlock),
                strength: 0.4,
            },
            SignalHit {
                signal: Signal::Tape(TapeSignal::VolumeSurge),
                strength: 0.9,
            },
        ]);
        assert_eq!(r.signals[0].signal, Signal::Tape(TapeSignal::VolumeSurge));
        assert!(r.has(Signal::Tape(TapeSignal::DarkPoolBlock)));
        assert!(!r.is_block());
    }
}
