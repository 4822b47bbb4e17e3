use crate::config::config::PipelineCfg;
use crate::core::error::CycleError;
use crate::core::types::{Entity, EvidenceEvent, RegimeSnapshot, TelemetrySnapshot};
use crate::pipeline::evidence::{BookStage, FlowStage, TapeStage};
use crate::pipeline::regime::RegimeGate;
use crate::pipeline::structural::StructuralStage;
use crate::pipeline::timing::EntryTimingStage;
use crate::pipeline::types::{EntityEvaluation, GateResult, Handoffs, StageId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::debug;

/// One entity-local stage. Reads the snapshot and upstream handoffs only.
pub trait EntityStage: Send + Sync {
    fn id(&self) -> StageId;

    /// Evidence stages emit events only when at least this many signals fire.
    fn min_signals(&self) -> usize {
        0
    }

    fn evaluate(&self, snap: &TelemetrySnapshot, upstream: &Handoffs) -> GateResult;
}

pub struct GatePipeline {
    regime: RegimeGate,
    stages: Vec<Box<dyn EntityStage>>,
    neutral: f64,
}

impl GatePipeline {
    pub fn new(cfg: &PipelineCfg) -> Self {
        let neutral = cfg.neutral_sub_score;
        let mut stages: Vec<Box<dyn EntityStage>> = vec![
            Box::new(FlowStage::new(cfg.flow.clone())),
            Box::new(TapeStage::new(cfg.tape.clone())),
            Box::new(BookStage::new(cfg.book.clone())),
            Box::new(EntryTimingStage::new(cfg.entry_timing.clone(), neutral)),
        ];
        if cfg.structural.enabled {
            stages.push(Box::new(StructuralStage::new(
                cfg.structural.clone(),
                neutral,
            )));
        }
        Self {
            regime: RegimeGate::new(cfg.regime.clone()),
            stages,
            neutral,
        }
    }

    pub fn stage_ids(&self) -> Vec<StageId> {
        std::iter::once(StageId::Regime)
            .chain(self.stages.iter().map(|s| s.id()))
            .collect()
    }

    /// Global stage, once per cycle. The result is shared by every entity.
    pub fn evaluate_regime(&self, snap: &RegimeSnapshot) -> Result<Arc<GateResult>, CycleError> {
        self.regime.evaluate(snap).map(Arc::new)
    }

    fn empty_evaluation(
        &self,
        entity: &Entity,
        regime: &Arc<GateResult>,
        observed: bool,
    ) -> EntityEvaluation {
        EntityEvaluation {
            entity: entity.id.clone(),
            regime: Arc::clone(regime),
            stages: Vec::with_capacity(self.stages.len()),
            blocked_by: regime.is_block().then_some(StageId::Regime),
            evidence: Vec::new(),
            observed,
        }
    }

    /// Every entity stage passes at the neutral sub-score; `cause` says why
    /// nothing was observed. No evidence is emitted.
    pub fn evaluate_unobserved(
        &self,
        entity: &Entity,
        regime: &Arc<GateResult>,
        cause: &str,
    ) -> EntityEvaluation {
        let mut eval = self.empty_evaluation(entity, regime, false);
        if eval.blocked_by.is_none() {
            eval.stages = self
                .stages
                .iter()
                .map(|s| {
                    GateResult::pass(s.id(), self.neutral)
                        .with_reason(format!("no snapshot: {cause}"))
                })
                .collect();
        }
        eval
    }

    /// Runs the entity stages in order, stopping at the first block.
    /// Without a snapshot every stage passes at the neutral sub-score.
    pub fn evaluate(
        &self,
        entity: &Entity,
        snapshot: Option<&TelemetrySnapshot>,
        regime: &Arc<GateResult>,
    ) -> EntityEvaluation {
        let Some(snap) = snapshot else {
            return self.evaluate_unobserved(entity, regime, "snapshot unavailable");
        };
        let mut eval = self.empty_evaluation(entity, regime, true);
        if eval.blocked_by.is_some() {
            return eval;
        }

        let mut handoffs = Handoffs::default();
        for stage in &self.stages {
            let result = stage.evaluate(snap, &handoffs);
            handoffs.extend(&result.handoffs);
            let blocked = result.is_block();
            eval.stages.push(result);
            if blocked {
                debug!(entity = %entity.id, stage = %stage.id(), "entity blocked");
                eval.blocked_by = Some(stage.id());
                break;
            }
        }

        eval.evidence = self.collect_evidence(entity, &eval.stages, &handoffs, snap.taken_at);
        eval
    }

    fn collect_evidence(
        &self,
        entity: &Entity,
        results: &[GateResult],
        handoffs: &Handoffs,
        at: DateTime<Utc>,
    ) -> Vec<EvidenceEvent> {
        let Some(direction) = handoffs.bias() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for (stage, result) in self.stages.iter().zip(results) {
            let min = stage.min_signals();
            if min == 0 || result.signals.len() < min {
                continue;
            }
            events.extend(result.signals.iter().filter_map(|hit| {
                hit.signal.evidence_kind().map(|kind| {
                    EvidenceEvent::new(entity.id.clone(), kind, direction, hit.strength, at)
                })
            }));
        }
        events
    }
}
