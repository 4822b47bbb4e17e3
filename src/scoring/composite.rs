use crate::config::config::ScoringCfg;
use crate::core::types::clamp_unit;
use crate::pipeline::types::{GateResult, StageId};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTier {
    Ignore,
    Monitor,
    Watchlist,
    Actionable,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageContribution {
    pub stage: StageId,
    pub sub_score: f64,
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompositeScore {
    pub value: f64,
    pub tier: ActionTier,
    pub breakdown: Vec<StageContribution>,
    pub blocked_by: Option<StageId>,
}

/// Weighted sum of stage sub-scores. Pure.
pub struct CompositeScorer {
    cfg: ScoringCfg,
}

impl CompositeScorer {
    pub fn new(cfg: ScoringCfg) -> Self {
        Self { cfg }
    }

    pub fn weight(&self, stage: StageId) -> f64 {
        let w = &self.cfg.weights;
        match stage {
            StageId::Regime => w.regime,
            StageId::Flow => w.flow,
            StageId::Tape => w.tape,
            StageId::Book => w.book,
            StageId::EntryTiming => w.entry_timing,
            StageId::Structural => w.structural,
        }
    }

    pub fn tier_for(&self, value: f64) -> ActionTier {
        let t = &self.cfg.tiers;
        if value >= t.actionable {
            ActionTier::Actionable
        } else if value >= t.watchlist {
            ActionTier::Watchlist
        } else if value >= t.monitor {
            ActionTier::Monitor
        } else {
            ActionTier::Ignore
        }
    }

    /// A block anywhere scores exactly zero.
    pub fn score<'a>(&self, results: impl IntoIterator<Item = &'a GateResult>) -> CompositeScore {
        let mut breakdown = Vec::new();
        let mut blocked_by = None;
        for r in results {
            if r.is_block() && blocked_by.is_none() {
                blocked_by = Some(r.stage);
            }
            let weight = self.weight(r.stage);
            breakdown.push(StageContribution {
                stage: r.stage,
                sub_score: r.sub_score,
                weight,
                contribution: weight * r.sub_score,
            });
        }

        if blocked_by.is_some() {
            return CompositeScore {
                value: 0.0,
                tier: ActionTier::Ignore,
                breakdown,
                blocked_by,
            };
        }

        let value = clamp_unit(breakdown.iter().map(|c| c.contribution).sum());
        CompositeScore {
            value,
            tier: self.tier_for(value),
            breakdown,
            blocked_by: None,
        }
    }
}
