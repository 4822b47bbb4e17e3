use crate::config::config::{AlertCfg, to_delta};
use crate::core::types::{EntityId, EvidenceKind};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::num::NonZeroUsize;
use tracing::info;

/// Pressure index after one cycle, with the evidence kinds that cycle added.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexSample {
    pub at: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub new_kinds: Vec<EvidenceKind>,
}

/// Bounded, time-ordered ring of samples for one entity.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexHistory {
    samples: VecDeque<IndexSample>,
    capacity: usize,
}

impl IndexHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(2),
        }
    }

    pub fn from_samples(capacity: usize, samples: impl IntoIterator<Item = IndexSample>) -> Self {
        let mut h = Self::new(capacity);
        for s in samples {
            h.push(s);
        }
        h
    }

    /// Out-of-order samples are placed by time.
    pub fn push(&mut self, sample: IndexSample) {
        let pos = self.samples.partition_point(|s| s.at <= sample.at);
        self.samples.insert(pos, sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = &IndexSample> {
        self.samples.iter()
    }

    pub fn latest(&self) -> Option<&IndexSample> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Advisory only. Never feeds back into scoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlashAlert {
    pub entity: EntityId,
    pub at: DateTime<Utc>,
    pub baseline: f64,
    pub latest: f64,
    pub delta: f64,
    pub kinds: Vec<EvidenceKind>,
}

pub struct FlashAlertDetector {
    cfg: AlertCfg,
    last_fired: Mutex<LruCache<EntityId, DateTime<Utc>>>,
}

impl FlashAlertDetector {
    pub fn new(cfg: AlertCfg) -> Self {
        let cap = NonZeroUsize::new(cfg.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cfg,
            last_fired: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Fires when the index rose by at least the threshold over the window
    /// and the window's evidence spans enough distinct kinds.
    ///
    /// Samples at or before the entity's last alert belong to a surge that was
    /// already reported: they only feed the baseline, never the rise or the kinds.
    pub fn check(&self, entity: &str, history: &IndexHistory, now: DateTime<Utc>) -> Option<FlashAlert> {
        let window = to_delta(self.cfg.window);
        let start = now - window;

        let mut fired = self.last_fired.lock();
        let last = fired.get(entity).copied();
        if last.is_some_and(|at| now - at < window) {
            return None;
        }

        let mut prior: Option<f64> = None;
        let mut inside: Vec<&IndexSample> = Vec::new();
        for s in history.samples().filter(|s| s.at <= now) {
            if s.at < start || last.is_some_and(|at| s.at <= at) {
                prior = Some(s.value);
            } else {
                inside.push(s);
            }
        }
        let latest = inside.last()?.value;
        let baseline = inside
            .iter()
            .map(|s| s.value)
            .fold(prior.unwrap_or(0.0), f64::min);
        let delta = latest - baseline;

        let kinds: BTreeSet<EvidenceKind> = inside
            .iter()
            .flat_map(|s| s.new_kinds.iter().copied())
            .collect();
        if delta < self.cfg.delta_threshold || kinds.len() < self.cfg.min_distinct_kinds {
            return None;
        }

        fired.put(entity.to_string(), now);

        info!(entity, delta, baseline, latest, kinds = kinds.len(), "flash alert");
        Some(FlashAlert {
            entity: entity.to_string(),
            at: now,
            baseline,
            latest,
            delta,
            kinds: kinds.into_iter().collect(),
        })
    }
}
