use crate::config::config::{ConfirmationCfg, to_delta};
use crate::core::types::{Direction, EntityId, TelemetrySnapshot, pct_change, to_f64};
use crate::pressure::aggregator::PressureReading;
use crate::scheduler::budget::SessionCalendar;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ConfirmationVerdict {
    Pending,
    Confirmed { urgent: bool },
    Absorbed,
    Inconclusive,
}

impl ConfirmationVerdict {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ConfirmationVerdict::Pending)
    }

    pub fn grants_eligibility(self) -> bool {
        matches!(self, ConfirmationVerdict::Confirmed { .. })
    }
}

/// Narrow view of a fresh snapshot taken at the checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointObservation {
    pub observed_at: DateTime<Utc>,
    /// Session open vs previous close, in percent.
    pub gap_pct: Option<f64>,
    /// Current spread over baseline spread.
    pub spread_ratio: Option<f64>,
}

impl CheckpointObservation {
    pub fn from_snapshot(snap: &TelemetrySnapshot) -> Option<Self> {
        let gap_pct = snap.tape.as_ref().and_then(|t| {
            let open = t.session_open.and_then(to_f64)?;
            let prev = t.prev_close.and_then(to_f64)?;
            pct_change(open, prev)
        });
        let spread_ratio = snap.book.as_ref().and_then(|b| {
            let base = b.baseline_spread_bps.filter(|b| *b > 0.0)?;
            b.spread_bps.map(|s| s / base)
        });
        if gap_pct.is_none() && spread_ratio.is_none() {
            return None;
        }
        Some(Self {
            observed_at: snap.taken_at,
            gap_pct,
            spread_ratio,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationCase {
    pub entity: EntityId,
    pub session: NaiveDate,
    pub direction: Direction,
    pub armed_at: DateTime<Utc>,
    pub armed_value: f64,
    pub checkpoint_at: DateTime<Utc>,
    pub verdict: ConfirmationVerdict,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Verdict for a pending case given one checkpoint observation.
pub fn judge(
    direction: Direction,
    obs: &CheckpointObservation,
    cfg: &ConfirmationCfg,
) -> ConfirmationVerdict {
    let gap_dir = obs.gap_pct.and_then(Direction::of);
    let stressed = obs
        .spread_ratio
        .is_some_and(|r| r >= cfg.urgent_spread_ratio);

    if gap_dir == Some(direction.opposite()) {
        return ConfirmationVerdict::Absorbed;
    }
    let wide_gap = obs.gap_pct.is_some_and(|g| g.abs() >= cfg.min_gap_pct);
    if gap_dir == Some(direction) && wide_gap {
        return ConfirmationVerdict::Confirmed { urgent: stressed };
    }
    if stressed {
        return ConfirmationVerdict::Confirmed { urgent: true };
    }
    ConfirmationVerdict::Inconclusive
}

/// One case per entity per session date.
pub struct ConfirmationTracker {
    cfg: ConfirmationCfg,
    calendar: SessionCalendar,
    cases: Mutex<HashMap<EntityId, ConfirmationCase>>,
}

impl ConfirmationTracker {
    pub fn new(cfg: ConfirmationCfg, calendar: SessionCalendar) -> Self {
        Self {
            cfg,
            calendar,
            cases: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a Pending case when the reading is elevated and directional.
    /// Returns the new case, or `None` if nothing was armed.
    ///
    /// A case armed after today's checkpoint grace has closed is validated at
    /// the next session's checkpoint and belongs to that session.
    pub fn arm(
        &self,
        entity: &str,
        reading: &PressureReading,
        now: DateTime<Utc>,
    ) -> Option<ConfirmationCase> {
        let direction = reading.bias?;
        if reading.level < self.cfg.arm_level {
            return None;
        }
        let today = self.calendar.session_date(now);
        let mut cases = self.cases.lock();
        if cases.get(entity).is_some_and(|c| c.session >= today) {
            return None;
        }

        let (session, checkpoint_at) = self.checkpoint_for(now);
        let case = ConfirmationCase {
            entity: entity.to_string(),
            session,
            direction,
            armed_at: now,
            armed_value: reading.value,
            checkpoint_at,
            verdict: ConfirmationVerdict::Pending,
            resolved_at: None,
        };
        info!(entity, ?direction, value = reading.value, %checkpoint_at, "confirmation armed");
        cases.insert(entity.to_string(), case.clone());
        Some(case)
    }

    /// First checkpoint whose grace period has not closed at `now`.
    fn checkpoint_for(&self, now: DateTime<Utc>) -> (NaiveDate, DateTime<Utc>) {
        let offset = to_delta(self.cfg.checkpoint_offset);
        let checkpoint = self.calendar.session_open(now) + offset;
        if now <= checkpoint + to_delta(self.cfg.checkpoint_grace) {
            return (self.calendar.session_date(now), checkpoint);
        }
        let next = now + chrono::Duration::days(1);
        (
            self.calendar.session_date(next),
            self.calendar.session_open(next) + offset,
        )
    }

    pub fn checkpoint_due(&self, entity: &str, now: DateTime<Utc>) -> bool {
        self.cases
            .lock()
            .get(entity)
            .is_some_and(|c| self.in_checkpoint(c, now))
    }

    fn in_checkpoint(&self, case: &ConfirmationCase, now: DateTime<Utc>) -> bool {
        case.verdict == ConfirmationVerdict::Pending
            && now >= case.checkpoint_at
            && now <= case.checkpoint_at + to_delta(self.cfg.checkpoint_grace)
    }

    /// Applies the checkpoint transition. `None` unless the case is due.
    pub fn resolve(
        &self,
        entity: &str,
        obs: &CheckpointObservation,
        now: DateTime<Utc>,
    ) -> Option<ConfirmationVerdict> {
        let mut cases = self.cases.lock();
        let case = cases.get_mut(entity)?;
        if !self.in_checkpoint(case, now) {
            return None;
        }
        let verdict = judge(case.direction, obs, &self.cfg);
        case.verdict = verdict;
        case.resolved_at = Some(now);
        info!(entity, ?verdict, gap = ?obs.gap_pct, spread = ?obs.spread_ratio, "checkpoint resolved");
        Some(verdict)
    }

    /// Pending cases that outlived the grace period become Inconclusive.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<(EntityId, ConfirmationVerdict)> {
        let grace = to_delta(self.cfg.checkpoint_grace);
        let mut expired = Vec::new();
        for (id, case) in self.cases.lock().iter_mut() {
            if case.verdict == ConfirmationVerdict::Pending && now > case.checkpoint_at + grace {
                case.verdict = ConfirmationVerdict::Inconclusive;
                case.resolved_at = Some(now);
                expired.push((id.clone(), case.verdict));
            }
        }
        expired.sort_by(|a, b| a.0.cmp(&b.0));
        expired
    }

    pub fn case(&self, entity: &str) -> Option<ConfirmationCase> {
        self.cases.lock().get(entity).cloned()
    }

    pub fn verdict(&self, entity: &str) -> Option<ConfirmationVerdict> {
        self.cases.lock().get(entity).map(|c| c.verdict)
    }

    /// Adopts a persisted case unless one for the same or a later session is held.
    pub fn restore(&self, case: ConfirmationCase) {
        let mut cases = self.cases.lock();
        let keep_existing = cases
            .get(&case.entity)
            .is_some_and(|cur| cur.session >= case.session);
        if !keep_existing {
            cases.insert(case.entity.clone(), case);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::SchedulerCfg;
    use crate::pressure::aggregator::PressureLevel;
    use chrono::{Duration, NaiveTime, TimeZone};

    fn tracker() -> ConfirmationTracker {
        let calendar = SessionCalendar::new(&SchedulerCfg {
            session_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            utc_offset_minutes: 0,
            ..Default::default()
        });
        ConfirmationTracker::new(ConfirmationCfg::default(), calendar)
    }

    fn open() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap()
    }

    fn reading(level: PressureLevel, bias: Option<Direction>) -> PressureReading {
        PressureReading {
            value: 0.6,
            level,
            bias,
            distinct_kinds: 3,
            live_events: 4,
        }
    }

    fn obs(gap: f64, spread: f64) -> CheckpointObservation {
        CheckpointObservation {
            observed_at: open() + Duration::minutes(15),
            gap_pct: Some(gap),
            spread_ratio: Some(spread),
        }
    }

    #[test]
    fn arms_once_per_session() {
        let t = tracker();
        let elevated = reading(PressureLevel::Prepare, Some(Direction::Down));
        assert!(t.arm("KRE", &reading(PressureLevel::Watch, Some(Direction::Down)), open()).is_none());
        assert!(t.arm("KRE", &reading(PressureLevel::Act, None), open()).is_none());

        let case = t.arm("KRE", &elevated, open() - Duration::hours(1)).unwrap();
        assert_eq!(case.checkpoint_at, open() + Duration::minutes(15));
        assert!(t.arm("KRE", &elevated, open()).is_none());

        // Next session may arm again.
        assert!(t.arm("KRE", &elevated, open() + Duration::days(1)).is_some());
    }

    #[test]
    fn opposite_gap_is_absorbed() {
        let t = tracker();
        t.arm("KRE", &reading(PressureLevel::Prepare, Some(Direction::Down)), open());
        let at = open() + Duration::minutes(15);
        assert!(t.checkpoint_due("KRE", at));

        let v = t.resolve("KRE", &obs(0.8, 1.0), at).unwrap();
        assert_eq!(v, ConfirmationVerdict::Absorbed);
        assert!(!v.grants_eligibility());
        // Terminal: a second observation changes nothing.
        assert!(t.resolve("KRE", &obs(-1.0, 1.0), at).is_none());
        assert!(!t.checkpoint_due("KRE", at));
    }

    #[test]
    fn verdict_rules() {
        let cfg = ConfirmationCfg::default();
        let d = Direction::Down;
        assert_eq!(judge(d, &obs(-0.5, 1.0), &cfg), ConfirmationVerdict::Confirmed { urgent: false });
        assert_eq!(judge(d, &obs(-0.5, 2.5), &cfg), ConfirmationVerdict::Confirmed { urgent: true });
        assert_eq!(judge(d, &obs(-0.1, 1.0), &cfg), ConfirmationVerdict::Inconclusive);
        assert_eq!(judge(d, &obs(0.0, 2.0), &cfg), ConfirmationVerdict::Confirmed { urgent: true });
        assert_eq!(judge(d, &obs(0.4, 3.0), &cfg), ConfirmationVerdict::Absorbed);
    }

    #[test]
    fn early_observation_is_ignored_and_late_case_expires() {
        let t = tracker();
        t.arm("XLE", &reading(PressureLevel::Act, Some(Direction::Up)), open());
        assert!(t.resolve("XLE", &obs(1.0, 1.0), open() + Duration::minutes(5)).is_none());
        assert_eq!(t.verdict("XLE"), Some(ConfirmationVerdict::Pending));

        assert!(t.expire(open() + Duration::minutes(60)).is_empty());
        let expired = t.expire(open() + Duration::minutes(61));
        assert_eq!(expired, vec![("XLE".to_string(), ConfirmationVerdict::Inconclusive)]);
        assert!(t.arm("XLE", &reading(PressureLevel::Act, Some(Direction::Up)), open() + Duration::minutes(90)).is_none());
    }

    #[test]
    fn late_arm_waits_for_next_session_checkpoint() {
        let t = tracker();
        let elevated = reading(PressureLevel::Prepare, Some(Direction::Down));
        let late = open() + Duration::hours(2);

        let case = t.arm("KRE", &elevated, late).unwrap();
        let next_checkpoint = open() + Duration::days(1) + Duration::minutes(15);
        assert_eq!(case.checkpoint_at, next_checkpoint);
        assert_eq!(case.session, (open() + Duration::days(1)).date_naive());

        assert!(t.expire(late).is_empty());
        assert!(t.arm("KRE", &elevated, late + Duration::hours(1)).is_none());
        // Still the same case on the next morning; no second arm.
        assert!(t.arm("KRE", &elevated, open() + Duration::days(1)).is_none());

        assert!(!t.checkpoint_due("KRE", late));
        assert!(t.checkpoint_due("KRE", next_checkpoint));
        let v = t.resolve("KRE", &obs(-0.5, 1.0), next_checkpoint).unwrap();
        assert_eq!(v, ConfirmationVerdict::Confirmed { urgent: false });
    }

    #[test]
    fn observation_from_snapshot() {
        use crate::core::types::{BookAggregates, TapeAggregates};
        use rust_decimal::Decimal;

        let mut snap = TelemetrySnapshot::empty("KRE", open());
        assert!(CheckpointObservation::from_snapshot(&snap).is_none());
        snap.tape = Some(TapeAggregates {
            prev_close: Some(Decimal::new(10_000, 2)),
            session_open: Some(Decimal::new(9_950, 2)),
            ..Default::default()
        });
        snap.book = Some(BookAggregates {
            spread_bps: Some(4.0),
            baseline_spread_bps: Some(2.0),
            ..Default::default()
        });
        let o = CheckpointObservation::from_snapshot(&snap).unwrap();
        assert!((o.gap_pct.unwrap() + 0.5).abs() < 1e-9);
        assert_eq!(o.spread_ratio, Some(2.0));
    }
}
