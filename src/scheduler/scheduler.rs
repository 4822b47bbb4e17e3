//! Admission control over external fetches.
//!
//! Cooldowns are wall-clock timers. A window rollover resets the global call
//! counter and each entity's per-window `used_count`, never `cooldown_until`.

use crate::config::config::{SchedulerCfg, to_delta};
use crate::core::types::{Entity, EntityId};
use crate::scheduler::budget::{
    Admission, BudgetState, DenyReason, Grant, SessionCalendar, WindowLedger,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Default)]
struct SchedulerState {
    ledger: Option<WindowLedger>,
    budgets: HashMap<EntityId, BudgetState>,
}

/// Sole owner of `BudgetState`. All mutation goes through one lock.
pub struct RequestScheduler {
    cfg: SchedulerCfg,
    calendar: SessionCalendar,
    state: Mutex<SchedulerState>,
}

impl RequestScheduler {
    pub fn new(cfg: SchedulerCfg) -> Self {
        Self {
            calendar: SessionCalendar::new(&cfg),
            cfg,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn calendar(&self) -> &SessionCalendar {
        &self.calendar
    }

    pub fn admit(&self, entity: &Entity, now: DateTime<Utc>) -> Admission {
        let Some(window) = self.calendar.window_at(now) else {
            metrics::counter!("scheduler_admissions_total", "outcome" => "outside_session")
                .increment(1);
            return Admission::Deny(DenyReason::OutsideSession);
        };

        let mut guard = self.state.lock();
        let st = &mut *guard;

        if st.ledger.as_ref().map(|l| l.window) != Some(window) {
            debug!(%window, cap = self.cfg.window_budget, "window rollover");
            st.ledger = Some(WindowLedger::new(window, self.cfg.window_budget));
        }
        let ledger = st
            .ledger
            .get_or_insert_with(|| WindowLedger::new(window, self.cfg.window_budget));

        let budget = st
            .budgets
            .entry(entity.id.clone())
            .or_insert_with(|| BudgetState::new(entity.id.clone(), entity.tier));
        budget.tier = entity.tier;
        if budget.window != Some(window) {
            budget.window = Some(window);
            budget.used_count = 0;
        }

        if let Some(until) = budget.cooldown_until.filter(|until| now < *until) {
            metrics::counter!("scheduler_admissions_total", "outcome" => "cooldown").increment(1);
            return Admission::Deny(DenyReason::CooldownActive { until });
        }

        if ledger.is_exhausted() {
            budget.missed_cycles += 1;
            if budget.missed_cycles > self.cfg.starvation_cycles && !budget.escalated {
                info!(
                    entity = %entity.id,
                    missed = budget.missed_cycles,
                    "escalating starved entity"
                );
                budget.escalated = true;
            }
            metrics::counter!("scheduler_admissions_total", "outcome" => "window_exhausted")
                .increment(1);
            return Admission::Deny(DenyReason::WindowExhausted { window });
        }

        ledger.used_count += 1;
        budget.used_count += 1;
        budget.cooldown_until = Some(now + to_delta(self.cfg.cooldowns.for_tier(entity.tier)));
        budget.last_granted_at = Some(now);
        budget.missed_cycles = 0;
        let escalated = std::mem::take(&mut budget.escalated);

        metrics::counter!("scheduler_admissions_total", "outcome" => "grant").increment(1);
        Admission::Grant(Grant {
            entity: entity.id.clone(),
            window,
            burst: self.cfg.burst_allowance,
            escalated,
            granted_at: now,
        })
    }

    /// Escalated entities first, then tier, then least recently granted.
    pub fn admission_order<'a>(&self, entities: &'a [Entity]) -> Vec<&'a Entity> {
        let st = self.state.lock();
        let mut ordered: Vec<&Entity> = entities.iter().collect();
        ordered.sort_by(|a, b| {
            let key = |e: &Entity| {
                let budget = st.budgets.get(&e.id);
                (
                    !budget.is_some_and(|b| b.escalated),
                    e.tier.rank(),
                    budget.and_then(|b| b.last_granted_at),
                )
            };
            key(a).cmp(&key(b)).then_with(|| a.id.cmp(&b.id))
        });
        ordered
    }

    pub fn budget(&self, entity: &str) -> Option<BudgetState> {
        self.state.lock().budgets.get(entity).cloned()
    }

    pub fn restore_budget(&self, budget: BudgetState) {
        self.state.lock().budgets.insert(budget.entity.clone(), budget);
    }

    pub fn window_ledger(&self) -> Option<WindowLedger> {
        self.state.lock().ledger.clone()
    }

    /// Adopts a persisted ledger. The configured cap wins over the stored one;
    /// within the same window the higher call count wins.
    pub fn restore_window(&self, mut ledger: WindowLedger) {
        ledger.cap = self.cfg.window_budget;
        let mut st = self.state.lock();
        match st.ledger.as_mut() {
            Some(cur) if cur.window == ledger.window => {
                cur.used_count = cur.used_count.max(ledger.used_count);
            }
            Some(cur) if cur.window > ledger.window => {}
            _ => st.ledger = Some(ledger),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::TierCooldowns;
    use crate::core::types::PriorityTier;
    use chrono::{NaiveTime, TimeZone};
    use proptest::prelude::*;
    use std::time::Duration;

    fn cfg(budget: u32) -> SchedulerCfg {
        SchedulerCfg {
            session_open: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            utc_offset_minutes: 0,
            window_length: Duration::from_secs(30 * 60),
            window_count: 13,
            window_budget: budget,
            burst_allowance: 3,
            starvation_cycles: 2,
            cooldowns: TierCooldowns {
                hot: Duration::from_secs(5 * 60),
                warm: Duration::from_secs(15 * 60),
                cold: Duration::from_secs(60 * 60),
            },
        }
    }

    fn open() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 30, 0).unwrap()
    }

    fn mins(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    #[test]
    fn test_cooldown_blocks_regrant() {
        let sched = RequestScheduler::new(cfg(40));
        let hot = Entity::new("AAPL", "tech", PriorityTier::Hot);

        let grant = sched.admit(&hot, open());
        match grant {
            Admission::Grant(g) => {
                assert_eq!(g.burst, 3);
                assert!(!g.escalated);
            }
            other => panic!("expected grant, got {other:?}"),
        }

        match sched.admit(&hot, open() + mins(1)) {
            Admission::Deny(DenyReason::CooldownActive { until }) => {
                assert_eq!(until, open() + mins(5))
            }
            other => panic!("expected cooldown, got {other:?}"),
        }
        assert!(sched.admit(&hot, open() + mins(5)).is_grant());
        assert_eq!(sched.budget("AAPL").unwrap().used_count, 2);
    }

    #[test]
    fn test_window_budget_denies_exactly_one_over_cap() {
        let n = 3;
        let sched = RequestScheduler::new(cfg(n));
        let entities: Vec<Entity> = (0..=n)
            .map(|i| Entity::new(format!("E{i}"), "s", PriorityTier::Hot))
            .collect();

        let results: Vec<Admission> = entities.iter().map(|e| sched.admit(e, open())).collect();
        let denials: Vec<&Admission> = results.iter().filter(|a| !a.is_grant()).collect();
        assert_eq!(denials.len(), 1);
        assert!(matches!(
            denials[0],
            Admission::Deny(DenyReason::WindowExhausted { .. })
        ));
        let ledger = sched.window_ledger().unwrap();
        assert_eq!(ledger.used_count, n);
        assert!(ledger.used_count <= ledger.cap);
    }

    #[test]
    fn test_rollover_resets_counter_but_not_cooldown() {
        let sched = RequestScheduler::new(cfg(1));
        let cold = Entity::new("KRE", "fin", PriorityTier::Cold);
        let warm = Entity::new("XLE", "energy", PriorityTier::Warm);

        assert!(sched.admit(&cold, open()).is_grant());
        assert!(matches!(
            sched.admit(&warm, open()),
            Admission::Deny(DenyReason::WindowExhausted { .. })
        ));

        // Next window: counter is fresh, cold cooldown (60m) still runs.
        let next = open() + mins(30);
        assert!(matches!(
            sched.admit(&cold, next),
            Admission::Deny(DenyReason::CooldownActive { .. })
        ));
        assert!(sched.admit(&warm, next).is_grant());
        assert_eq!(sched.window_ledger().unwrap().window.index, 1);
    }

    #[test]
    fn test_outside_session() {
        let sched = RequestScheduler::new(cfg(5));
        let e = Entity::new("AAPL", "tech", PriorityTier::Hot);
        assert_eq!(
            sched.admit(&e, open() - mins(10)),
            Admission::Deny(DenyReason::OutsideSession)
        );
        assert!(sched.budget("AAPL").is_none());
    }

    #[test]
    fn test_starved_entity_is_escalated_once() {
        let mut c = cfg(1);
        c.window_length = Duration::from_secs(5 * 60);
        c.window_count = 60;
        c.cooldowns = TierCooldowns {
            hot: Duration::ZERO,
            warm: Duration::ZERO,
            cold: Duration::ZERO,
        };
        let sched = RequestScheduler::new(c);
        let universe = vec![
            Entity::new("ZZZ", "s", PriorityTier::Cold),
            Entity::new("AAA", "s", PriorityTier::Hot),
        ];

        let mut grants = Vec::new();
        for cycle in 0..5 {
            let now = open() + mins(5 * cycle);
            for e in sched.admission_order(&universe) {
                if let Admission::Grant(g) = sched.admit(e, now) {
                    grants.push((g.entity.clone(), g.escalated));
                }
            }
        }

        // Hot wins three windows, the cold entity crosses the starvation
        // threshold and is served first once, then hot resumes.
        assert_eq!(
            grants,
            vec![
                ("AAA".to_string(), false),
                ("AAA".to_string(), false),
                ("AAA".to_string(), false),
                ("ZZZ".to_string(), true),
                ("AAA".to_string(), false),
            ]
        );
        assert!(!sched.budget("ZZZ").unwrap().escalated);
    }

    #[test]
    fn test_restore_round_trip() {
        let sched = RequestScheduler::new(cfg(2));
        let e = Entity::new("AAPL", "tech", PriorityTier::Hot);
        assert!(sched.admit(&e, open()).is_grant());

        let budget = sched.budget("AAPL").unwrap();
        let ledger = sched.window_ledger().unwrap();

        let fresh = RequestScheduler::new(cfg(2));
        fresh.restore_budget(budget);
        fresh.restore_window(ledger);
        assert!(matches!(
            fresh.admit(&e, open() + mins(1)),
            Admission::Deny(DenyReason::CooldownActive { .. })
        ));
        assert_eq!(fresh.window_ledger().unwrap().used_count, 1);
    }

    proptest! {
        #[test]
        fn never_grants_inside_cooldown(steps in proptest::collection::vec(0i64..7, 1..60)) {
            let sched = RequestScheduler::new(cfg(1000));
            let e = Entity::new("AAPL", "tech", PriorityTier::Hot);
            let cooldown = mins(5);
            let mut now = open();
            let mut last_grant: Option<DateTime<Utc>> = None;
            for step in steps {
                now += mins(step);
                if let Admission::Grant(g) = sched.admit(&e, now) {
                    if let Some(prev) = last_grant {
                        prop_assert!(g.granted_at - prev >= cooldown);
                    }
                    last_grant = Some(g.granted_at);
                }
            }
        }
    }
}
