use crate::config::config::{SchedulerCfg, to_delta};
use crate::core::types::{EntityId, PriorityTier};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One fixed, non-overlapping slice of an operating day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowId {
    pub session: NaiveDate,
    pub index: u32,
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session, self.index)
    }
}

/// Global call counter for the current window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLedger {
    pub window: WindowId,
    pub used_count: u32,
    pub cap: u32,
}

impl WindowLedger {
    pub fn new(window: WindowId, cap: u32) -> Self {
        Self {
            window,
            used_count: 0,
            cap,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.cap.saturating_sub(self.used_count)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used_count >= self.cap
    }
}

/// Per-entity admission ledger. Mutated only by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetState {
    pub entity: EntityId,
    pub tier: PriorityTier,
    pub window: Option<WindowId>,
    /// Grants issued to this entity in `window`.
    pub used_count: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_granted_at: Option<DateTime<Utc>>,
    /// Consecutive budget denials since the last grant.
    pub missed_cycles: u32,
    pub escalated: bool,
}

impl BudgetState {
    pub fn new(entity: impl Into<String>, tier: PriorityTier) -> Self {
        Self {
            entity: entity.into(),
            tier,
            window: None,
            used_count: 0,
            cooldown_until: None,
            last_granted_at: None,
            missed_cycles: 0,
            escalated: false,
        }
    }

    pub fn cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    CooldownActive { until: DateTime<Utc> },
    WindowExhausted { window: WindowId },
    OutsideSession,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::CooldownActive { until } => write!(f, "cooldown active until {until}"),
            DenyReason::WindowExhausted { window } => write!(f, "window {window} exhausted"),
            DenyReason::OutsideSession => write!(f, "outside session windows"),
        }
    }
}

/// Permission for exactly one logical fetch this cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grant {
    pub entity: EntityId,
    pub window: WindowId,
    /// Metric families the fetch may cover.
    pub burst: u32,
    pub escalated: bool,
    pub granted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Grant(Grant),
    Deny(DenyReason),
}

impl Admission {
    pub fn is_grant(&self) -> bool {
        matches!(self, Admission::Grant(_))
    }
}

/// Maps wall-clock instants onto session windows.
#[derive(Clone, Debug)]
pub struct SessionCalendar {
    open: NaiveTime,
    offset: FixedOffset,
    window_length: chrono::Duration,
    window_count: u32,
}

impl SessionCalendar {
    pub fn new(cfg: &SchedulerCfg) -> Self {
        let offset = FixedOffset::east_opt(cfg.utc_offset_minutes * 60).unwrap_or(Utc.fix());
        Self {
            open: cfg.session_open,
            offset,
            window_length: to_delta(cfg.window_length),
            window_count: cfg.window_count,
        }
    }

    pub fn session_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.offset).date_naive()
    }

    /// Session open instant for the local date containing `now`.
    pub fn session_open(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = self.session_date(now).and_time(self.open);
        // Fixed offsets never produce ambiguous or skipped local times.
        (local - self.offset_delta()).and_utc()
    }

    pub fn window_at(&self, now: DateTime<Utc>) -> Option<WindowId> {
        let open = self.session_open(now);
        if now < open {
            return None;
        }
        let elapsed = now - open;
        let len_ms = self.window_length.num_milliseconds().max(1);
        let index = elapsed.num_milliseconds() / len_ms;
        if index >= self.window_count as i64 {
            return None;
        }
        Some(WindowId {
            session: self.session_date(now),
            index: index as u32,
        })
    }

    fn offset_delta(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offset.local_minus_utc() as i64)
    }
}
