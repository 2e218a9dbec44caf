// Per-plan trigger state
//
// Everything here is synchronous and clock-free: callers pass `now`. A repeat
// trigger keeps a cursor and fires when the first occurrence after the cursor
// is due, then moves the cursor to `now`. Missed occurrences therefore collapse
// into a single firing.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::ScheduleError;
use crate::models::{Plan, PlanState, Trigger};
use crate::schedule::{next_fire_after, parse_cron_expression, validate_trigger};

#[derive(Debug, Clone)]
pub(crate) enum TriggerState {
    Repeat {
        schedule: CronSchedule,
        /// `None` when unbounded
        remaining: Option<u64>,
        cursor: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
    },
    Timer {
        timer_at: DateTime<Utc>,
        start_time: Option<DateTime<Utc>>,
        consumed: bool,
    },
}

impl TriggerState {
    pub(crate) fn new(trigger: &Trigger, armed_at: DateTime<Utc>) -> Result<Self, ScheduleError> {
        validate_trigger(trigger)?;
        Ok(match trigger {
            Trigger::Repeat {
                repeat_at,
                repeat_time,
                start_time,
                end_time,
            } => TriggerState::Repeat {
                schedule: parse_cron_expression(repeat_at)?,
                remaining: u64::try_from(*repeat_time).ok(),
                cursor: (*start_time).max(armed_at),
                end_time: *end_time,
            },
            Trigger::Timer {
                timer_at,
                start_time,
                ..
            } => TriggerState::Timer {
                timer_at: *timer_at,
                start_time: *start_time,
                consumed: false,
            },
        })
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            TriggerState::Repeat { .. } => "repeat",
            TriggerState::Timer { .. } => "timer",
        }
    }

    pub(crate) fn remaining(&self) -> Option<u64> {
        match self {
            TriggerState::Repeat { remaining, .. } => *remaining,
            TriggerState::Timer { consumed, .. } => Some(u64::from(!*consumed)),
        }
    }

    /// Fire at most once if due at `now`, updating counters
    pub(crate) fn fire_if_due(&mut self, now: DateTime<Utc>, timezone: Tz) -> bool {
        match self {
            TriggerState::Repeat {
                schedule,
                remaining,
                cursor,
                end_time,
            } => {
                if *remaining == Some(0) {
                    return false;
                }
                let Some(next) = next_fire_after(schedule, *cursor, timezone) else {
                    return false;
                };
                if next > now || end_time.is_some_and(|end| next > end) {
                    return false;
                }
                *cursor = now;
                if let Some(left) = remaining.as_mut() {
                    *left -= 1;
                }
                true
            }
            TriggerState::Timer {
                timer_at,
                start_time,
                consumed,
            } => {
                if *consumed || *timer_at > now || start_time.is_some_and(|start| now < start) {
                    return false;
                }
                *consumed = true;
                true
            }
        }
    }

    /// Skip occurrences before `now`; a repeat never fires for time it spent disabled
    pub(crate) fn rearm(&mut self, now: DateTime<Utc>) {
        if let TriggerState::Repeat { cursor, .. } = self {
            *cursor = (*cursor).max(now);
        }
    }

    /// Whether the trigger can never fire again
    pub(crate) fn is_exhausted(&self, timezone: Tz) -> bool {
        match self {
            TriggerState::Repeat {
                schedule,
                remaining,
                cursor,
                end_time,
            } => {
                if *remaining == Some(0) {
                    return true;
                }
                match next_fire_after(schedule, *cursor, timezone) {
                    None => true,
                    Some(next) => end_time.is_some_and(|end| next > end),
                }
            }
            TriggerState::Timer { consumed, .. } => *consumed,
        }
    }
}

/// Scheduler-side state of one plan instance
#[derive(Debug)]
pub(crate) struct PlanEntry {
    pub(crate) plan: Plan,
    pub(crate) triggers: Vec<TriggerState>,
    pub(crate) retired: bool,
    pub(crate) defect: Option<ScheduleError>,
    pub(crate) in_flight: Arc<AtomicUsize>,
    pub(crate) firings: u64,
}

impl PlanEntry {
    /// Build the state of a fresh plan instance. A trigger that fails to
    /// compile leaves the plan disabled with the error recorded.
    pub(crate) fn new(mut plan: Plan, armed_at: DateTime<Utc>) -> Self {
        let compiled: Result<Vec<_>, _> = plan
            .triggers
            .iter()
            .map(|trigger| TriggerState::new(trigger, armed_at))
            .collect();

        let (triggers, defect) = match compiled {
            Ok(triggers) => (triggers, None),
            Err(e) => {
                plan.is_enabled = false;
                (Vec::new(), Some(e))
            }
        };

        Self {
            plan,
            triggers,
            retired: false,
            defect,
            in_flight: Arc::new(AtomicUsize::new(0)),
            firings: 0,
        }
    }

    pub(crate) fn state(&self) -> PlanState {
        if self.retired {
            PlanState::Retired
        } else if !self.plan.is_enabled {
            PlanState::Disabled
        } else if self.in_flight.load(Ordering::Acquire) > 0 {
            PlanState::Firing
        } else {
            PlanState::Armed
        }
    }

    /// Flip the enabled flag. Re-enabling moves repeat cursors up to `now`.
    pub(crate) fn set_enabled(&mut self, enabled: bool, now: DateTime<Utc>) {
        if enabled && !self.plan.is_enabled {
            for trigger in &mut self.triggers {
                trigger.rearm(now);
            }
        }
        self.plan.is_enabled = enabled;
    }

    pub(crate) fn is_active(&self) -> bool {
        !self.retired && self.plan.is_enabled
    }

    /// Fire every due trigger, returning the kinds fired
    pub(crate) fn evaluate(&mut self, now: DateTime<Utc>, timezone: Tz) -> Vec<&'static str> {
        let mut fired = Vec::new();
        for (state, trigger) in self.triggers.iter_mut().zip(self.plan.triggers.iter_mut()) {
            if !state.fire_if_due(now, timezone) {
                continue;
            }
            fired.push(state.kind());
            if let (Trigger::Repeat { repeat_time, .. }, Some(left)) = (trigger, state.remaining()) {
                *repeat_time = left as i64;
            }
        }
        self.firings += fired.len() as u64;
        fired
    }

    /// Whether no trigger can fire again
    pub(crate) fn is_spent(&self, timezone: Tz) -> bool {
        self.triggers.iter().all(|t| t.is_exhausted(timezone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    fn plan(triggers: Vec<Trigger>) -> Plan {
        Plan {
            id: "plan-1".to_string(),
            name: "test".to_string(),
            triggers,
            sub_plans: Vec::new(),
            is_enabled: true,
        }
    }

    #[test]
    fn test_repeat_fires_once_per_occurrence() {
        let mut entry = PlanEntry::new(plan(vec![Trigger::repeat("* * * * *", -1, at(10, 0, 0))]), at(10, 0, 0));
        let tz = chrono_tz::UTC;

        assert!(entry.evaluate(at(10, 0, 30), tz).is_empty());
        assert_eq!(entry.evaluate(at(10, 1, 0), tz), vec!["repeat"]);
        // Same minute, already fired
        assert!(entry.evaluate(at(10, 1, 1), tz).is_empty());
        assert_eq!(entry.evaluate(at(10, 2, 0), tz), vec!["repeat"]);
    }

    #[test]
    fn test_missed_occurrences_collapse() {
        let mut entry = PlanEntry::new(plan(vec![Trigger::repeat("* * * * *", 10, at(10, 0, 0))]), at(10, 0, 0));
        let tz = chrono_tz::UTC;

        // Ten minutes late: one firing only
        assert_eq!(entry.evaluate(at(10, 10, 5), tz).len(), 1);
        assert!(entry.evaluate(at(10, 10, 6), tz).is_empty());
        assert_eq!(entry.triggers[0].remaining(), Some(9));
        match &entry.plan.triggers[0] {
            Trigger::Repeat { repeat_time, .. } => assert_eq!(*repeat_time, 9),
            other => panic!("unexpected trigger {:?}", other),
        }
    }

    #[test]
    fn test_bounded_repeat_is_spent() {
        let mut entry = PlanEntry::new(plan(vec![Trigger::repeat("* * * * *", 1, at(10, 0, 0))]), at(10, 0, 0));
        let tz = chrono_tz::UTC;
        assert!(!entry.is_spent(tz));
        assert_eq!(entry.evaluate(at(10, 1, 0), tz).len(), 1);
        assert!(entry.is_spent(tz));
        assert!(entry.evaluate(at(10, 2, 0), tz).is_empty());
    }

    #[test]
    fn test_cursor_starts_at_arming_time() {
        // Start time long ago, armed now: no replay of the past
        let armed = at(12, 0, 30);
        let mut entry = PlanEntry::new(plan(vec![Trigger::repeat("* * * * *", -1, at(0, 0, 0))]), armed);
        assert!(entry.evaluate(armed, chrono_tz::UTC).is_empty());
        assert_eq!(entry.evaluate(at(12, 1, 0), chrono_tz::UTC).len(), 1);
    }

    #[test]
    fn test_repeat_respects_end_time() {
        let trigger = Trigger::Repeat {
            repeat_at: "* * * * *".to_string(),
            repeat_time: -1,
            start_time: at(10, 0, 0),
            end_time: Some(at(10, 1, 30)),
        };
        let mut entry = PlanEntry::new(plan(vec![trigger]), at(10, 0, 0));
        let tz = chrono_tz::UTC;
        assert_eq!(entry.evaluate(at(10, 1, 0), tz).len(), 1);
        assert!(entry.is_spent(tz));
        assert!(entry.evaluate(at(10, 2, 0), tz).is_empty());
    }

    #[test]
    fn test_reenable_skips_occurrences_while_disabled() {
        let tz = chrono_tz::UTC;
        let mut entry = PlanEntry::new(plan(vec![Trigger::repeat("0 * * * *", -1, at(10, 0, 0))]), at(10, 5, 0));

        entry.set_enabled(false, at(10, 10, 0));
        assert!(!entry.is_active());
        entry.set_enabled(true, at(11, 20, 0));

        // 11:00 passed while disabled
        assert!(entry.evaluate(at(11, 30, 0), tz).is_empty());
        assert_eq!(entry.evaluate(at(12, 0, 0), tz), vec!["repeat"]);
    }

    #[test]
    fn test_enable_when_already_enabled_keeps_cursor() {
        let tz = chrono_tz::UTC;
        let mut entry = PlanEntry::new(plan(vec![Trigger::repeat("0 * * * *", -1, at(10, 0, 0))]), at(10, 5, 0));

        entry.set_enabled(true, at(11, 20, 0));
        assert_eq!(entry.evaluate(at(11, 30, 0), tz), vec!["repeat"]);
    }

    #[test]
    fn test_timer_fires_once() {
        let mut entry = PlanEntry::new(plan(vec![Trigger::timer(at(9, 0, 0))]), at(10, 0, 0));
        let tz = chrono_tz::UTC;
        assert_eq!(entry.evaluate(at(10, 0, 0), tz), vec!["timer"]);
        assert!(entry.is_spent(tz));
        assert!(entry.evaluate(at(10, 0, 1) + Duration::days(1), tz).is_empty());
    }

    #[test]
    fn test_malformed_cron_disables_plan() {
        let entry = PlanEntry::new(plan(vec![Trigger::repeat("not a cron", -1, at(0, 0, 0))]), at(0, 0, 0));
        assert_eq!(entry.state(), PlanState::Disabled);
        assert!(matches!(
            entry.defect,
            Some(ScheduleError::InvalidCronExpression { .. })
        ));
    }

    #[test]
    fn test_state_reflects_in_flight_work() {
        let entry = PlanEntry::new(plan(vec![Trigger::timer(at(9, 0, 0))]), at(0, 0, 0));
        assert_eq!(entry.state(), PlanState::Armed);
        entry.in_flight.fetch_add(1, Ordering::AcqRel);
        assert_eq!(entry.state(), PlanState::Firing);
    }
}
