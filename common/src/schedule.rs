// Schedule parsing and next fire time calculation
//
// Cron patterns follow the `cron` crate grammar (seconds first). Classic
// five-field patterns are accepted by prepending a zero seconds field. Day of
// week uses the crate's numbering (1 = Sunday) or names (MON-FRI).

use crate::errors::ScheduleError;
use crate::models::Trigger;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::borrow::Cow;
use std::str::FromStr;

/// Expand a five-field pattern to the seconds-first form
pub fn normalize_cron_expression(expression: &str) -> Cow<'_, str> {
    let trimmed = expression.trim();
    if trimmed.split_whitespace().count() == 5 {
        Cow::Owned(format!("0 {}", trimmed))
    } else {
        Cow::Borrowed(trimmed)
    }
}

/// Parse and validate a cron expression
pub fn parse_cron_expression(expression: &str) -> Result<CronSchedule, ScheduleError> {
    let normalized = normalize_cron_expression(expression);
    CronSchedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCronExpression {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Parse an IANA timezone name
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

/// First occurrence of `schedule` strictly after `after`, evaluated in `timezone`
pub fn next_fire_after(
    schedule: &CronSchedule,
    after: DateTime<Utc>,
    timezone: Tz,
) -> Option<DateTime<Utc>> {
    let after_in_tz = after.with_timezone(&timezone);
    schedule
        .after(&after_in_tz)
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Parse `pattern` and compute its next occurrence after `after` in UTC
pub fn next_fire_after_pattern(
    pattern: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ScheduleError> {
    let schedule = parse_cron_expression(pattern)?;
    Ok(next_fire_after(&schedule, after, chrono_tz::UTC))
}

/// Reject trigger definitions that can never be evaluated
pub fn validate_trigger(trigger: &Trigger) -> Result<(), ScheduleError> {
    if let (Some(start), Some(end)) = (trigger.start_time(), trigger.end_time()) {
        if end < start {
            return Err(ScheduleError::InvalidTrigger(format!(
                "end_time {} is before start_time {}",
                end, start
            )));
        }
    }

    match trigger {
        Trigger::Repeat { repeat_at, .. } => {
            parse_cron_expression(repeat_at)?;
        }
        Trigger::Timer {
            timer_at,
            start_time,
            end_time,
        } => {
            if start_time.is_some_and(|start| *timer_at < start)
                || end_time.is_some_and(|end| *timer_at > end)
            {
                return Err(ScheduleError::InvalidTrigger(format!(
                    "timer_at {} falls outside the trigger window",
                    timer_at
                )));
            }
        }
    }

    Ok(())
}
