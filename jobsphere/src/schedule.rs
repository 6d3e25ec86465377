// Cron schedule parsing and next-occurrence calculation
//
// Expressions are validated eagerly at configuration time; a malformed
// expression is never discovered at fire time. Occurrence math runs in UTC
// unless a timezone is attached.

use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use tracing::warn;

use crate::errors::{ConfigError, RuntimeError};

/// Pattern applied when no expression is supplied: every 5 minutes.
pub const DEFAULT_CRON_EXPRESSION: &str = "0 0/5 * * * *";

/// Minutes skipped forward when a computed occurrence already lies in the
/// past (clock drift from a long tick). Inherited behavior; the value has no
/// documented rationale.
const FORWARD_SKIP_MINUTES: i64 = 2;

/// A parsed cron cadence with optional timezone-aware occurrence math.
#[derive(Debug, Clone)]
pub struct CronCadence {
    expression: String,
    schedule: CronSchedule,
    timezone: Option<Tz>,
}

impl CronCadence {
    /// Parse an expression, auto-detecting 5-field (minute precision) vs
    /// 6-field (second precision) syntax by field count. `None` or an empty
    /// string falls back to [`DEFAULT_CRON_EXPRESSION`].
    pub fn parse(expression: Option<&str>) -> Result<Self, ConfigError> {
        let raw = match expression {
            Some(expr) if !expr.trim().is_empty() => expr.trim().to_string(),
            _ => DEFAULT_CRON_EXPRESSION.to_string(),
        };

        // The parser always wants a seconds field; a 5-field expression is
        // minute precision, so pin seconds to zero.
        let normalized = if raw.split_whitespace().count() == 5 {
            format!("0 {raw}")
        } else {
            raw.clone()
        };

        let schedule =
            CronSchedule::from_str(&normalized).map_err(|e| ConfigError::InvalidCronExpression {
                expression: raw.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expression: raw,
            schedule,
            timezone: None,
        })
    }

    /// Evaluate occurrences in the given timezone instead of UTC.
    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = Some(timezone);
        self
    }

    /// The expression as configured (before seconds normalization).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next occurrence strictly after `after`, in UTC.
    pub fn occurrence_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.timezone {
            Some(tz) => self
                .schedule
                .after(&after.with_timezone(&tz))
                .next()
                .map(|next| next.with_timezone(&Utc)),
            None => self.schedule.after(&after).next(),
        }
    }

    /// Next occurrence after now, in UTC.
    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        self.occurrence_after(Utc::now())
    }

    /// Delay from now until the next occurrence. An occurrence that already
    /// lies in the past is recomputed from [`FORWARD_SKIP_MINUTES`] beyond
    /// it rather than fired immediately.
    pub fn next_delay(&self) -> Result<std::time::Duration, RuntimeError> {
        let mut next = self.next_occurrence().ok_or_else(|| self.exhausted())?;

        if next < Utc::now() {
            warn!(
                expression = %self.expression,
                missed = %next,
                "computed occurrence is in the past, skipping forward"
            );
            next = self
                .occurrence_after(next + ChronoDuration::minutes(FORWARD_SKIP_MINUTES))
                .ok_or_else(|| self.exhausted())?;
        }

        let delay = (next - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        Ok(delay)
    }

    fn exhausted(&self) -> RuntimeError {
        RuntimeError::NoNextOccurrence {
            expression: self.expression.clone(),
        }
    }
}
