// Cron-driven trigger
//
// Every eligible tick fires; the cadence decides when ticks happen. The
// engine reprograms the one-shot timer from "now" after each tick, with the
// forward-skip guard living in the schedule module.

use async_trait::async_trait;
use chrono_tz::Tz;

use crate::context::Context;
use crate::errors::{ConfigError, RuntimeError};
use crate::schedule::CronCadence;
use crate::trigger::engine::{Cadence, FiringStrategy, Trigger, TriggerConfig};

/// Firing decision for cron triggers: an eligible tick always fires.
struct ScheduledFiring;

#[async_trait]
impl FiringStrategy for ScheduledFiring {
    async fn fire(&self, _context: Option<Context>) -> Result<bool, RuntimeError> {
        Ok(true)
    }
}

impl Trigger {
    /// Build a cron-driven trigger. `None` or an empty expression falls
    /// back to the every-5-minutes default; 5-field (minute precision) and
    /// 6-field (second precision) syntax are auto-detected. Malformed
    /// expressions fail here, not at fire time.
    pub fn scheduled(
        config: TriggerConfig,
        cron_expression: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let cadence = CronCadence::parse(cron_expression)?;
        Trigger::new(config, Cadence::Cron(cadence), ScheduledFiring)
    }

    /// Like [`Trigger::scheduled`], with occurrences evaluated in the given
    /// timezone instead of UTC.
    pub fn scheduled_in_zone(
        config: TriggerConfig,
        cron_expression: Option<&str>,
        timezone: Tz,
    ) -> Result<Self, ConfigError> {
        let cadence = CronCadence::parse(cron_expression)?.with_timezone(timezone);
        Trigger::new(config, Cadence::Cron(cadence), ScheduledFiring)
    }
}
