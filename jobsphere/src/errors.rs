// Error handling framework
//
// Configuration errors are returned synchronously to the caller and are
// never retried. Everything that fails after activation is converted into a
// Faulted event carrying a RuntimeError; runtime failures never unwind
// across a task boundary.

use thiserror::Error;

/// Errors raised while building or configuring components. Fatal to the
/// operation that produced them.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("max_concurrent must be at least 1")]
    MaxConcurrentTooLow,

    #[error("job name must not be empty")]
    MissingJobName,

    #[error("rate limiter period must be greater than zero")]
    InvalidRateLimiterPeriod,

    #[error("no triggers have been added to the orchestrator")]
    NoTriggers,

    #[error("no jobs have been added to the orchestrator")]
    NoJobs,
}

/// Failures observed after activation. Carried by Faulted events instead of
/// being returned to the caller.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("no next occurrence for cron expression '{expression}'")]
    NoNextOccurrence { expression: String },

    #[error("firing predicate failed: {reason}")]
    PredicateFailed { reason: String },

    #[error("job '{job}' execution failed: {reason}")]
    JobFailed { job: String, reason: String },

    #[error("{event} handler failed: {reason}")]
    HandlerFailed { event: &'static str, reason: String },

    #[error("configuration rejected: {reason}")]
    ConfigRejected { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidCronExpression {
            expression: "* * * *".to_string(),
            reason: "invalid format".to_string(),
        };
        assert!(err.to_string().contains("invalid cron expression"));
        assert!(err.to_string().contains("* * * *"));
    }

    #[test]
    fn runtime_error_carries_handler_event_name() {
        let err = RuntimeError::HandlerFailed {
            event: "triggered",
            reason: "subscriber exploded".to_string(),
        };
        assert!(err.to_string().contains("triggered handler failed"));
    }
}
