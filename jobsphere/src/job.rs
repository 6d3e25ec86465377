// Job: a named unit of work with a concurrency ceiling and optional
// token-bucket admission control
//
// Execution never returns an error to the caller: rate-limited invocations
// are skipped with a log line, and action failures become Faulted events.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::errors::{ConfigError, RuntimeError};
use crate::events::{ComponentKind, Event, EventSource, Hook};
use crate::rate_limit::TokenBucket;

type JobAction = Arc<dyn Fn(Option<Context>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Construction-time settings for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    /// Concurrency ceiling, doubling as the rate-limiter token capacity.
    /// Must be at least 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Token-bucket replenishment period; `None` disables rate limiting.
    #[serde(default)]
    pub rate_limit_period: Option<Duration>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_concurrent() -> usize {
    1
}

fn default_enabled() -> bool {
    true
}

impl JobConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            max_concurrent: default_max_concurrent(),
            rate_limit_period: None,
            enabled: default_enabled(),
        }
    }
}

struct JobShared {
    id: Uuid,
    name: String,
    group: Option<String>,
    max_concurrent: usize,
    enabled: AtomicBool,
    action: JobAction,
    limiter: Option<TokenBucket>,
    faulted: Hook,
}

/// A named unit of work. Cloning is cheap and shares all state.
#[derive(Clone)]
pub struct Job {
    shared: Arc<JobShared>,
}

impl Job {
    /// Validate the configuration and bind the action. A rejected
    /// configuration raises Faulted *and* returns the error — the only path
    /// where both happen.
    pub fn new<F, Fut>(config: JobConfig, action: F) -> Result<Self, ConfigError>
    where
        F: Fn(Option<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let faulted = Hook::new("job_faulted");

        if let Err(e) = validate(&config) {
            error!(job = %config.name, error = %e, "job configuration rejected");
            faulted.emit_logged(Event::faulted(
                EventSource {
                    id: Uuid::new_v4(),
                    name: config.name.clone(),
                    group: config.group.clone(),
                    kind: ComponentKind::Job,
                },
                None,
                Arc::new(RuntimeError::ConfigRejected {
                    reason: e.to_string(),
                }),
            ));
            return Err(e);
        }

        let limiter = config
            .rate_limit_period
            .map(|period| TokenBucket::new(config.max_concurrent as u32, period));

        let action: JobAction = Arc::new(move |context| Box::pin(action(context)));

        let job = Self {
            shared: Arc::new(JobShared {
                id: Uuid::new_v4(),
                name: config.name,
                group: config.group,
                max_concurrent: config.max_concurrent,
                enabled: AtomicBool::new(config.enabled),
                action,
                limiter,
                faulted,
            }),
        };

        debug!(job = %job, rate_limited = job.is_rate_limited(), "job configured");
        Ok(job)
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn group(&self) -> Option<&str> {
        self.shared.group.as_deref()
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.max_concurrent
    }

    pub fn is_rate_limited(&self) -> bool {
        self.shared.limiter.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    /// Disabled jobs stay registered but are skipped at fan-out.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn on_faulted<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.faulted.subscribe(handler);
    }

    pub(crate) fn source(&self) -> EventSource {
        EventSource {
            id: self.shared.id,
            name: self.shared.name.clone(),
            group: self.shared.group.clone(),
            kind: ComponentKind::Job,
        }
    }

    /// Run the action once. Skipped without error when cancellation was
    /// requested or the rate limiter has no token; an action failure becomes
    /// a Faulted event, never an error to the caller.
    pub async fn execute(&self, context: Option<Context>, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            debug!(job = %self, "execution skipped, cancellation requested");
            return;
        }

        if let Some(limiter) = &self.shared.limiter {
            if !limiter.try_acquire().await {
                warn!(job = %self, "execution skipped by rate limiter");
                counter!("job_skipped_total", "job" => self.shared.name.clone()).increment(1);
                return;
            }
        }

        match (self.shared.action)(context.clone()).await {
            Ok(()) => {
                debug!(job = %self, "job executed");
                counter!("job_executed_total", "job" => self.shared.name.clone()).increment(1);
            }
            Err(e) => {
                counter!("job_faulted_total", "job" => self.shared.name.clone()).increment(1);
                self.raise_faulted(
                    context,
                    Arc::new(RuntimeError::JobFailed {
                        job: self.shared.name.clone(),
                        reason: e.to_string(),
                    }),
                );
            }
        }
    }

    /// Faulted is a terminal sink: its own handler errors are logged, never
    /// re-raised.
    fn raise_faulted(&self, context: Option<Context>, error: Arc<RuntimeError>) {
        error!(job = %self, error = %error, "job faulted");
        self.shared
            .faulted
            .emit_logged(Event::faulted(self.source(), context, error));
    }
}

fn validate(config: &JobConfig) -> Result<(), ConfigError> {
    if config.name.trim().is_empty() {
        return Err(ConfigError::MissingJobName);
    }
    if config.max_concurrent < 1 {
        return Err(ConfigError::MaxConcurrentTooLow);
    }
    if config
        .rate_limit_period
        .is_some_and(|period| period.is_zero())
    {
        return Err(ConfigError::InvalidRateLimiterPeriod);
    }
    Ok(())
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shared.group {
            Some(group) => write!(f, "[{}:{}]", group, self.shared.name),
            None => write!(f, "[{}]", self.shared.name),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.shared.name)
            .field("group", &self.shared.group)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
