// Orchestrator: binds triggers to jobs and owns aggregate lifecycle control
//
// Every trigger event is re-raised as the orchestrator's own aggregate
// event of the same kind. Each firing fans out to all enabled jobs on
// detached tasks, so one slow job delays neither its peers nor the next
// tick. No transaction spans a firing and its job executions: a job failure
// never rolls back the trigger's counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::context::Context;
use crate::errors::{ConfigError, RuntimeError};
use crate::events::{ComponentKind, Event, EventSource, Hook};
use crate::job::Job;
use crate::trigger::Trigger;

struct Hooks {
    triggered: Hook,
    canceled: Hook,
    completed: Hook,
    faulted: Hook,
    before_job: Hook,
    after_job: Hook,
}

struct Inner {
    id: Uuid,
    triggers: RwLock<Vec<Trigger>>,
    jobs: RwLock<Vec<Job>>,
    counter: AtomicU64,
    last_triggered: RwLock<Option<DateTime<Utc>>>,
    cancel: RwLock<CancellationToken>,
    hooks: Hooks,
}

/// Aggregates triggers and jobs under one start/stop lifecycle.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                triggers: RwLock::new(Vec::new()),
                jobs: RwLock::new(Vec::new()),
                counter: AtomicU64::new(0),
                last_triggered: RwLock::new(None),
                cancel: RwLock::new(CancellationToken::new()),
                hooks: Hooks {
                    triggered: Hook::new("triggered"),
                    canceled: Hook::new("canceled"),
                    completed: Hook::new("completed"),
                    faulted: Hook::new("faulted"),
                    before_job: Hook::new("before_job_executed"),
                    after_job: Hook::new("after_job_executed"),
                },
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Register a trigger and subscribe the aggregate forwarders. The
    /// orchestrator owns the trigger from here on.
    pub fn add_trigger(&self, trigger: Trigger) {
        info!(trigger = %trigger.name(), "adding trigger");

        let weak = Arc::downgrade(&self.inner);

        trigger.on_triggered({
            let weak = weak.clone();
            move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        Inner::handle_triggered(&inner, event);
                    }
                    Ok(())
                }
            }
        });

        trigger.on_canceled({
            let weak = weak.clone();
            move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        info!(trigger = %event.source, "trigger canceled");
                        Inner::raise(&inner, &inner.hooks.canceled, event);
                    }
                    Ok(())
                }
            }
        });

        trigger.on_completed({
            let weak = weak.clone();
            move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        info!(trigger = %event.source, "trigger completed");
                        Inner::raise(&inner, &inner.hooks.completed, event);
                    }
                    Ok(())
                }
            }
        });

        trigger.on_faulted({
            let weak = weak.clone();
            move |event| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        error!(trigger = %event.source, "trigger faulted");
                        // faulted is a terminal sink, handler errors stay logged
                        inner.hooks.faulted.emit_logged(event);
                    }
                    Ok(())
                }
            }
        });

        self.inner
            .triggers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(trigger);
    }

    /// Register a job and forward its faults into the aggregate Faulted
    /// event.
    pub fn add_job(&self, job: Job) {
        info!(job = %job, "adding job");

        let weak = Arc::downgrade(&self.inner);
        job.on_faulted(move |event| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.hooks.faulted.emit_logged(event);
                }
                Ok(())
            }
        });

        self.inner
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
    }

    /// Activate every trigger with the same context and cancellation
    /// signal. Requires at least one trigger and one job.
    pub async fn start(
        &self,
        context: Option<Context>,
        cancel: CancellationToken,
    ) -> Result<(), ConfigError> {
        info!("starting orchestrator");

        let triggers: Vec<Trigger> = self
            .inner
            .triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if triggers.is_empty() {
            return Err(ConfigError::NoTriggers);
        }
        if self
            .inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
        {
            return Err(ConfigError::NoJobs);
        }

        *self
            .inner
            .cancel
            .write()
            .unwrap_or_else(PoisonError::into_inner) = cancel.clone();

        for trigger in triggers {
            info!(trigger = %trigger.name(), "activating trigger");
            trigger.activate(context.clone(), cancel.clone());
        }

        Ok(())
    }

    /// Deactivate every trigger. Safe even if start was never called.
    pub async fn stop(&self, reason: &str, context: Option<Context>) {
        info!(reason, "stopping orchestrator");

        let triggers: Vec<Trigger> = self
            .inner
            .triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for trigger in triggers {
            info!(trigger = %trigger.name(), "deactivating trigger");
            trigger.deactivate(reason, context.clone());
        }
    }

    /// Aggregate firings observed so far.
    pub fn counter(&self) -> u64 {
        self.inner.counter.load(Ordering::SeqCst)
    }

    pub fn last_triggered(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .last_triggered
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn triggers(&self) -> Vec<Trigger> {
        self.inner
            .triggers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn on_triggered<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.hooks.triggered.subscribe(handler);
    }

    pub fn on_canceled<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.hooks.canceled.subscribe(handler);
    }

    pub fn on_completed<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.hooks.completed.subscribe(handler);
    }

    pub fn on_faulted<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.hooks.faulted.subscribe(handler);
    }

    pub fn on_before_job_executed<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.hooks.before_job.subscribe(handler);
    }

    pub fn on_after_job_executed<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.hooks.after_job.subscribe(handler);
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("id", &self.inner.id)
            .field("triggers", &self.triggers().len())
            .field("jobs", &self.jobs().len())
            .field("counter", &self.counter())
            .finish()
    }
}

impl Inner {
    fn source(&self) -> EventSource {
        EventSource {
            id: self.id,
            name: "orchestrator".to_string(),
            group: None,
            kind: ComponentKind::Orchestrator,
        }
    }

    fn handle_triggered(inner: &Arc<Inner>, event: Event) {
        *inner
            .last_triggered
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        inner.counter.fetch_add(1, Ordering::SeqCst);
        counter!("orchestrator_triggered_total").increment(1);

        info!(trigger = %event.source, "trigger fired, fanning out to enabled jobs");
        Inner::raise(inner, &inner.hooks.triggered, event.clone());

        let jobs: Vec<Job> = inner
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|job| job.is_enabled())
            .cloned()
            .collect();
        debug!(count = jobs.len(), "jobs to execute");

        let cancel = inner
            .cancel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for job in jobs {
            let inner = inner.clone();
            let context = event.context.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                Inner::raise(
                    &inner,
                    &inner.hooks.before_job,
                    Event::new(job.source(), context.clone()),
                );
                job.execute(context.clone(), &cancel).await;
                Inner::raise(
                    &inner,
                    &inner.hooks.after_job,
                    Event::new(job.source(), context),
                );
            });
        }
    }

    /// Emit on an aggregate hook, re-routing handler errors into the
    /// aggregate Faulted event.
    fn raise(inner: &Arc<Inner>, hook: &Hook, event: Event) {
        let weak = Arc::downgrade(inner);
        let context = event.context.clone();
        hook.emit(event, move |err| {
            if let Some(inner) = weak.upgrade() {
                Inner::raise_faulted(&inner, context.clone(), Arc::new(err));
            }
        });
    }

    fn raise_faulted(inner: &Arc<Inner>, context: Option<Context>, error: Arc<RuntimeError>) {
        error!(error = %error, "orchestrator fault");
        let event = Event::faulted(inner.source(), context, error);
        inner.hooks.faulted.emit_logged(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobConfig;
    use crate::trigger::{TriggerConfig, TriggerState};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::sleep;

    fn manual_trigger(name: &str) -> Trigger {
        // zero delay: the test drives ticks
        Trigger::event(TriggerConfig::named(name), Duration::ZERO, |_context| async {
            Ok(true)
        })
        .unwrap()
    }

    fn counting_job(name: &str, runs: Arc<AtomicUsize>) -> Job {
        Job::new(JobConfig::named(name), move |_context| {
            let runs = runs.clone();
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap()
    }

    fn counting_hook(counter: Arc<AtomicUsize>) -> impl Fn(Event) -> futures::future::Ready<anyhow::Result<()>> {
        move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn start_without_triggers_is_a_configuration_error() {
        let orchestrator = Orchestrator::new();
        let runs = Arc::new(AtomicUsize::new(0));
        orchestrator.add_job(counting_job("orphan", runs.clone()));

        let err = orchestrator
            .start(None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoTriggers));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn start_without_jobs_is_a_configuration_error() {
        let orchestrator = Orchestrator::new();
        orchestrator.add_trigger(manual_trigger("lonely"));

        let err = orchestrator
            .start(None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoJobs));
    }

    #[tokio::test]
    async fn firing_fans_out_to_enabled_jobs_with_lifecycle_events() {
        let orchestrator = Orchestrator::new();
        let trigger = manual_trigger("fan-out");
        orchestrator.add_trigger(trigger.clone());

        let runs = Arc::new(AtomicUsize::new(0));
        orchestrator.add_job(counting_job("first", runs.clone()));
        orchestrator.add_job(counting_job("second", runs.clone()));

        let disabled_runs = Arc::new(AtomicUsize::new(0));
        let disabled = counting_job("disabled", disabled_runs.clone());
        disabled.set_enabled(false);
        orchestrator.add_job(disabled);

        let mirrored = Arc::new(AtomicUsize::new(0));
        orchestrator.on_triggered(counting_hook(mirrored.clone()));
        let before = Arc::new(AtomicUsize::new(0));
        orchestrator.on_before_job_executed(counting_hook(before.clone()));
        let after = Arc::new(AtomicUsize::new(0));
        orchestrator.on_after_job_executed(counting_hook(after.clone()));

        orchestrator
            .start(None, CancellationToken::new())
            .await
            .unwrap();
        trigger.tick().await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(orchestrator.counter(), 1);
        assert!(orchestrator.last_triggered().is_some());
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(disabled_runs.load(Ordering::SeqCst), 0);
        assert_eq!(mirrored.load(Ordering::SeqCst), 1);
        assert_eq!(before.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_completes_every_trigger_and_mirrors_the_event() {
        let orchestrator = Orchestrator::new();
        let trigger = manual_trigger("stoppable");
        orchestrator.add_trigger(trigger.clone());
        let runs = Arc::new(AtomicUsize::new(0));
        orchestrator.add_job(counting_job("worker", runs));

        let completed = Arc::new(AtomicUsize::new(0));
        orchestrator.on_completed(counting_hook(completed.clone()));

        orchestrator
            .start(None, CancellationToken::new())
            .await
            .unwrap();
        orchestrator.stop("shutting down", None).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(trigger.state(), TriggerState::Completed);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let orchestrator = Orchestrator::new();
        orchestrator.add_trigger(manual_trigger("early"));

        orchestrator.stop("never started", None).await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(orchestrator.triggers()[0].state(), TriggerState::Completed);
    }

    #[tokio::test]
    async fn job_faults_surface_as_aggregate_faulted_events() {
        let orchestrator = Orchestrator::new();
        let trigger = manual_trigger("fault-path");
        orchestrator.add_trigger(trigger.clone());
        orchestrator.add_job(
            Job::new(JobConfig::named("doomed"), |_context| async {
                Err(anyhow::anyhow!("disk on fire"))
            })
            .unwrap(),
        );

        let faults = Arc::new(AtomicUsize::new(0));
        orchestrator.on_faulted(counting_hook(faults.clone()));

        orchestrator
            .start(None, CancellationToken::new())
            .await
            .unwrap();
        trigger.tick().await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(faults.load(Ordering::SeqCst), 1);
        // the firing itself still counted
        assert_eq!(orchestrator.counter(), 1);
    }

    #[tokio::test]
    async fn context_flows_unchanged_to_jobs() {
        let orchestrator = Orchestrator::new();
        let trigger = manual_trigger("ctx");
        orchestrator.add_trigger(trigger.clone());

        let matched = Arc::new(AtomicUsize::new(0));
        let seen = matched.clone();
        orchestrator.add_job(
            Job::new(JobConfig::named("inspector"), move |context| {
                let seen = seen.clone();
                async move {
                    if context.as_ref().and_then(|ctx| ctx.get::<&'static str>())
                        == Some(&"batch-7")
                    {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            })
            .unwrap(),
        );

        orchestrator
            .start(Some(Context::new("batch-7")), CancellationToken::new())
            .await
            .unwrap();
        trigger.tick().await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(matched.load(Ordering::SeqCst), 1);
    }
}
