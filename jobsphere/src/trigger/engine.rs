// Trigger engine: the state machine shared by every trigger variant
//
// One engine owns the timer task, the concurrency semaphore, the occurrence
// counter, and lifecycle-event dispatch. The per-tick "attempt one firing"
// decision is delegated to a FiringStrategy, so the gating logic exists
// exactly once. Within one tick the sequence acquire → budget check →
// increment → fire is totally ordered; across ticks and triggers nothing is.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::Context;
use crate::errors::{ConfigError, RuntimeError};
use crate::events::{ComponentKind, Event, EventSource, Hook};
use crate::schedule::CronCadence;

/// Lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerState {
    /// Configured but not yet activated.
    Configured,
    /// Timer running, or externally driven when the delay is zero.
    Active,
    /// Terminal: deactivated by budget exhaustion or an external stop.
    Completed,
    /// Terminal: deactivated because cancellation was requested.
    Canceled,
}

/// Construction-time settings shared by every trigger variant. Immutable
/// once the trigger is activated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    /// Concurrency ceiling for tick executions. Must be at least 1.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Occurrence budget; 0 means unlimited.
    #[serde(default)]
    pub max_occurrences: u64,
    /// Run one tick immediately at activation in addition to the normal
    /// schedule.
    #[serde(default)]
    pub fire_on_start: bool,
}

fn default_max_concurrent() -> usize {
    1
}

impl TriggerConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: None,
            max_concurrent: default_max_concurrent(),
            max_occurrences: 0,
            fire_on_start: false,
        }
    }
}

/// The per-tick firing decision. Implementations decide whether an eligible
/// tick produces a Triggered event.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FiringStrategy: Send + Sync {
    /// Attempt one firing. `Ok(true)` raises Triggered, `Ok(false)` is a
    /// benign skip (the occurrence was still consumed), and `Err` becomes a
    /// Faulted event without deactivating the trigger.
    async fn fire(&self, context: Option<Context>) -> Result<bool, RuntimeError>;
}

/// How the engine's timer runs.
#[derive(Debug, Clone)]
pub enum Cadence {
    /// Fixed-period ticking. A zero delay disables self-ticking; the caller
    /// drives [`Trigger::tick`] externally.
    Fixed(Duration),
    /// Cron-driven: a one-shot timer reprogrammed after every tick.
    Cron(CronCadence),
}

struct Hooks {
    triggered: Hook,
    canceled: Hook,
    completed: Hook,
    faulted: Hook,
}

struct Shared {
    id: Uuid,
    config: TriggerConfig,
    cadence: Cadence,
    strategy: Box<dyn FiringStrategy>,
    counter: AtomicU64,
    semaphore: Semaphore,
    state: RwLock<TriggerState>,
    deactivated: AtomicBool,
    /// Internal shutdown for the timer task; cancelled by deactivation.
    stopped: CancellationToken,
    /// External cancellation supplied at activation.
    cancel: RwLock<CancellationToken>,
    context: RwLock<Option<Context>>,
    hooks: Hooks,
}

/// A configured trigger bound to its firing strategy. Cloning is cheap and
/// shares all state.
#[derive(Clone)]
pub struct Trigger {
    shared: Arc<Shared>,
}

impl Trigger {
    /// Validate the configuration and bind the firing strategy. Does not
    /// start timing.
    pub fn new(
        config: TriggerConfig,
        cadence: Cadence,
        strategy: impl FiringStrategy + 'static,
    ) -> Result<Self, ConfigError> {
        if config.max_concurrent < 1 {
            return Err(ConfigError::MaxConcurrentTooLow);
        }

        info!(
            trigger = %config.name,
            max_concurrent = config.max_concurrent,
            max_occurrences = %budget_display(config.max_occurrences),
            "trigger configured"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                id: Uuid::new_v4(),
                semaphore: Semaphore::new(config.max_concurrent),
                config,
                cadence,
                strategy: Box::new(strategy),
                counter: AtomicU64::new(0),
                state: RwLock::new(TriggerState::Configured),
                deactivated: AtomicBool::new(false),
                stopped: CancellationToken::new(),
                cancel: RwLock::new(CancellationToken::new()),
                context: RwLock::new(None),
                hooks: Hooks {
                    triggered: Hook::new("triggered"),
                    canceled: Hook::new("canceled"),
                    completed: Hook::new("completed"),
                    faulted: Hook::new("faulted"),
                },
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn group(&self) -> Option<&str> {
        self.shared.config.group.as_deref()
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.config.max_concurrent
    }

    pub fn max_occurrences(&self) -> u64 {
        self.shared.config.max_occurrences
    }

    /// Occurrences consumed so far. Monotonically non-decreasing.
    pub fn counter(&self) -> u64 {
        self.shared.counter.load(Ordering::SeqCst)
    }

    /// Tick executions currently in flight; always within
    /// `[0, max_concurrent]`.
    pub fn pressure(&self) -> usize {
        self.shared
            .config
            .max_concurrent
            .saturating_sub(self.shared.semaphore.available_permits())
    }

    pub fn state(&self) -> TriggerState {
        *self
            .shared
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The effective cron expression, for cron-driven triggers.
    pub fn cron_expression(&self) -> Option<&str> {
        match &self.shared.cadence {
            Cadence::Cron(cadence) => Some(cadence.expression()),
            Cadence::Fixed(_) => None,
        }
    }

    /// Next occurrence after now, for cron-driven triggers.
    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        match &self.shared.cadence {
            Cadence::Cron(cadence) => cadence.next_occurrence(),
            Cadence::Fixed(_) => None,
        }
    }

    pub fn on_triggered<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.hooks.triggered.subscribe(handler);
    }

    pub fn on_canceled<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.hooks.canceled.subscribe(handler);
    }

    pub fn on_completed<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.hooks.completed.subscribe(handler);
    }

    pub fn on_faulted<F, Fut>(&self, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.shared.hooks.faulted.subscribe(handler);
    }

    /// Store the context and cancellation signal and start the timer task.
    /// With a zero fixed delay no task is spawned; the caller drives
    /// [`Trigger::tick`] externally.
    pub fn activate(&self, context: Option<Context>, cancel: CancellationToken) {
        if self.state() != TriggerState::Configured {
            warn!(trigger = %self.name(), state = ?self.state(), "trigger already activated");
            return;
        }

        info!(
            trigger = %self.name(),
            fire_on_start = self.shared.config.fire_on_start,
            "activating trigger"
        );

        *self
            .shared
            .context
            .write()
            .unwrap_or_else(PoisonError::into_inner) = context;
        *self
            .shared
            .cancel
            .write()
            .unwrap_or_else(PoisonError::into_inner) = cancel;
        self.shared.set_state(TriggerState::Active);

        match &self.shared.cadence {
            Cadence::Fixed(delay) if delay.is_zero() => {
                warn!(trigger = %self.name(), "delay is zero, the trigger will not tick on its own");
            }
            Cadence::Fixed(delay) => {
                let shared = self.shared.clone();
                let delay = *delay;
                tokio::spawn(run_fixed(shared, delay));
            }
            Cadence::Cron(_) => {
                let shared = self.shared.clone();
                tokio::spawn(run_cron(shared));
            }
        }
    }

    /// Run one pass through the tick handler. Called by the timer task, and
    /// directly by callers when self-ticking is disabled.
    pub async fn tick(&self) {
        run_tick(self.shared.clone()).await;
    }

    /// Stop the timer and raise Completed exactly once. Idempotent: a
    /// second call is a no-op and does not re-raise Completed. Safe on a
    /// trigger that was never activated.
    pub fn deactivate(&self, reason: &str, context: Option<Context>) {
        deactivate(&self.shared, reason, context, TriggerState::Completed);
    }
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("name", &self.shared.config.name)
            .field("state", &self.state())
            .field("counter", &self.counter())
            .finish()
    }
}

fn budget_display(max_occurrences: u64) -> String {
    if max_occurrences == 0 {
        "unlimited".to_string()
    } else {
        max_occurrences.to_string()
    }
}

impl Shared {
    fn source(&self) -> EventSource {
        EventSource {
            id: self.id,
            name: self.config.name.clone(),
            group: self.config.group.clone(),
            kind: ComponentKind::Trigger,
        }
    }

    fn set_state(&self, state: TriggerState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn current_context(&self) -> Option<Context> {
        self.context
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Performs the terminal transition. Returns true only for the call that
/// actually transitioned; later calls are no-ops and re-raise nothing.
fn deactivate(
    shared: &Arc<Shared>,
    reason: &str,
    context: Option<Context>,
    terminal: TriggerState,
) -> bool {
    if shared.deactivated.swap(true, Ordering::SeqCst) {
        return false;
    }

    warn!(trigger = %shared.config.name, reason, "deactivating trigger");

    shared.stopped.cancel();
    shared.set_state(terminal);
    counter!(
        "trigger_completed_total",
        "trigger" => shared.config.name.clone(),
        "reason" => reason.to_string()
    )
    .increment(1);

    let context = context.or_else(|| shared.current_context());
    raise_completed(shared, context);
    true
}

async fn run_fixed(shared: Arc<Shared>, delay: Duration) {
    let mut ticker = interval(delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    if !shared.config.fire_on_start {
        // the interval yields immediately once; without fire-on-start the
        // first real tick happens one full period after activation
        ticker.tick().await;
    }

    loop {
        tokio::select! {
            _ = shared.stopped.cancelled() => break,
            _ = ticker.tick() => {
                // ticks run detached so a slow firing overlaps the next
                // period and the semaphore, not the timer, bounds them
                tokio::spawn(run_tick(shared.clone()));
            }
        }
    }

    debug!(trigger = %shared.config.name, "timer task stopped");
}

async fn run_cron(shared: Arc<Shared>) {
    let Cadence::Cron(cadence) = shared.cadence.clone() else {
        return;
    };

    if shared.config.fire_on_start {
        run_tick(shared.clone()).await;
    }

    loop {
        if shared.stopped.is_cancelled() {
            break;
        }

        // reprogram the one-shot from "now" after every tick
        let delay = match cadence.next_delay() {
            Ok(delay) => delay,
            Err(e) => {
                // the schedule has no further occurrence: fatal, surfaced
                // as a fault rather than silently dropped
                raise_faulted(&shared, shared.current_context(), Arc::new(e));
                break;
            }
        };

        debug!(
            trigger = %shared.config.name,
            delay_ms = delay.as_millis() as u64,
            "next occurrence scheduled"
        );

        tokio::select! {
            _ = shared.stopped.cancelled() => break,
            _ = sleep(delay) => run_tick(shared.clone()).await,
        }
    }

    debug!(trigger = %shared.config.name, "timer task stopped");
}

async fn run_tick(shared: Arc<Shared>) {
    if shared.cancel_token().is_cancelled() {
        let context = shared.current_context();
        if deactivate(
            &shared,
            "cancellation requested",
            context.clone(),
            TriggerState::Canceled,
        ) {
            raise_canceled(&shared, context);
        }
        return;
    }

    // Backpressure point: wait without timeout for a permit.
    let Ok(_permit) = shared.semaphore.acquire().await else {
        return;
    };

    let budget = shared.config.max_occurrences;
    if budget > 0 && shared.counter.load(Ordering::SeqCst) >= budget {
        deactivate(
            &shared,
            "occurrence budget exhausted",
            shared.current_context(),
            TriggerState::Completed,
        );
        return;
    }

    shared.counter.fetch_add(1, Ordering::SeqCst);

    let context = shared.current_context();
    match shared.strategy.fire(context.clone()).await {
        Ok(true) => {
            counter!("trigger_fired_total", "trigger" => shared.config.name.clone()).increment(1);
            raise_triggered(&shared, context);
        }
        Ok(false) => {
            debug!(trigger = %shared.config.name, "tick completed without firing");
        }
        Err(e) => raise_faulted(&shared, context, Arc::new(e)),
    }
    // the permit drops here, releasing concurrency even on a failed firing
}

fn raise_triggered(shared: &Arc<Shared>, context: Option<Context>) {
    let event = Event::new(shared.source(), context.clone());
    let sink = shared.clone();
    shared.hooks.triggered.emit(event, move |err| {
        raise_faulted(&sink, context.clone(), Arc::new(err));
    });
}

fn raise_canceled(shared: &Arc<Shared>, context: Option<Context>) {
    let event = Event::new(shared.source(), context.clone());
    let sink = shared.clone();
    shared.hooks.canceled.emit(event, move |err| {
        raise_faulted(&sink, context.clone(), Arc::new(err));
    });
}

fn raise_completed(shared: &Arc<Shared>, context: Option<Context>) {
    let event = Event::new(shared.source(), context.clone());
    let sink = shared.clone();
    shared.hooks.completed.emit(event, move |err| {
        raise_faulted(&sink, context.clone(), Arc::new(err));
    });
}

/// Faulted is a terminal sink: its own handler errors are logged by the
/// hook, never re-raised.
fn raise_faulted(shared: &Arc<Shared>, context: Option<Context>, error: Arc<RuntimeError>) {
    counter!("trigger_faulted_total", "trigger" => shared.config.name.clone()).increment(1);
    let event = Event::faulted(shared.source(), context, error);
    shared.hooks.faulted.emit_logged(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep as tokio_sleep;

    struct AlwaysFire;

    #[async_trait]
    impl FiringStrategy for AlwaysFire {
        async fn fire(&self, _context: Option<Context>) -> Result<bool, RuntimeError> {
            Ok(true)
        }
    }

    fn manual_trigger(config: TriggerConfig) -> Trigger {
        // zero delay: ticks are driven by the test
        Trigger::new(config, Cadence::Fixed(Duration::ZERO), AlwaysFire).unwrap()
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> impl Fn(Event) -> futures::future::Ready<anyhow::Result<()>> {
        move |_event| {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[test]
    fn rejects_zero_max_concurrent() {
        let mut config = TriggerConfig::named("bad");
        config.max_concurrent = 0;
        let err = Trigger::new(config, Cadence::Fixed(Duration::from_secs(1)), AlwaysFire)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, ConfigError::MaxConcurrentTooLow));
    }

    #[tokio::test]
    async fn occurrence_budget_deactivates_after_exactly_n_ticks() {
        let mut config = TriggerConfig::named("budgeted");
        config.max_occurrences = 3;
        let trigger = manual_trigger(config);

        let completed = Arc::new(AtomicUsize::new(0));
        trigger.on_completed(counting_handler(completed.clone()));
        let triggered = Arc::new(AtomicUsize::new(0));
        trigger.on_triggered(counting_handler(triggered.clone()));

        trigger.activate(None, CancellationToken::new());
        for _ in 0..5 {
            trigger.tick().await;
        }
        tokio_sleep(Duration::from_millis(50)).await;

        assert_eq!(trigger.counter(), 3);
        assert_eq!(triggered.load(Ordering::SeqCst), 3);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(trigger.state(), TriggerState::Completed);
    }

    #[tokio::test]
    async fn deactivate_is_idempotent() {
        let trigger = manual_trigger(TriggerConfig::named("idempotent"));
        let completed = Arc::new(AtomicUsize::new(0));
        trigger.on_completed(counting_handler(completed.clone()));

        trigger.activate(None, CancellationToken::new());
        trigger.deactivate("stop requested", None);
        trigger.deactivate("stop requested", None);
        tokio_sleep(Duration::from_millis(50)).await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(trigger.state(), TriggerState::Completed);
    }

    #[tokio::test]
    async fn deactivating_an_unactivated_trigger_is_not_an_error() {
        let trigger = manual_trigger(TriggerConfig::named("never-started"));
        let completed = Arc::new(AtomicUsize::new(0));
        trigger.on_completed(counting_handler(completed.clone()));

        trigger.deactivate("stop requested", None);
        tokio_sleep(Duration::from_millis(50)).await;

        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(trigger.counter(), 0);
    }

    #[tokio::test]
    async fn cancellation_raises_canceled_and_completed_once() {
        let trigger = manual_trigger(TriggerConfig::named("cancelable"));
        let canceled = Arc::new(AtomicUsize::new(0));
        trigger.on_canceled(counting_handler(canceled.clone()));
        let completed = Arc::new(AtomicUsize::new(0));
        trigger.on_completed(counting_handler(completed.clone()));

        let cancel = CancellationToken::new();
        trigger.activate(None, cancel.clone());
        cancel.cancel();

        trigger.tick().await;
        trigger.tick().await;
        tokio_sleep(Duration::from_millis(50)).await;

        assert_eq!(canceled.load(Ordering::SeqCst), 1);
        assert_eq!(completed.load(Ordering::SeqCst), 1);
        assert_eq!(trigger.counter(), 0);
        assert_eq!(trigger.state(), TriggerState::Canceled);
    }

    #[tokio::test]
    async fn pressure_is_bounded_by_max_concurrent() {
        struct SlowFire;

        #[async_trait]
        impl FiringStrategy for SlowFire {
            async fn fire(&self, _context: Option<Context>) -> Result<bool, RuntimeError> {
                tokio_sleep(Duration::from_millis(200)).await;
                Ok(true)
            }
        }

        let mut config = TriggerConfig::named("pressured");
        config.max_concurrent = 2;
        let trigger = Trigger::new(config, Cadence::Fixed(Duration::ZERO), SlowFire).unwrap();
        trigger.activate(None, CancellationToken::new());

        let mut ticks = Vec::new();
        for _ in 0..3 {
            let t = trigger.clone();
            ticks.push(tokio::spawn(async move { t.tick().await }));
        }

        tokio_sleep(Duration::from_millis(50)).await;
        // the third tick is parked on the semaphore
        assert_eq!(trigger.pressure(), 2);
        assert_eq!(trigger.counter(), 2);

        for tick in ticks {
            tick.await.unwrap();
        }
        assert_eq!(trigger.pressure(), 0);
        assert_eq!(trigger.counter(), 3);
    }

    #[tokio::test]
    async fn strategy_error_becomes_faulted_and_ticking_continues() {
        struct FailingFire;

        #[async_trait]
        impl FiringStrategy for FailingFire {
            async fn fire(&self, _context: Option<Context>) -> Result<bool, RuntimeError> {
                Err(RuntimeError::PredicateFailed {
                    reason: "boom".to_string(),
                })
            }
        }

        let trigger = Trigger::new(
            TriggerConfig::named("faulty"),
            Cadence::Fixed(Duration::ZERO),
            FailingFire,
        )
        .unwrap();

        let faulted = Arc::new(AtomicUsize::new(0));
        trigger.on_faulted(counting_handler(faulted.clone()));
        let completed = Arc::new(AtomicUsize::new(0));
        trigger.on_completed(counting_handler(completed.clone()));

        trigger.activate(None, CancellationToken::new());
        trigger.tick().await;
        trigger.tick().await;
        tokio_sleep(Duration::from_millis(50)).await;

        assert_eq!(faulted.load(Ordering::SeqCst), 2);
        assert_eq!(trigger.counter(), 2);
        // faults do not deactivate the trigger
        assert_eq!(completed.load(Ordering::SeqCst), 0);
        assert_eq!(trigger.state(), TriggerState::Active);
    }

    #[tokio::test]
    async fn triggered_handler_error_is_reraised_as_faulted() {
        let trigger = manual_trigger(TriggerConfig::named("handler-fault"));
        trigger.on_triggered(|_event| async { Err(anyhow::anyhow!("subscriber exploded")) });

        let faulted = Arc::new(AtomicUsize::new(0));
        let seen = faulted.clone();
        trigger.on_faulted(move |event| {
            let seen = seen.clone();
            async move {
                assert!(matches!(
                    event.error.as_deref(),
                    Some(RuntimeError::HandlerFailed { event: "triggered", .. })
                ));
                seen.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        trigger.activate(None, CancellationToken::new());
        trigger.tick().await;
        tokio_sleep(Duration::from_millis(100)).await;

        assert_eq!(faulted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mocked_strategy_observes_the_activation_context() {
        let mut strategy = MockFiringStrategy::new();
        strategy
            .expect_fire()
            .times(1)
            .withf(|context| {
                context
                    .as_ref()
                    .and_then(|ctx| ctx.get::<&'static str>())
                    .is_some_and(|token| *token == "correlation")
            })
            .returning(|_| Ok(false));

        let trigger = Trigger::new(
            TriggerConfig::named("mocked"),
            Cadence::Fixed(Duration::ZERO),
            strategy,
        )
        .unwrap();

        let triggered = Arc::new(AtomicUsize::new(0));
        trigger.on_triggered(counting_handler(triggered.clone()));

        trigger.activate(Some(Context::new("correlation")), CancellationToken::new());
        trigger.tick().await;
        tokio_sleep(Duration::from_millis(50)).await;

        // a benign skip consumes the occurrence without raising Triggered
        assert_eq!(trigger.counter(), 1);
        assert_eq!(triggered.load(Ordering::SeqCst), 0);
    }
}
