// Predicate-polling trigger
//
// Ticks at a fixed delay and fires only when the user predicate says so. A
// false predicate still consumes one occurrence and one permit: the budget
// counts gate passes, not firings.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::Context;
use crate::errors::{ConfigError, RuntimeError};
use crate::trigger::engine::{Cadence, FiringStrategy, Trigger, TriggerConfig};

type Predicate =
    Box<dyn Fn(Option<Context>) -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

/// Firing decision for event triggers: ask the predicate.
struct PredicateFiring {
    predicate: Predicate,
}

#[async_trait]
impl FiringStrategy for PredicateFiring {
    async fn fire(&self, context: Option<Context>) -> Result<bool, RuntimeError> {
        (self.predicate)(context)
            .await
            .map_err(|e| RuntimeError::PredicateFailed {
                reason: e.to_string(),
            })
    }
}

impl Trigger {
    /// Build a fixed-delay trigger that evaluates `predicate` each tick and
    /// raises Triggered only when it returns true. A zero delay disables
    /// self-ticking; the caller drives [`Trigger::tick`] externally.
    pub fn event<P, Fut>(
        config: TriggerConfig,
        delay: Duration,
        predicate: P,
    ) -> Result<Self, ConfigError>
    where
        P: Fn(Option<Context>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<bool>> + Send + 'static,
    {
        let predicate: Predicate = Box::new(move |context| Box::pin(predicate(context)));
        Trigger::new(
            config,
            Cadence::Fixed(delay),
            PredicateFiring { predicate },
        )
    }
}
