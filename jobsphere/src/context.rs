// Opaque correlation token threaded through trigger and job calls

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Caller-supplied value passed unmodified through every trigger and job
/// invocation and every lifecycle event. The runtime never inspects or
/// mutates it; cloning only bumps a reference count.
#[derive(Clone)]
pub struct Context(Arc<dyn Any + Send + Sync>);

impl Context {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Borrow the carried value if it has type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Context(..)")
    }
}
