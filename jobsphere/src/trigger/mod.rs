// Trigger variants and the engine they share

pub mod engine;
pub mod event;
pub mod scheduled;

pub use engine::{Cadence, FiringStrategy, Trigger, TriggerConfig, TriggerState};
