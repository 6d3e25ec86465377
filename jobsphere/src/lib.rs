// In-process job-scheduling runtime: triggers decide when work runs, jobs
// are the work, and the orchestrator binds the two with aggregate lifecycle
// events.

pub mod context;
pub mod errors;
pub mod events;
pub mod job;
pub mod orchestrator;
pub mod rate_limit;
pub mod schedule;
pub mod settings;
pub mod telemetry;
pub mod trigger;
