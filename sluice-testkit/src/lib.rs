//! Test support for sluice: canned job specs, a recording action runner, a
//! mock runner scheduler and an in-memory job store.

mod job;
mod mock;
mod store;

pub use job::{failing_spec, quick_spec, spec_in_group};
pub use mock::{MockScheduler, RecordingRunner, RunnerCall, SchedulerCall};
pub use store::MemoryStore;
