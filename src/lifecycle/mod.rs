//! Run lifecycle: ordered acquisition, guaranteed release, signal handling.

pub mod orchestrator;
pub mod signals;
pub mod state;

pub use orchestrator::{Orchestrator, RunOutcome};
pub use signals::{FORCED_EXIT_CODE, ShutdownSignal, SignalAction, SignalTrigger};
pub use state::{LifecycleState, StateLog};
