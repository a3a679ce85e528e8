//! Connection plumbing shared by the relay broker and the host agent
//!
//! Provides the bidirectional byte pump with stall detection, the session state machine and
//! the cancellation-safe start/stop lifecycle used by every network component.

pub mod lifecycle;
pub mod pump;
pub mod session;
pub mod stall;

pub use lifecycle::{Lifecycle, LifecycleError, LifecycleEvent, Worker, WorkerState};
pub use pump::{Direction, PumpConfig, PumpEnd, PumpError, PumpReport, RelayPump};
pub use session::{SessionState, SessionStateCell};
pub use stall::StallTracker;

// Re-exported so dependents share one cancellation primitive
pub use tokio_util::sync::CancellationToken;
pub use tokio_util::task::TaskTracker;
