//! Scheduling: per-target supervisors, the work queue and the watcher loop.

mod history;
mod queue;
mod service;
mod supervisor;

pub use history::StatusHistory;
pub use queue::{
    Action, DispatchStats, Dispatcher, OperationKind, QueuedOperation, WorkQueue,
};
pub use service::{ShutdownReport, Watcher};
pub use supervisor::{SupervisorConfig, SupervisorContext, TargetSupervisor};
