//! userpub repository workers
//!
//! The consumer side of the publish pipeline: the shared work queue, the
//! in-flight and pending-timestamp claim tables, the external tool runner,
//! the retention sweep, and the per-repository worker threads that tie them
//! together.

pub mod layout;
pub mod queue;
pub mod registry;
pub mod retention;
pub mod tables;
pub mod tool;
pub mod worker;

pub use queue::{ItemKind, QueueError, QueueItem, QueueSettings, WorkQueue};
pub use registry::{worker_name, WorkerRegistry};
pub use retention::{execute_sweep, plan_configured, plan_sweep, sweep_hour, SweepError, SweepOutcome, SweepPlan};
pub use tables::{InFlightPublishes, PendingTimestamps, TimestampState};
pub use tool::{CommandRunner, ToolError, ToolInvocation, ToolOutcome, ToolRunner};
pub use worker::{Clock, RepoWorker, SnapshotSource, SystemClock, WorkerSettings, WorkerShared, DRAIN_TIMEOUT};
