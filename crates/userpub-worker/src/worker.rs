//! Per-repository publish worker.
//!
//! One worker runs for every repository owned by this host. Each iteration:
//! 1. wait up to [`DRAIN_TIMEOUT`] for a queue item (a timeout is the
//!    heartbeat, not an error)
//! 2. publish the item: a staged tarball, or every timestamp requested so
//!    far in one batch
//! 3. if this is the repository's sweep hour and no sweep ran yet this
//!    hour, run the retention sweep and garbage collection
//!
//! Tool invocations block the worker for their whole duration, so a
//! repository never sees two concurrent writers from this service.

use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, Timelike};
use tracing::{debug, info, info_span, warn};
use userpub_protocol::{ConfigSnapshot, HostRepo};

use crate::queue::{ItemKind, QueueItem, WorkQueue};
use crate::retention::{self, sweep_hour};
use crate::tables::{InFlightPublishes, PendingTimestamps};
use crate::tool::{ToolInvocation, ToolRunner};

/// How long a worker waits for work before checking the sweep schedule.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Gives workers the current configuration between queue items.
pub trait SnapshotSource: Send + Sync {
    fn current(&self) -> Arc<ConfigSnapshot>;
}

/// Wall clock used for the sweep schedule and retention ages.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// The local system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Worker tunables.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub drain_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

/// Everything workers share with the request side.
#[derive(Clone)]
pub struct WorkerShared {
    pub queue: Arc<WorkQueue>,
    pub in_flight: Arc<InFlightPublishes>,
    pub timestamps: Arc<PendingTimestamps>,
    pub runner: Arc<dyn ToolRunner>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub clock: Arc<dyn Clock>,
    pub settings: WorkerSettings,
    /// Set when the service context is torn down; checked once per
    /// iteration, never interrupts a running tool.
    pub stop: Arc<AtomicBool>,
}

/// The worker for one repository.
pub struct RepoWorker {
    repo: String,
    ordinal: u32,
    shared: WorkerShared,
    /// Set once a sweep was attempted in the current sweep hour; cleared
    /// outside it so the next day's sweep can run.
    swept: bool,
}

impl RepoWorker {
    pub fn new(host_repo: &HostRepo, shared: WorkerShared) -> Self {
        Self {
            repo: host_repo.repo.clone(),
            ordinal: host_repo.ordinal,
            shared,
            swept: false,
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Run until the stop flag is set.
    pub fn run(mut self) {
        let span = info_span!("worker", repo = %self.repo);
        let _guard = span.enter();
        info!(
            ordinal = self.ordinal,
            "worker started for publishing to {}",
            self.repo
        );

        while !self.shared.stop.load(Ordering::SeqCst) {
            self.tick();
        }
        info!("worker stopped");
    }

    /// One drain-publish-sweep iteration.
    pub fn tick(&mut self) {
        if let Some(item) = self.shared.queue.pop(self.shared.settings.drain_timeout) {
            self.process(&item);
            self.shared.queue.task_done();
        }
        self.maybe_sweep();
    }

    /// Publish one queue item and clean up its claims, whatever the outcome.
    pub fn process(&self, item: &QueueItem) {
        match item.kind {
            ItemKind::FreshPublish => self.publish_tarball(item),
            ItemKind::TimestampTick => self.publish_timestamps(item),
        }
    }

    fn publish_tarball(&self, item: &QueueItem) {
        let invocation =
            ToolInvocation::publish_tarball(&item.snapshot, &self.repo, &item.cid, &item.principal);
        self.run_tool(&invocation);

        // The staged file goes before the claim so a new claimant never
        // loses its own upload.
        let staged = item.snapshot.staged_path(&item.cid);
        info!(cid = %item.cid, "removing {}", staged.display());
        if let Err(e) = fs::remove_file(&staged) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(cid = %item.cid, "removing {} failed: {}", staged.display(), e);
            }
        }
        self.shared.in_flight.release(&item.cid);
    }

    fn publish_timestamps(&self, item: &QueueItem) {
        let batch = self.shared.timestamps.claim_requested();
        if batch.is_empty() {
            debug!(cid = %item.cid, "timestamp already published by an earlier batch");
            return;
        }

        let invocation =
            ToolInvocation::publish_timestamps(&item.snapshot, &self.repo, &batch, &item.principal);
        self.run_tool(&invocation);
        self.shared.timestamps.complete(&batch);
    }

    fn run_tool(&self, invocation: &ToolInvocation) {
        if let Err(e) = self.shared.runner.run(invocation) {
            warn!("{} failed: {}", invocation.label, e);
        }
    }

    /// The hour this worker sweeps in.
    pub fn sweep_hour(&self, snapshot: &ConfigSnapshot) -> u32 {
        sweep_hour(snapshot.gc_start_hour, self.ordinal)
    }

    fn maybe_sweep(&mut self) {
        let snapshot = self.shared.snapshots.current();
        let now = self.shared.clock.now();

        if now.hour() != self.sweep_hour(&snapshot) {
            self.swept = false;
            return;
        }
        if self.swept {
            return;
        }

        info!("starting cleanup in {}", self.repo);
        let plan = retention::plan_sweep(&snapshot, &self.repo, SystemTime::from(now));
        let outcome = retention::execute_sweep(&snapshot, &plan, self.shared.runner.as_ref());
        info!(
            expired = plan.expired.len(),
            orphans = plan.orphans.len(),
            deleted = outcome.deleted,
            errors = outcome.errors.len(),
            gc_succeeded = outcome.gc_succeeded,
            "cleanup finished in {}",
            self.repo
        );
        // One attempt per hour, successful or not.
        self.swept = true;
    }
}
