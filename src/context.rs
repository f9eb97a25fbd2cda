//! Process-wide service state.
//!
//! [`ServiceContext`] owns the configuration cache, the claim tables, the
//! work queue and the worker registry, and tracks the service lifecycle:
//!
//! - `Idle`: constructed, not yet started; requests are refused
//! - `Running`: accepting requests
//! - `Stopped`: shut down; requests are refused and no new workers spawn
//!
//! A stopped service may be started again. Each table sits behind its own
//! lock, and no method holds two of them at once.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};
use userpub_protocol::{Cid, ConfigSnapshot, Reply};
use userpub_worker::{
    layout, Clock, CommandRunner, InFlightPublishes, ItemKind, PendingTimestamps, QueueError, QueueItem,
    QueueSettings, SystemClock, ToolRunner, WorkQueue, WorkerRegistry, WorkerSettings, WorkerShared,
};

use crate::config::{CacheSettings, CachedConfig, ConfigCache, ConfigPaths};
use crate::identity::{Ed25519Verifier, IdentityResolver, TokenVerifier};
use crate::staging::{self, StagingArea};

/// How often shutdown reports progress while the queue drains.
pub const SHUTDOWN_POLL: Duration = Duration::from_secs(5);

/// Lifecycle of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Running,
    Stopped,
}

/// Collaborators and tunables for a [`ServiceContext`].
pub struct ServiceOptions {
    pub paths: ConfigPaths,
    pub hostname: String,
    pub runner: Arc<dyn ToolRunner>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub clock: Arc<dyn Clock>,
    pub cache: CacheSettings,
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub shutdown_poll: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            paths: ConfigPaths::default(),
            hostname: local_hostname(),
            runner: Arc::new(CommandRunner::new()),
            verifier: Arc::new(Ed25519Verifier),
            clock: Arc::new(SystemClock),
            cache: CacheSettings::default(),
            queue: QueueSettings::default(),
            worker: WorkerSettings::default(),
            shutdown_poll: SHUTDOWN_POLL,
        }
    }
}

/// The process-wide service.
pub struct ServiceContext {
    hostname: String,
    cache: Arc<ConfigCache>,
    state: Mutex<ServiceState>,
    queue: Arc<WorkQueue>,
    in_flight: Arc<InFlightPublishes>,
    timestamps: Arc<PendingTimestamps>,
    staging: StagingArea,
    resolver: IdentityResolver,
    registry: WorkerRegistry,
    shutdown_poll: Duration,
}

impl ServiceContext {
    pub fn new(options: ServiceOptions) -> Self {
        let cache = Arc::new(ConfigCache::new(options.paths, options.cache));
        let queue = Arc::new(WorkQueue::new(options.queue));
        let in_flight = Arc::new(InFlightPublishes::new());
        let timestamps = Arc::new(PendingTimestamps::new());

        let registry = WorkerRegistry::new(WorkerShared {
            queue: Arc::clone(&queue),
            in_flight: Arc::clone(&in_flight),
            timestamps: Arc::clone(&timestamps),
            runner: options.runner,
            snapshots: cache.clone(),
            clock: options.clock,
            settings: options.worker,
            stop: Arc::new(AtomicBool::new(false)),
        });

        Self {
            resolver: IdentityResolver::new(options.verifier, options.hostname.clone()),
            staging: StagingArea::new(Arc::clone(&in_flight)),
            hostname: options.hostname,
            cache,
            state: Mutex::new(ServiceState::Idle),
            queue,
            in_flight,
            timestamps,
            registry,
            shutdown_poll: options.shutdown_poll,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub fn in_flight(&self) -> &InFlightPublishes {
        &self.in_flight
    }

    pub fn timestamps(&self) -> &PendingTimestamps {
        &self.timestamps
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ServiceState {
        *self.lock_state()
    }

    /// Current configuration. When the cache re-checked its sources, make
    /// sure every local repository has a worker, unless the service has been
    /// shut down.
    pub fn config_at(&self, now: SystemTime) -> CachedConfig {
        let lookup = self.cache.get_snapshot(now);
        if lookup.refreshed && self.state() != ServiceState::Stopped {
            self.registry.ensure(&lookup.config.snapshot, &self.hostname);
        }
        lookup.config
    }

    pub fn config(&self) -> CachedConfig {
        self.config_at(SystemTime::now())
    }

    /// Mark the service running. On the transition, clear partial uploads
    /// and re-queue complete ones left in the staging directory. Returns
    /// the number of CIDs re-queued.
    pub fn startup(&self, snapshot: &Arc<ConfigSnapshot>) -> usize {
        {
            let mut state = self.lock_state();
            if *state == ServiceState::Running {
                return 0;
            }
            *state = ServiceState::Running;
        }
        info!("service is now up");
        // Workers refused while stopped can start now.
        self.registry.ensure(snapshot, &self.hostname);

        let leftovers = staging::scan_leftovers(&snapshot.queue_dir);
        let mut requeued = 0;
        for cid in leftovers.staged {
            if !self.in_flight.try_claim(&cid) {
                continue;
            }
            match self.queue_or_stamp(snapshot, &cid, "Requeue") {
                Ok(reply) => {
                    info!(cid = %cid, "requeued: {}", reply);
                    requeued += 1;
                }
                Err(e) => warn!(cid = %cid, "requeue failed: {}", e),
            }
        }
        requeued
    }

    /// Stop accepting requests and wait until every queued item has been
    /// processed. Running tool invocations are never interrupted. Gives up
    /// once no worker is left to drain the queue.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock_state();
            if *state != ServiceState::Running {
                return;
            }
            *state = ServiceState::Stopped;
        }
        info!("service shutting down");
        while !self.queue.join_timeout(self.shutdown_poll) {
            let unfinished = self.queue.unfinished();
            if self.registry.running().is_empty() {
                warn!(unfinished, "no worker left to drain the publish queue, giving up");
                return;
            }
            info!(unfinished, "waiting for publish queue to drain");
        }
        info!("publish queue drained");
    }

    /// Whether `snapshot` gives this host a repository to publish into.
    pub fn serves_locally(&self, snapshot: &ConfigSnapshot) -> bool {
        snapshot.local_repos(&self.hostname).next().is_some()
    }

    /// Shut down, then stop and join every worker. A later
    /// [`ServiceContext::startup`] starts fresh workers.
    pub fn teardown(&self) {
        self.shutdown();
        *self.lock_state() = ServiceState::Stopped;
        self.registry.stop_all();
    }

    /// Hand a freshly staged CID on: if it is already published somewhere,
    /// drop the staged copy and refresh its timestamp instead.
    ///
    /// The caller holds the CID's in-flight claim. On return the claim has
    /// either passed to a queued item or been released.
    pub fn queue_or_stamp(&self, snapshot: &Arc<ConfigSnapshot>, cid: &Cid, principal: &str) -> Result<Reply, QueueError> {
        if let Some(host_repo) = layout::locate_cid(snapshot, cid) {
            let path = snapshot.artifact_path(&host_repo.repo, cid);
            let staged = snapshot.staged_path(cid);
            info!(cid = %cid, principal, repo = %host_repo.repo, "already present, removing {}", staged.display());
            if let Err(e) = std::fs::remove_file(&staged) {
                warn!(cid = %cid, "removing {} failed, continuing: {}", staged.display(), e);
            }
            self.in_flight.release(cid);
            self.request_timestamp_refresh(snapshot, cid, principal)?;
            return Ok(Reply::Present(path.display().to_string()));
        }

        let item = QueueItem {
            cid: cid.clone(),
            principal: principal.to_string(),
            snapshot: Arc::clone(snapshot),
            kind: ItemKind::FreshPublish,
        };
        if let Err(e) = self.queue.push(item) {
            warn!(cid = %cid, principal, "{}", e);
            let staged = snapshot.staged_path(cid);
            if let Err(rm) = std::fs::remove_file(&staged) {
                warn!(cid = %cid, "removing {} failed: {}", staged.display(), rm);
            }
            self.in_flight.release(cid);
            return Err(e);
        }
        info!(cid = %cid, principal, "queued for publish");
        Ok(Reply::Ok)
    }

    /// Ask for a CID's timestamp to be republished. Returns false if a
    /// refresh for it is already pending.
    pub fn request_timestamp_refresh(
        &self,
        snapshot: &Arc<ConfigSnapshot>,
        cid: &Cid,
        principal: &str,
    ) -> Result<bool, QueueError> {
        if !self.timestamps.request(cid) {
            info!(cid = %cid, principal, "already queued for timestamp, skipping");
            return Ok(false);
        }

        let tick = QueueItem {
            cid: cid.clone(),
            principal: principal.to_string(),
            snapshot: Arc::clone(snapshot),
            kind: ItemKind::TimestampTick,
        };
        if let Err(e) = self.queue.push(tick) {
            warn!(cid = %cid, principal, "{}", e);
            self.timestamps.withdraw(cid);
            return Err(e);
        }
        Ok(true)
    }
}

/// This host's name, as used to match `hostrepo` entries.
pub fn local_hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    "localhost".to_string()
}
