//! Worker registry: at most one live worker thread per local repository.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};
use userpub_protocol::ConfigSnapshot;

use crate::worker::{RepoWorker, WorkerShared};

/// Thread name of the worker for `repo`.
pub fn worker_name(repo: &str) -> String {
    format!("Pub-{}", repo)
}

/// Spawns and tracks repository workers, keyed by thread name.
pub struct WorkerRegistry {
    workers: Mutex<Workers>,
}

struct Workers {
    shared: WorkerShared,
    handles: HashMap<String, JoinHandle<()>>,
}

impl WorkerRegistry {
    pub fn new(shared: WorkerShared) -> Self {
        Self {
            workers: Mutex::new(Workers {
                shared,
                handles: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Workers> {
        self.workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a worker for every repository in `snapshot` owned by
    /// `hostname` that has no live worker yet. Returns the names of the
    /// workers started by this call.
    pub fn ensure(&self, snapshot: &ConfigSnapshot, hostname: &str) -> Vec<String> {
        let mut workers = self.lock();
        let mut started = Vec::new();

        for host_repo in snapshot.local_repos(hostname) {
            let name = worker_name(&host_repo.repo);
            if workers.handles.get(&name).is_some_and(|h| !h.is_finished()) {
                continue;
            }

            let worker = RepoWorker::new(host_repo, workers.shared.clone());
            match spawn(&name, worker) {
                Ok(handle) => {
                    info!(repo = %host_repo.repo, "started worker {}", name);
                    workers.handles.insert(name.clone(), handle);
                    started.push(name);
                }
                Err(e) => warn!(repo = %host_repo.repo, "failed to start worker {}: {}", name, e),
            }
        }

        started
    }

    /// Names of the workers still running, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .handles
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Signal every worker to stop and wait for them. A worker finishes its
    /// current item and drain wait first. Workers started by a later
    /// [`WorkerRegistry::ensure`] run normally.
    pub fn stop_all(&self) {
        let handles: Vec<_> = {
            let mut workers = self.lock();
            workers.shared.stop.store(true, Ordering::SeqCst);
            // The stopped generation keeps the raised flag.
            workers.shared.stop = Arc::new(AtomicBool::new(false));
            workers.handles.drain().collect()
        };
        for (name, handle) in handles {
            if handle.join().is_err() {
                warn!("worker {} panicked", name);
            }
        }
    }
}

fn spawn(name: &str, worker: RepoWorker) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || worker.run())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::WorkQueue;
    use crate::tables::{InFlightPublishes, PendingTimestamps};
    use crate::tool::{ToolError, ToolInvocation, ToolOutcome, ToolRunner};
    use crate::worker::{SnapshotSource, SystemClock, WorkerSettings};
    use std::time::Duration;

    struct NoopRunner;

    impl ToolRunner for NoopRunner {
        fn run(&self, _invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::exited(0))
        }
    }

    struct Fixed(Arc<ConfigSnapshot>);

    impl SnapshotSource for Fixed {
        fn current(&self) -> Arc<ConfigSnapshot> {
            Arc::clone(&self.0)
        }
    }

    fn registry(snapshot: &Arc<ConfigSnapshot>) -> WorkerRegistry {
        WorkerRegistry::new(WorkerShared {
            queue: Arc::new(WorkQueue::default()),
            in_flight: Arc::new(InFlightPublishes::new()),
            timestamps: Arc::new(PendingTimestamps::new()),
            runner: Arc::new(NoopRunner),
            snapshots: Arc::new(Fixed(Arc::clone(snapshot))),
            clock: Arc::new(SystemClock),
            settings: WorkerSettings {
                drain_timeout: Duration::from_millis(10),
            },
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    fn snapshot(dir: &tempfile::TempDir) -> Arc<ConfigSnapshot> {
        // Keep any sweep that happens to fall in the current hour inside the
        // scratch directory.
        let text = format!(
            "hostrepo myhost:repoA\nhostrepo other:repoB\nhostrepo myhost.example.org:repoC\n\
             reporoot {}\nmirrorroot {}\n",
            dir.path().join("repos").display(),
            dir.path().join("mirrors").display()
        );
        Arc::new(ConfigSnapshot::parse(&text).unwrap())
    }

    #[test]
    fn test_worker_name() {
        assert_eq!(worker_name("repo.example.org"), "Pub-repo.example.org");
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let snapshot = snapshot(&dir);
        let registry = registry(&snapshot);

        let started = registry.ensure(&snapshot, "myhost.example.org");
        assert_eq!(started, vec!["Pub-repoA", "Pub-repoC"]);

        assert!(registry.ensure(&snapshot, "myhost.example.org").is_empty());
        assert_eq!(registry.running(), vec!["Pub-repoA", "Pub-repoC"]);

        registry.stop_all();
        assert!(registry.running().is_empty());
    }

    #[test]
    fn test_restart_after_stop_all() {
        let dir = tempfile::TempDir::new().unwrap();
        let snapshot = snapshot(&dir);
        let registry = registry(&snapshot);

        registry.ensure(&snapshot, "myhost");
        registry.stop_all();
        assert!(registry.running().is_empty());

        assert_eq!(registry.ensure(&snapshot, "myhost"), vec!["Pub-repoA"]);
        // Several drain timeouts: a worker seeing a stale stop flag would
        // have exited by now.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(registry.running(), vec!["Pub-repoA"]);
        registry.stop_all();
    }

    #[test]
    fn test_no_local_repos_starts_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let snapshot = snapshot(&dir);
        let registry = registry(&snapshot);
        assert!(registry.ensure(&snapshot, "elsewhere").is_empty());
    }
}
