//! Age-based retention sweep.
//!
//! Once a day, at an hour staggered per repository, a worker:
//! - deletes CIDs whose artifact and timestamp are older than the retention
//!   limit on every mirror
//! - deletes timestamp files whose CID is no longer published anywhere
//! - runs the repository garbage collector, whether or not anything was
//!   deleted
//!
//! Deletions happen inside a repository transaction opened and published
//! with the server tool. Planning is read-only and can be run as a dry run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use userpub_protocol::ConfigSnapshot;

use crate::layout;
use crate::tool::{ToolInvocation, ToolRunner};

/// Sweep hour of the repository at `ordinal` (1-based), staggered so that
/// repositories are not all collected at once.
pub fn sweep_hour(gc_start_hour: u32, ordinal: u32) -> u32 {
    (gc_start_hour + 23 + ordinal) % 24
}

/// Errors from setting up a sweep.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SweepError {
    #[error("repository '{0}' is not configured")]
    UnknownRepo(String),
}

/// What a sweep would delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepPlan {
    pub repo: String,
    /// Expired CID directories under the artifact tree.
    pub expired: Vec<PathBuf>,
    /// Timestamp files whose CID is gone from every mirror.
    pub orphans: Vec<PathBuf>,
}

impl SweepPlan {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.orphans.is_empty()
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub transaction_opened: bool,
    pub deleted: usize,
    /// Paths that could not be deleted (non-fatal).
    pub errors: Vec<String>,
    pub committed: bool,
    pub gc_succeeded: bool,
}

/// Work out which expired CIDs and orphaned timestamps to delete.
pub fn plan_sweep(snapshot: &ConfigSnapshot, repo: &str, now: SystemTime) -> SweepPlan {
    let artifact_root = snapshot.artifact_root(repo);
    let expired = layout::find_cids(&artifact_root)
        .into_iter()
        .filter(|cid| layout::is_expired(snapshot, cid, now))
        .map(|cid| artifact_root.join(cid))
        .collect();

    let timestamp_root = snapshot.timestamp_root(repo);
    let orphans = layout::timestamp_cids(&timestamp_root)
        .into_iter()
        .filter(|cid| layout::locate(snapshot, cid).is_none())
        .map(|cid| timestamp_root.join(cid))
        .collect();

    SweepPlan {
        repo: repo.to_string(),
        expired,
        orphans,
    }
}

/// [`plan_sweep`] for a repository that must appear in the config.
pub fn plan_configured(snapshot: &ConfigSnapshot, repo: &str, now: SystemTime) -> Result<SweepPlan, SweepError> {
    if !snapshot.host_repos.iter().any(|hr| hr.repo == repo) {
        return Err(SweepError::UnknownRepo(repo.to_string()));
    }
    Ok(plan_sweep(snapshot, repo, now))
}

/// Carry out a plan, then run garbage collection.
pub fn execute_sweep(snapshot: &ConfigSnapshot, plan: &SweepPlan, runner: &dyn ToolRunner) -> SweepOutcome {
    let repo = plan.repo.as_str();
    let mut outcome = SweepOutcome::default();

    if !plan.is_empty() {
        info!(
            repo,
            expired = plan.expired.len(),
            orphans = plan.orphans.len(),
            "starting transaction for deletes"
        );
        outcome.transaction_opened = run_ok(runner, &ToolInvocation::transaction(snapshot, repo));

        if outcome.transaction_opened {
            for dir in &plan.expired {
                info!(repo, path = %dir.display(), "removing");
                record(&mut outcome, dir, remove_tree(dir));
            }
            for file in &plan.orphans {
                info!(repo, path = %file.display(), "removing");
                record(&mut outcome, file, fs::remove_file(file));
            }
            info!(repo, "publishing deletes");
            outcome.committed = run_ok(runner, &ToolInvocation::commit(snapshot, repo));
        }
    }

    info!(repo, "running gc");
    outcome.gc_succeeded = run_ok(runner, &ToolInvocation::gc(snapshot, repo));
    outcome
}

fn run_ok(runner: &dyn ToolRunner, invocation: &ToolInvocation) -> bool {
    match runner.run(invocation) {
        Ok(outcome) => outcome.success(),
        Err(e) => {
            warn!("{}: {}", invocation.label, e);
            false
        }
    }
}

fn record(outcome: &mut SweepOutcome, path: &Path, result: io::Result<()>) {
    match result {
        Ok(()) => outcome.deleted += 1,
        Err(e) => {
            warn!(path = %path.display(), "removal failed: {}", e);
            outcome.errors.push(format!("{}: {}", path.display(), e));
        }
    }
}

/// Remove a directory tree, first giving the owner `rwx` on every directory
/// that lacks it; published trees can contain read-only directories.
pub fn remove_tree(dir: &Path) -> io::Result<()> {
    restore_owner_access(dir)?;
    fs::remove_dir_all(dir)
}

#[cfg(unix)]
fn restore_owner_access(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::symlink_metadata(dir)?;
    if !meta.is_dir() {
        return Ok(());
    }
    let mode = meta.permissions().mode();
    if mode & 0o700 != 0o700 {
        info!(path = %dir.display(), "chmod u+rwx");
        fs::set_permissions(dir, fs::Permissions::from_mode(mode | 0o700))?;
    }
    // Parents are fixed before children so that every child is readable.
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            restore_owner_access(&entry.path())?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn restore_owner_access(_dir: &Path) -> io::Result<()> {
    Ok(())
}
