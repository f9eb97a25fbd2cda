//! Dedup and staging of uploaded artifacts.
//!
//! An upload for a CID first claims the CID in the in-flight table. The
//! winner streams the body to `<queuedir>/<cid>.tmp` and renames it into
//! place once all bytes have arrived; everyone else drains the body and is
//! told the CID is already in progress. The claim outlives this module: it
//! is released by the worker after the publish attempt, or by the caller if
//! the staged file is never queued.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use userpub_protocol::{snapshot, Cid};
use userpub_worker::InFlightPublishes;
use walkdir::WalkDir;

/// Upload read size.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Suffix of a file still being received.
pub const TMP_SUFFIX: &str = ".tmp";

/// Staging failures. No partial file is left behind, and a claim taken by
/// the failed upload has been released.
#[derive(Debug, Error)]
pub enum StageError {
    /// Draining the body of a duplicate upload failed.
    #[error("error discarding duplicate upload: {0}")]
    Drain(#[source] io::Error),

    #[error("error reading publish data: {0}")]
    Read(#[source] io::Error),

    #[error("upload ended after {received} of {expected} bytes")]
    ShortRead { expected: u64, received: u64 },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of a successful [`StagingArea::stage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The body is at this path and the caller holds the CID's claim.
    Staged(PathBuf),
    /// Another upload holds the claim; this body was drained and discarded.
    AlreadyInProgress,
}

/// Path of the partial file for a staged path.
pub fn tmp_path(staged: &Path) -> PathBuf {
    let mut name = staged.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// Files found in the staging directory at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Leftovers {
    /// Complete staged files, as CIDs.
    pub staged: Vec<Cid>,
    /// Partial `.tmp` files that were removed.
    pub removed: Vec<PathBuf>,
}

/// The staging directory plus the claim table guarding it.
#[derive(Debug, Clone)]
pub struct StagingArea {
    in_flight: Arc<InFlightPublishes>,
}

impl StagingArea {
    pub fn new(in_flight: Arc<InFlightPublishes>) -> Self {
        Self { in_flight }
    }

    /// Stage `length` bytes of `body` for `cid` under `queue_dir`.
    pub fn stage(
        &self,
        queue_dir: &Path,
        cid: &Cid,
        body: &mut dyn Read,
        length: u64,
    ) -> Result<StageOutcome, StageError> {
        if !self.in_flight.try_claim(cid) {
            info!(cid = %cid, "already publishing, skipping");
            io::copy(&mut body.take(length), &mut io::sink()).map_err(StageError::Drain)?;
            return Ok(StageOutcome::AlreadyInProgress);
        }

        let staged = snapshot::staged_path(queue_dir, cid);
        let tmp = tmp_path(&staged);
        match receive(&staged, &tmp, body, length) {
            Ok(digest) => {
                info!(cid = %cid, sha256 = %digest, "wrote {} bytes to {}", length, staged.display());
                Ok(StageOutcome::Staged(staged))
            }
            Err(e) => {
                warn!(cid = %cid, "error getting publish data: {}", e);
                if let Err(rm) = fs::remove_file(&tmp) {
                    if rm.kind() != io::ErrorKind::NotFound {
                        warn!(cid = %cid, "removing {} failed: {}", tmp.display(), rm);
                    }
                }
                self.in_flight.release(cid);
                Err(e)
            }
        }
    }
}

/// Stream the body to `tmp` and rename it to `staged`. Returns the hex
/// SHA-256 of the body.
fn receive(staged: &Path, tmp: &Path, body: &mut dyn Read, length: u64) -> Result<String, StageError> {
    if let Some(parent) = staged.parent() {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }

    let mut output = File::create(tmp).map_err(io_error(tmp))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = length;

    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = match body.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(StageError::ShortRead {
                    expected: length,
                    received: length - remaining,
                })
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StageError::Read(e)),
        };
        output.write_all(&buf[..n]).map_err(io_error(tmp))?;
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }

    output.sync_all().map_err(io_error(tmp))?;
    drop(output);
    fs::rename(tmp, staged).map_err(io_error(staged))?;
    Ok(hex::encode(hasher.finalize()))
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> StageError + '_ {
    move |source| StageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Scan the staging directory: remove partial files and list the complete
/// ones. Files whose relative path is not a valid CID are left alone.
pub fn scan_leftovers(queue_dir: &Path) -> Leftovers {
    let mut leftovers = Leftovers::default();

    for entry in WalkDir::new(queue_dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if path.to_string_lossy().ends_with(TMP_SUFFIX) {
            info!("cleaning out {}", path.display());
            match fs::remove_file(path) {
                Ok(()) => leftovers.removed.push(path.to_path_buf()),
                Err(e) => warn!("removing {} failed: {}", path.display(), e),
            }
            continue;
        }

        let Ok(rel) = path.strip_prefix(queue_dir) else {
            continue;
        };
        match Cid::parse(&rel.to_string_lossy()) {
            Ok(cid) => leftovers.staged.push(cid),
            Err(e) => debug!("ignoring {}: {}", path.display(), e),
        }
    }

    leftovers
}
