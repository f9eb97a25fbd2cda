//! Read-only inspection of repository trees.
//!
//! Writable repositories live under the repository root; their replicated
//! copies ("mirrors") live under the mirror root. Lookups that decide
//! whether something is published, or how old it is, go to the mirrors,
//! because that is what clients actually see.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use userpub_protocol::{Cid, ConfigSnapshot, HostRepo, CATALOG_MARKER};
use walkdir::WalkDir;

const SECONDS_PER_DAY: u64 = 60 * 60 * 24;

/// First repository (in config order) whose mirror holds the CID's artifact.
pub fn locate<'a>(snapshot: &'a ConfigSnapshot, cid: &str) -> Option<&'a HostRepo> {
    snapshot
        .host_repos
        .iter()
        .find(|hr| snapshot.mirror_artifact_path(&hr.repo, cid).exists())
}

/// Convenience for validated CIDs.
pub fn locate_cid<'a>(snapshot: &'a ConfigSnapshot, cid: &Cid) -> Option<&'a HostRepo> {
    locate(snapshot, cid.as_str())
}

/// CIDs present in an artifact tree.
///
/// A top-level directory is a one-segment CID unless its first child
/// directory carries the catalog marker, in which case every child directory
/// is a `group/name` CID. Both layouts may be mixed in one tree.
pub fn find_cids(root: &Path) -> Vec<String> {
    let mut cids = Vec::new();
    let Ok(uppers) = fs::read_dir(root) else {
        return cids;
    };

    let mut uppers: Vec<_> = uppers.flatten().filter(|e| e.path().is_dir()).collect();
    uppers.sort_by_key(|e| e.file_name());

    for upper in uppers {
        let upper_name = upper.file_name().to_string_lossy().into_owned();
        let mut lowers: Vec<_> = match fs::read_dir(upper.path()) {
            Ok(entries) => entries.flatten().filter(|e| e.path().is_dir()).collect(),
            Err(_) => Vec::new(),
        };
        lowers.sort_by_key(|e| e.file_name());

        let grouped = lowers
            .first()
            .map(|first| first.path().join(CATALOG_MARKER).exists())
            .unwrap_or(false);

        if grouped {
            for lower in lowers {
                cids.push(format!("{}/{}", upper_name, lower.file_name().to_string_lossy()));
            }
        } else {
            cids.push(upper_name);
        }
    }

    cids
}

/// Every file in a timestamp tree, as a CID relative to the tree root.
pub fn timestamp_cids(root: &Path) -> Vec<String> {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .ok()
                .map(|rel| rel.to_string_lossy().into_owned())
        })
        .collect()
}

/// Whole days between `mtime` and `now`, zero if `mtime` is in the future.
pub fn age_days(mtime: SystemTime, now: SystemTime) -> u64 {
    now.duration_since(mtime)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        / SECONDS_PER_DAY
}

/// Whether a CID and its timestamp are older than `max_days` on every
/// mirror that has them.
///
/// A CID found on no mirror is never expired: the publish may simply not
/// have replicated yet.
pub fn is_expired(snapshot: &ConfigSnapshot, cid: &str, now: SystemTime) -> bool {
    let mut found = false;
    for hr in &snapshot.host_repos {
        let paths = [
            snapshot.mirror_timestamp_path(&hr.repo, cid),
            snapshot.mirror_artifact_path(&hr.repo, cid),
        ];
        for path in paths {
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            found = true;
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if age_days(mtime, now) <= snapshot.max_days {
                return false;
            }
        }
    }
    found
}
