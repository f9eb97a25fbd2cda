//! Typed configuration snapshot.
//!
//! The operator config is a list of `key value` lines; `#` starts a comment
//! and a key may repeat (one `hostrepo` line per repository). Parsing keeps
//! the raw key→values mapping and derives the typed fields the service uses.
//! Unknown keys are kept in the raw mapping and otherwise ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::cid::Cid;
use crate::TIMESTAMP_DIR;

/// Default content prefix inside each repository.
pub const DEFAULT_PREFIX: &str = "sw";
/// Default staging directory.
pub const DEFAULT_QUEUE_DIR: &str = "/tmp/cvmfs-user-pub";
/// Default hour (local time) at which the first repository is swept.
pub const DEFAULT_GC_START_HOUR: u32 = 3;
/// Default retention in whole days.
pub const DEFAULT_MAX_DAYS: u64 = 30;
/// Default mount point of the writable repositories.
pub const DEFAULT_REPO_ROOT: &str = "/cvmfs";
/// Default mount point of the mirrored (replicated) repositories.
pub const DEFAULT_MIRROR_ROOT: &str = "/cvmfs2";
/// Default publish helper.
pub const DEFAULT_PUBLISH_CMD: &str = "/usr/libexec/cvmfs-user-pub/publish";
/// Default repository server tool.
pub const DEFAULT_SERVER_CMD: &str = "cvmfs_server";

/// Errors from parsing the operator config.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("line {line}: hostrepo '{value}' is not of the form host:repo")]
    InvalidHostRepo { line: usize, value: String },

    #[error("line {line}: {key} '{value}' is not a valid number")]
    InvalidNumber {
        line: usize,
        key: String,
        value: String,
    },

    #[error("line {line}: gcstarthour {value} is outside 0..=23")]
    HourOutOfRange { line: usize, value: u32 },
}

/// One `hostrepo` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostRepo {
    /// Host that owns the repository (full or short hostname).
    pub host: String,
    /// Repository name.
    pub repo: String,
    /// 1-based position in the `hostrepo` list, used to stagger sweeps.
    pub ordinal: u32,
}

impl HostRepo {
    /// Whether this entry belongs to the given host (full or short name).
    pub fn is_local(&self, hostname: &str) -> bool {
        let short = hostname.split('.').next().unwrap_or(hostname);
        self.host == hostname || self.host == short
    }
}

/// Immutable, parsed operator configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    /// Every key with its values in file order.
    pub raw: BTreeMap<String, Vec<String>>,
    pub host_repos: Vec<HostRepo>,
    pub prefix: String,
    pub queue_dir: PathBuf,
    pub gc_start_hour: u32,
    pub max_days: u64,
    pub issuers_file: Option<PathBuf>,
    pub audiences: Vec<String>,
    pub repo_root: PathBuf,
    pub mirror_root: PathBuf,
    pub publish_cmd: PathBuf,
    pub server_cmd: PathBuf,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            raw: BTreeMap::new(),
            host_repos: Vec::new(),
            prefix: DEFAULT_PREFIX.to_string(),
            queue_dir: PathBuf::from(DEFAULT_QUEUE_DIR),
            gc_start_hour: DEFAULT_GC_START_HOUR,
            max_days: DEFAULT_MAX_DAYS,
            issuers_file: None,
            audiences: Vec::new(),
            repo_root: PathBuf::from(DEFAULT_REPO_ROOT),
            mirror_root: PathBuf::from(DEFAULT_MIRROR_ROOT),
            publish_cmd: PathBuf::from(DEFAULT_PUBLISH_CMD),
            server_cmd: PathBuf::from(DEFAULT_SERVER_CMD),
        }
    }
}

impl ConfigSnapshot {
    /// Parse the operator config text.
    pub fn parse(text: &str) -> Result<Self, SnapshotError> {
        let mut snapshot = Self::default();

        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = line.split('#').next().unwrap_or("");
            let mut words = line.trim().splitn(2, char::is_whitespace);
            let (Some(key), Some(value)) = (words.next(), words.next()) else {
                continue;
            };
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                continue;
            }

            snapshot.apply(line_no, key, value)?;
            snapshot
                .raw
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
        }

        Ok(snapshot)
    }

    /// Apply one line to the derived fields. Single-valued keys keep their
    /// first occurrence.
    fn apply(&mut self, line: usize, key: &str, value: &str) -> Result<(), SnapshotError> {
        let first = !self.raw.contains_key(key);
        match key {
            "hostrepo" => {
                let Some((host, repo)) = value.split_once(':') else {
                    return Err(SnapshotError::InvalidHostRepo {
                        line,
                        value: value.to_string(),
                    });
                };
                let ordinal = self.host_repos.len() as u32 + 1;
                self.host_repos.push(HostRepo {
                    host: host.to_string(),
                    repo: repo.to_string(),
                    ordinal,
                });
            }
            "audience" => self.audiences.push(value.to_string()),
            "gcstarthour" if first => {
                let hour: u32 = parse_number(line, key, value)?;
                if hour > 23 {
                    return Err(SnapshotError::HourOutOfRange { line, value: hour });
                }
                self.gc_start_hour = hour;
            }
            "maxdays" if first => self.max_days = parse_number(line, key, value)?,
            "prefix" if first => self.prefix = value.to_string(),
            "queuedir" if first => self.queue_dir = PathBuf::from(value),
            "issuersfile" if first => self.issuers_file = Some(PathBuf::from(value)),
            "reporoot" if first => self.repo_root = PathBuf::from(value),
            "mirrorroot" if first => self.mirror_root = PathBuf::from(value),
            "publishcmd" if first => self.publish_cmd = PathBuf::from(value),
            "servercmd" if first => self.server_cmd = PathBuf::from(value),
            _ => {}
        }
        Ok(())
    }

    /// Repository names in config order.
    pub fn repo_names(&self) -> Vec<String> {
        self.host_repos.iter().map(|hr| hr.repo.clone()).collect()
    }

    /// Repositories owned by the given host.
    pub fn local_repos<'a>(&'a self, hostname: &'a str) -> impl Iterator<Item = &'a HostRepo> + 'a {
        self.host_repos.iter().filter(move |hr| hr.is_local(hostname))
    }

    /// `<repo_root>/<repo>/<prefix>`
    pub fn artifact_root(&self, repo: &str) -> PathBuf {
        self.repo_root.join(repo).join(&self.prefix)
    }

    /// `<repo_root>/<repo>/ts`
    pub fn timestamp_root(&self, repo: &str) -> PathBuf {
        self.repo_root.join(repo).join(TIMESTAMP_DIR)
    }

    /// Published path of a CID in a writable repository.
    pub fn artifact_path(&self, repo: &str, cid: &Cid) -> PathBuf {
        self.artifact_root(repo).join(cid.as_str())
    }

    /// Mirror path of a CID's artifact.
    pub fn mirror_artifact_path(&self, repo: &str, cid: &str) -> PathBuf {
        self.mirror_root.join(repo).join(&self.prefix).join(cid)
    }

    /// Mirror path of a CID's timestamp.
    pub fn mirror_timestamp_path(&self, repo: &str, cid: &str) -> PathBuf {
        self.mirror_root.join(repo).join(TIMESTAMP_DIR).join(cid)
    }

    /// Staged file path for a CID.
    pub fn staged_path(&self, cid: &Cid) -> PathBuf {
        staged_path(&self.queue_dir, cid)
    }
}

/// Staged file path for a CID under a queue directory.
pub fn staged_path(queue_dir: &Path, cid: &Cid) -> PathBuf {
    queue_dir.join(cid.as_str())
}

fn parse_number<T: std::str::FromStr>(line: usize, key: &str, value: &str) -> Result<T, SnapshotError> {
    value.parse().map_err(|_| SnapshotError::InvalidNumber {
        line,
        key: key.to_string(),
        value: value.to_string(),
    })
}
