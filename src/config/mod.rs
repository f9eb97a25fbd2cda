//! Operator configuration sources
//!
//! Three files feed the service:
//! 1. the operator config (`key value` lines, see [`ConfigSnapshot`])
//! 2. the DN allow-list, in grid-mapfile format
//! 3. the trusted token issuers, named by the `issuersfile` config key
//!
//! Each file is re-read only when its mtime changes, at most once per cache
//! window. See [`ConfigCache`].

mod allowlist;
mod cache;

pub use allowlist::{AllowList, IssuerList};
pub use cache::{CacheSettings, CachedConfig, ConfigCache, Lookup, DEFAULT_CACHE_WINDOW};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use userpub_protocol::{ConfigSnapshot, SnapshotError};

/// Default operator config path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cvmfs-user-pub.conf";

/// Default DN allow-list path.
pub const DEFAULT_ALLOWLIST_PATH: &str = "/etc/grid-security/grid-mapfile";

/// Errors loading a configuration source.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: SnapshotError,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where the configuration sources live.
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config: PathBuf,
    pub allowlist: PathBuf,
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            allowlist: PathBuf::from(DEFAULT_ALLOWLIST_PATH),
        }
    }
}

/// Current mtime of a source file.
pub fn modified(path: &Path) -> Result<SystemTime> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read and parse the operator config.
pub fn load_snapshot(path: &Path) -> Result<ConfigSnapshot> {
    ConfigSnapshot::parse(&read(path)?).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Read the DN allow-list.
pub fn load_allowlist(path: &Path) -> Result<AllowList> {
    Ok(AllowList::parse(&read(path)?))
}

/// Read the trusted issuers list.
pub fn load_issuers(path: &Path) -> Result<IssuerList> {
    Ok(IssuerList::parse(&read(path)?))
}
