//! Time-windowed, mtime-gated configuration cache.
//!
//! A lookup within the cache window returns the current snapshot without
//! touching the filesystem. After the window each source is re-stat'ed and
//! re-parsed only if its mtime moved. A source that fails to read or parse
//! is logged and its previous value kept; its mtime watermark is not
//! advanced, so the next check after a fix picks it up.
//!
//! The first load happens under the cache lock. Later reloads parse outside
//! it, and concurrent lookups keep getting the previous snapshot until the
//! new one is swapped in.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use tracing::{info, warn};
use userpub_protocol::ConfigSnapshot;
use userpub_worker::SnapshotSource;

use super::{load_allowlist, load_issuers, load_snapshot, modified, AllowList, ConfigPaths, IssuerList, Result};

/// How long a loaded configuration is used before its sources are checked.
pub const DEFAULT_CACHE_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub window: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_CACHE_WINDOW,
        }
    }
}

/// Everything a request needs from configuration, swapped as a unit.
#[derive(Debug, Clone, Default)]
pub struct CachedConfig {
    pub snapshot: Arc<ConfigSnapshot>,
    pub allowlist: Arc<AllowList>,
    pub issuers: Arc<IssuerList>,
}

/// Result of [`ConfigCache::get_snapshot`].
#[derive(Debug, Clone)]
pub struct Lookup {
    pub config: CachedConfig,
    /// The sources were checked by this lookup (whether or not anything
    /// changed).
    pub refreshed: bool,
}

#[derive(Debug, Clone, Default)]
struct Watermarks {
    config: Option<SystemTime>,
    allowlist: Option<SystemTime>,
    issuers: Option<(PathBuf, SystemTime)>,
}

#[derive(Debug, Default)]
struct CacheState {
    current: CachedConfig,
    checked_at: Option<SystemTime>,
    watermarks: Watermarks,
}

/// Shared configuration cache.
#[derive(Debug)]
pub struct ConfigCache {
    paths: ConfigPaths,
    settings: CacheSettings,
    state: Mutex<CacheState>,
}

impl ConfigCache {
    pub fn new(paths: ConfigPaths, settings: CacheSettings) -> Self {
        Self {
            paths,
            settings,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The configuration currently in use, without checking the sources.
    pub fn cached(&self) -> CachedConfig {
        self.lock().current.clone()
    }

    /// The configuration to use at `now`, reloading changed sources once
    /// the cache window has passed.
    pub fn get_snapshot(&self, now: SystemTime) -> Lookup {
        let mut state = self.lock();

        let due = match state.checked_at {
            None => true,
            Some(at) => now
                .duration_since(at)
                .map(|elapsed| elapsed > self.settings.window)
                .unwrap_or(false),
        };
        if !due {
            return Lookup {
                config: state.current.clone(),
                refreshed: false,
            };
        }
        state.checked_at = Some(now);

        if state.watermarks.config.is_none() {
            // Nothing usable yet: callers wait for the first load.
            let (current, watermarks) = self.reload(&state.current, &state.watermarks);
            state.current = current;
            state.watermarks = watermarks;
            return Lookup {
                config: state.current.clone(),
                refreshed: true,
            };
        }

        let previous = state.current.clone();
        let watermarks = state.watermarks.clone();
        drop(state);

        let (current, watermarks) = self.reload(&previous, &watermarks);

        let mut state = self.lock();
        state.current = current;
        state.watermarks = watermarks;
        Lookup {
            config: state.current.clone(),
            refreshed: true,
        }
    }

    fn reload(&self, previous: &CachedConfig, watermarks: &Watermarks) -> (CachedConfig, Watermarks) {
        let mut marks = watermarks.clone();
        let mut next = previous.clone();

        if let Some((snapshot, mtime)) = refresh(&self.paths.config, marks.config, load_snapshot) {
            next.snapshot = Arc::new(snapshot);
            marks.config = Some(mtime);
        }

        if let Some((allowlist, mtime)) = refresh(&self.paths.allowlist, marks.allowlist, load_allowlist) {
            next.allowlist = Arc::new(allowlist);
            marks.allowlist = Some(mtime);
        }

        match next.snapshot.issuers_file.clone() {
            None => {
                next.issuers = Arc::new(IssuerList::default());
                marks.issuers = None;
            }
            Some(path) => {
                let seen = marks
                    .issuers
                    .as_ref()
                    .filter(|(seen_path, _)| *seen_path == path)
                    .map(|(_, mtime)| *mtime);
                if let Some((issuers, mtime)) = refresh(&path, seen, load_issuers) {
                    next.issuers = Arc::new(issuers);
                    marks.issuers = Some((path, mtime));
                }
            }
        }

        (next, marks)
    }
}

impl SnapshotSource for ConfigCache {
    fn current(&self) -> Arc<ConfigSnapshot> {
        Arc::clone(&self.lock().current.snapshot)
    }
}

/// Load a source if its mtime differs from `watermark`. `None` means keep
/// the previous value.
fn refresh<T>(
    path: &Path,
    watermark: Option<SystemTime>,
    load: impl FnOnce(&Path) -> Result<T>,
) -> Option<(T, SystemTime)> {
    let mtime = match modified(path) {
        Ok(mtime) => mtime,
        Err(e) => {
            warn!("error reading {}, continuing: {}", path.display(), e);
            return None;
        }
    };
    if watermark == Some(mtime) {
        return None;
    }

    info!("reading {}", path.display());
    match load(path) {
        Ok(value) => Some((value, mtime)),
        Err(e) => {
            warn!("{}, continuing with previous contents", e);
            None
        }
    }
}
