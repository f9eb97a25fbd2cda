//! Claim tables shared between request threads and workers.
//!
//! Each table has its own lock and no operation holds two of them at once.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use userpub_protocol::Cid;

/// CIDs currently being staged or queued for first publication.
///
/// Holding a claim is what entitles a caller to own `<queuedir>/<cid>`.
#[derive(Debug, Default)]
pub struct InFlightPublishes {
    cids: Mutex<HashSet<Cid>>,
}

impl InFlightPublishes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<Cid>> {
        self.cids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a CID. Returns false if it is already claimed.
    pub fn try_claim(&self, cid: &Cid) -> bool {
        self.lock().insert(cid.clone())
    }

    /// Release a claim. Releasing an unclaimed CID is a no-op.
    pub fn release(&self, cid: &Cid) {
        self.lock().remove(cid);
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.lock().contains(cid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State of a pending timestamp refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampState {
    /// Waiting for a worker to pick it up.
    Requested,
    /// Part of a batch a worker is publishing right now.
    Claimed,
}

/// CIDs waiting for their timestamp to be republished.
#[derive(Debug, Default)]
pub struct PendingTimestamps {
    entries: Mutex<HashMap<Cid, TimestampState>>,
}

impl PendingTimestamps {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Cid, TimestampState>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a refresh request. Returns false if the CID is already pending
    /// in either state.
    pub fn request(&self, cid: &Cid) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(cid) {
            return false;
        }
        entries.insert(cid.clone(), TimestampState::Requested);
        true
    }

    /// Move every requested entry to claimed and return them, sorted.
    /// Entries already claimed by another batch are left alone.
    pub fn claim_requested(&self) -> Vec<Cid> {
        let mut entries = self.lock();
        let mut claimed: Vec<Cid> = entries
            .iter_mut()
            .filter(|(_, state)| **state == TimestampState::Requested)
            .map(|(cid, state)| {
                *state = TimestampState::Claimed;
                cid.clone()
            })
            .collect();
        claimed.sort();
        claimed
    }

    /// Drop the entries of a finished batch.
    pub fn complete(&self, cids: &[Cid]) {
        let mut entries = self.lock();
        for cid in cids {
            entries.remove(cid);
        }
    }

    /// Drop a request that was never handed to a worker. Claimed entries are
    /// left for the batch that owns them.
    pub fn withdraw(&self, cid: &Cid) {
        let mut entries = self.lock();
        if entries.get(cid) == Some(&TimestampState::Requested) {
            entries.remove(cid);
        }
    }

    pub fn state(&self, cid: &Cid) -> Option<TimestampState> {
        self.lock().get(cid).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
