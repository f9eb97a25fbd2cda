//! Process-wide publish work queue.
//!
//! A bounded FIFO shared by every repository worker on the host. Request
//! threads push; workers pull with a timeout, and the timeout doubles as
//! their scheduling heartbeat. The queue counts unfinished items (pushed
//! but not yet marked done) so that shutdown can wait for a full drain.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use userpub_protocol::{Cid, ConfigSnapshot};

/// Default number of items the queue holds before producers wait.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Default time a producer waits for space before giving up.
pub const DEFAULT_ENQUEUE_WAIT: Duration = Duration::from_secs(30);

/// Errors from queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("publish queue full after waiting {0:?}")]
    Full(Duration),
}

/// What a worker should do with an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// Publish a staged tarball for the first time.
    FreshPublish,
    /// Publish every timestamp requested so far; the item's CID is only the
    /// one whose request produced this tick.
    TimestampTick,
}

/// One unit of work.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub cid: Cid,
    pub principal: String,
    /// Configuration in effect when the item was queued.
    pub snapshot: Arc<ConfigSnapshot>,
    pub kind: ItemKind,
}

/// Queue tunables.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    pub enqueue_wait: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            enqueue_wait: DEFAULT_ENQUEUE_WAIT,
        }
    }
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<QueueItem>,
    unfinished: usize,
}

/// Bounded, blocking FIFO with drain tracking.
#[derive(Debug)]
pub struct WorkQueue {
    settings: QueueSettings,
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
    all_done: Condvar,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl WorkQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(QueueInner::default()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            all_done: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // A worker panicking mid-push cannot leave the deque inconsistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an item, waiting up to the configured time for space.
    pub fn push(&self, item: QueueItem) -> Result<(), QueueError> {
        let deadline = Instant::now() + self.settings.enqueue_wait;
        let mut inner = self.lock();

        while inner.items.len() >= self.settings.capacity {
            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::Full(self.settings.enqueue_wait));
            }
            inner = self
                .not_full
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }

        inner.items.push_back(item);
        inner.unfinished += 1;
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, waiting up to `timeout`. `None` means the wait
    /// timed out with nothing to do.
    ///
    /// Every item returned must be passed to [`WorkQueue::task_done`].
    pub fn pop(&self, timeout: Duration) -> Option<QueueItem> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();

        loop {
            if let Some(item) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    /// Mark one popped item as fully processed.
    pub fn task_done(&self) {
        let mut inner = self.lock();
        inner.unfinished = inner.unfinished.saturating_sub(1);
        if inner.unfinished == 0 {
            self.all_done.notify_all();
        }
    }

    /// Block until every pushed item has been marked done.
    pub fn join(&self) {
        let mut inner = self.lock();
        while inner.unfinished > 0 {
            inner = self
                .all_done
                .wait(inner)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like [`WorkQueue::join`] but gives up after `timeout`. Returns whether
    /// the queue drained.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        while inner.unfinished > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .all_done
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        true
    }

    /// Items waiting to be popped.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items pushed but not yet marked done.
    pub fn unfinished(&self) -> usize {
        self.lock().unfinished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn item(cid: &str, kind: ItemKind) -> QueueItem {
        QueueItem {
            cid: Cid::parse(cid).unwrap(),
            principal: "tester".to_string(),
            snapshot: Arc::new(ConfigSnapshot::default()),
            kind,
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::default();
        queue.push(item("a", ItemKind::FreshPublish)).unwrap();
        queue.push(item("b", ItemKind::TimestampTick)).unwrap();

        assert_eq!(queue.pop(Duration::ZERO).unwrap().cid.as_str(), "a");
        assert_eq!(queue.pop(Duration::ZERO).unwrap().cid.as_str(), "b");
        assert!(queue.pop(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_pop_times_out_when_empty() {
        let queue = WorkQueue::default();
        let start = Instant::now();
        assert!(queue.pop(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_push_fails_when_full() {
        let queue = WorkQueue::new(QueueSettings {
            capacity: 1,
            enqueue_wait: Duration::from_millis(20),
        });
        queue.push(item("a", ItemKind::FreshPublish)).unwrap();
        let err = queue.push(item("b", ItemKind::FreshPublish)).unwrap_err();
        assert_eq!(err, QueueError::Full(Duration::from_millis(20)));
    }

    #[test]
    fn test_push_waits_for_space() {
        let queue = Arc::new(WorkQueue::new(QueueSettings {
            capacity: 1,
            enqueue_wait: Duration::from_secs(5),
        }));
        queue.push(item("a", ItemKind::FreshPublish)).unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                queue.pop(Duration::ZERO).map(|i| i.cid)
            })
        };

        queue.push(item("b", ItemKind::FreshPublish)).unwrap();
        assert_eq!(consumer.join().unwrap().unwrap().as_str(), "a");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_join_waits_for_task_done() {
        let queue = Arc::new(WorkQueue::default());
        queue.push(item("a", ItemKind::FreshPublish)).unwrap();
        assert_eq!(queue.unfinished(), 1);

        let popped = queue.pop(Duration::ZERO).unwrap();
        assert!(queue.is_empty());
        // Popped but not done: join must still wait.
        assert!(!queue.join_timeout(Duration::from_millis(20)));

        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                drop(popped);
                queue.task_done();
            })
        };

        queue.join();
        worker.join().unwrap();
        assert_eq!(queue.unfinished(), 0);
    }
}
