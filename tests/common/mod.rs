//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::fs;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local, TimeZone};
use tempfile::TempDir;
use userpub::api::{ApiRequest, ApiResponse, Dispatcher};
use userpub::config::ConfigPaths;
use userpub::context::{ServiceContext, ServiceOptions};
use userpub_protocol::ConfigSnapshot;
use userpub_worker::{Clock, QueueSettings, ToolError, ToolInvocation, ToolOutcome, ToolRunner, WorkerSettings};

pub const HOSTNAME: &str = "myhost.example.org";

pub fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

pub fn remote() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10))
}

/// Stand-in for the repository tools. Publishing into the content prefix
/// makes the CID appear on the mirror, the way replication eventually
/// would. Optionally holds every invocation until [`FakeStore::open`].
pub struct FakeStore {
    mirror_root: PathBuf,
    prefix: String,
    calls: Mutex<Vec<Vec<String>>>,
    gate: Mutex<bool>,
    opened: Condvar,
}

impl FakeStore {
    pub fn new(mirror_root: PathBuf, gated: bool) -> Self {
        Self {
            mirror_root,
            prefix: "sw".to_string(),
            calls: Mutex::new(Vec::new()),
            gate: Mutex::new(!gated),
            opened: Condvar::new(),
        }
    }

    pub fn open(&self) {
        *self.gate.lock().unwrap() = true;
        self.opened.notify_all();
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Publish invocations into `pubdir` (`sw` or `ts`).
    pub fn publishes(&self, pubdir: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|args| args.len() == 5 && args[2] == pubdir)
            .collect()
    }

    /// Subcommands passed to the server tool, in order.
    pub fn server_verbs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|args| args.len() < 5)
            .map(|args| args[0].clone())
            .collect()
    }
}

impl ToolRunner for FakeStore {
    fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutcome, ToolError> {
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);

        let args = invocation.args_lossy();
        if args.len() == 5 && args[2] == self.prefix {
            let path = self.mirror_root.join(&args[0]).join(&self.prefix).join(&args[3]);
            fs::create_dir_all(path).unwrap();
        }
        self.calls.lock().unwrap().push(args);
        Ok(ToolOutcome::exited(0))
    }
}

/// Clock pinned to a given local hour.
pub struct FixedClock(pub Mutex<DateTime<Local>>);

impl FixedClock {
    pub fn at_hour(hour: u32) -> Self {
        Self(Mutex::new(Self::time(hour)))
    }

    pub fn set_hour(&self, hour: u32) {
        *self.0.lock().unwrap() = Self::time(hour);
    }

    fn time(hour: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 10, hour, 30, 0).unwrap()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.0.lock().unwrap()
    }
}

/// Body reader that counts what was consumed.
pub struct CountingBody {
    inner: io::Cursor<Vec<u8>>,
    consumed: Arc<AtomicUsize>,
}

impl CountingBody {
    pub fn new(data: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
        let consumed = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: io::Cursor::new(data),
                consumed: Arc::clone(&consumed),
            },
            consumed,
        )
    }
}

impl Read for CountingBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}

/// A service over a scratch directory.
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<FakeStore>,
    /// Pinned outside every default sweep hour.
    pub clock: Arc<FixedClock>,
    pub context: Arc<ServiceContext>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    /// `hostrepos` are `host:repo` entries; use [`HOSTNAME`] for local ones.
    pub fn new(hostrepos: &[&str], gated: bool) -> Self {
        Self::with_extra(hostrepos, gated, "")
    }

    pub fn with_extra(hostrepos: &[&str], gated: bool, extra: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let mut text = format!(
            "queuedir {}\nreporoot {}\nmirrorroot {}\n",
            dir.path().join("queue").display(),
            dir.path().join("repos").display(),
            dir.path().join("mirrors").display()
        );
        for hostrepo in hostrepos {
            text.push_str(&format!("hostrepo {}\n", hostrepo));
        }
        text.push_str(extra);
        let config = dir.path().join("userpub.conf");
        fs::write(&config, text).unwrap();
        let allowlist = dir.path().join("grid-mapfile");
        fs::write(&allowlist, "\"/DC=org/DC=example/CN=UID:alice/CN=Alice\" alice\n").unwrap();

        let store = Arc::new(FakeStore::new(dir.path().join("mirrors"), gated));
        let clock = Arc::new(FixedClock::at_hour(12));
        let context = Arc::new(ServiceContext::new(ServiceOptions {
            paths: ConfigPaths { config, allowlist },
            hostname: HOSTNAME.to_string(),
            runner: store.clone(),
            clock: clock.clone(),
            queue: QueueSettings {
                capacity: 64,
                enqueue_wait: Duration::from_millis(50),
            },
            worker: WorkerSettings {
                drain_timeout: Duration::from_millis(20),
            },
            shutdown_poll: Duration::from_millis(50),
            ..ServiceOptions::default()
        }));
        let dispatcher = Dispatcher::new(Arc::clone(&context));

        Self {
            dir,
            store,
            clock,
            context,
            dispatcher,
        }
    }

    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.context.config().snapshot
    }

    pub fn get(&self, path: &str, query: &str, ip: IpAddr) -> ApiResponse {
        self.dispatcher.handle(ApiRequest::new(path, query, ip))
    }

    pub fn start(&self) {
        let response = self.get("/startup", "", loopback());
        assert_eq!(response.body, "OK\n");
    }

    pub fn publish(&self, cid: &str, body: Vec<u8>) -> ApiResponse {
        let mut request = ApiRequest::new("/publish", format!("cid={}", cid), loopback());
        request.content_length = Some(body.len() as u64);
        request.body = Box::new(io::Cursor::new(body));
        self.dispatcher.handle(request)
    }

    /// Pretend `cid` was published to `repo` earlier.
    pub fn mirror(&self, repo: &str, cid: &str) -> PathBuf {
        let path = self.snapshot().mirror_artifact_path(repo, cid);
        fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.snapshot().queue_dir.clone()
    }

    /// Files left in the staging directory.
    pub fn staged_files(&self) -> Vec<PathBuf> {
        walkdir::WalkDir::new(self.queue_dir())
            .into_iter()
            .flatten()
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.store.open();
        self.context.teardown();
    }
}

/// Poll `cond` until it holds or `limit` passes.
pub fn wait_until(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = std::time::Instant::now() + limit;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
