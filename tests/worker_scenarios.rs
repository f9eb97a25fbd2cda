//! End-to-end scenarios with live repository workers.

mod common;

use std::fs::{self, File};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, SystemTime};

use common::{loopback, wait_until, CountingBody, Harness, HOSTNAME};
use userpub::api::ApiRequest;
use userpub::ServiceState;

const WAIT: Duration = Duration::from_secs(5);

fn local(repo: &str) -> String {
    format!("{}:{}", HOSTNAME, repo)
}

fn set_mtime(path: &std::path::Path, mtime: SystemTime) {
    let file = if path.is_dir() {
        File::open(path).unwrap()
    } else {
        File::options().write(true).open(path).unwrap()
    };
    file.set_modified(mtime).unwrap();
}

#[test]
fn test_concurrent_duplicate_publishes_stage_once() {
    // gated: the first publish stays in flight until the end
    let harness = Harness::new(&[&local("repoA")], true);
    harness.start();
    let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    let (body, consumed) = CountingBody::new(payload.clone());
                    let mut request = ApiRequest::new("/publish", "cid=abc123", loopback());
                    request.content_length = Some(payload.len() as u64);
                    request.body = Box::new(body);
                    let response = harness.dispatcher.handle(request);
                    (response, consumed.load(Ordering::SeqCst))
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (response, consumed) in &results {
        assert_eq!(response.body, "OK\n");
        assert_eq!(*consumed, payload.len(), "every body is read to the end");
    }
    let staged = harness.staged_files();
    assert_eq!(staged.len(), 1);
    assert_eq!(fs::read(&staged[0]).unwrap(), payload);
    assert_eq!(harness.context.queue().unfinished(), 1);
    assert_eq!(harness.context.in_flight().len(), 1);

    harness.store.open();
    harness.context.queue().join();
    assert_eq!(harness.store.publishes("sw").len(), 1);
}

#[test]
fn test_publish_then_exists() {
    let harness = Harness::new(&[&local("repoA")], false);
    harness.start();

    assert_eq!(harness.publish("grp/abc123", b"tarball".to_vec()).body, "OK\n");
    harness.context.queue().join();

    let publishes = harness.store.publishes("sw");
    assert_eq!(publishes.len(), 1);
    assert_eq!(publishes[0][0], "repoA");
    assert_eq!(publishes[0][3], "grp/abc123");
    assert_eq!(publishes[0][4], "localhost");
    assert!(harness.staged_files().is_empty());
    assert!(harness.context.in_flight().is_empty());

    let response = harness.get("/exists", "cid=grp/abc123", loopback());
    let expected = harness.snapshot().repo_root.join("repoA/sw/grp/abc123");
    assert_eq!(response.body, format!("PRESENT:{}\n", expected.display()));

    // publishing again only refreshes the timestamp
    let response = harness.publish("grp/abc123", b"tarball".to_vec());
    assert!(response.body.starts_with("PRESENT:"));
    harness.context.queue().join();
    assert_eq!(harness.store.publishes("sw").len(), 1);
    assert_eq!(harness.store.publishes("ts").len(), 1);
}

#[test]
fn test_updates_coalesce_into_one_timestamp_publish() {
    let harness = Harness::new(&[&local("repoA")], true);
    harness.start();
    harness.mirror("repoA", "abc123");

    for _ in 0..5 {
        let response = harness.get("/update", "cid=abc123", loopback());
        assert!(response.body.starts_with("PRESENT:"), "{}", response.body);
    }

    harness.store.open();
    harness.context.queue().join();

    let stamps = harness.store.publishes("ts");
    assert_eq!(stamps.len(), 1);
    assert_eq!(stamps[0][3], "abc123");
    assert!(harness.context.timestamps().is_empty());
}

#[test]
fn test_shutdown_waits_for_queue() {
    let harness = Harness::new(&[&local("repoA")], true);
    harness.start();
    assert_eq!(harness.publish("abc123", b"tarball".to_vec()).body, "OK\n");

    let store = harness.store.clone();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        store.open();
    });

    let response = harness.get("/shutdown", "", loopback());
    assert_eq!(response.body, "OK\n");
    assert_eq!(harness.store.publishes("sw").len(), 1);
    assert_eq!(harness.context.state(), ServiceState::Stopped);
    opener.join().unwrap();

    let response = harness.get("/exists", "cid=abc123", loopback());
    assert_eq!(response.body, "Bad request: Service not running\n");
}

#[test]
fn test_shutdown_returns_without_local_worker() {
    let harness = Harness::new(&["elsewhere:repoA"], false);

    // left over from an earlier run; requeued by startup with nobody to
    // publish it
    let queue_dir = harness.queue_dir();
    fs::create_dir_all(&queue_dir).unwrap();
    fs::write(queue_dir.join("leftover"), b"tarball").unwrap();
    harness.start();
    assert_eq!(harness.context.queue().unfinished(), 1);

    let response = harness.publish("abc123", b"tarball".to_vec());
    assert_eq!(response.status, 503);
    assert!(!queue_dir.join("abc123").exists());

    let context = harness.context.clone();
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        context.shutdown();
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(WAIT).is_ok(), "shutdown should not wait for a queue nobody drains");
    assert_eq!(harness.context.state(), ServiceState::Stopped);
}

#[test]
fn test_workers_return_after_teardown() {
    let harness = Harness::new(&[&local("repoA")], false);
    harness.start();
    harness.context.teardown();
    assert!(harness.context.registry().running().is_empty());

    harness.start();
    assert_eq!(harness.context.registry().running(), vec!["Pub-repoA".to_string()]);
    assert_eq!(harness.publish("abc123", b"tarball".to_vec()).body, "OK\n");
    assert!(wait_until(WAIT, || harness.store.publishes("sw").len() == 1));
}

#[test]
fn test_one_worker_per_repository() {
    let harness = Harness::new(&[&local("repoA"), "elsewhere:repoB"], false);
    let t0 = SystemTime::now();

    harness.context.config_at(t0);
    assert_eq!(harness.context.registry().running(), vec!["Pub-repoA".to_string()]);

    // re-polls after the cache window find the worker still alive
    harness.context.config_at(t0 + Duration::from_secs(301));
    harness.context.config_at(t0 + Duration::from_secs(602));
    assert_eq!(harness.context.registry().running(), vec!["Pub-repoA".to_string()]);

    // a repository added to the config gets its own worker
    let config = harness.dir.path().join("userpub.conf");
    let mut text = fs::read_to_string(&config).unwrap();
    text.push_str(&format!("hostrepo {}\n", local("repoC")));
    fs::write(&config, text).unwrap();
    set_mtime(&config, t0 + Duration::from_secs(60));

    harness.context.config_at(t0 + Duration::from_secs(903));
    assert_eq!(
        harness.context.registry().running(),
        vec!["Pub-repoA".to_string(), "Pub-repoC".to_string()]
    );
}

#[test]
fn test_sweep_runs_gc_once_per_hour() {
    let harness = Harness::new(&[&local("repoA")], false);
    harness.start();

    // repoA is the first entry: its sweep hour is the default start hour
    harness.clock.set_hour(3);
    assert!(wait_until(WAIT, || harness.store.server_verbs().contains(&"gc".to_string())));
    thread::sleep(Duration::from_millis(150));
    assert_eq!(harness.store.server_verbs(), vec!["gc".to_string()]);
}

#[test]
fn test_sweep_deletes_orphans_and_expired() {
    let harness = Harness::new(&[&local("repoA")], false);
    harness.start();
    let snapshot = harness.snapshot();

    // timestamp for a CID that was never published anywhere
    let orphan = snapshot.timestamp_root("repoA").join("abc123");
    fs::create_dir_all(orphan.parent().unwrap()).unwrap();
    fs::write(&orphan, "").unwrap();

    // old artifact, old on the mirror too
    let old = snapshot.artifact_root("repoA").join("old1");
    fs::create_dir_all(&old).unwrap();
    let long_ago = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    let mirror_artifact = harness.mirror("repoA", "old1");
    set_mtime(&mirror_artifact, long_ago);
    let mirror_stamp = snapshot.mirror_timestamp_path("repoA", "old1");
    fs::create_dir_all(mirror_stamp.parent().unwrap()).unwrap();
    fs::write(&mirror_stamp, "").unwrap();
    set_mtime(&mirror_stamp, long_ago);

    // recently refreshed artifact
    let fresh = snapshot.artifact_root("repoA").join("new1");
    fs::create_dir_all(&fresh).unwrap();
    harness.mirror("repoA", "new1");

    harness.clock.set_hour(3);
    assert!(wait_until(WAIT, || harness.store.server_verbs().contains(&"gc".to_string())));

    assert_eq!(
        harness.store.server_verbs(),
        vec!["transaction".to_string(), "publish".to_string(), "gc".to_string()]
    );
    assert!(!orphan.exists());
    assert!(!old.exists());
    assert!(fresh.exists());
}
