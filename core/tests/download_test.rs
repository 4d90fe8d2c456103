use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Duration;

use parking_lot::Mutex;
use wselector_core::download::{
    DownloadConfig, DownloadEvent, DownloadManager, EventSink, RetryPolicy, Sleeper, TaskState,
};
use wselector_core::net::{HttpResponse, Transport, TransportError};
use wselector_core::store::AssetStore;
use wselector_core::{AssetKey, CatalogEntry, Category, EntryId, Popularity, Purity, Resolution};

fn entry(id: &str, size: Option<u64>) -> CatalogEntry {
    CatalogEntry {
        id: EntryId::new(id),
        thumbnail_url: format!("https://th.example/small/{id}.jpg"),
        full_url: format!("https://w.example/full/wallhaven-{id}.jpg"),
        resolution: Resolution { width: 3840, height: 2160 },
        category: Category::Anime,
        purity: Purity::Sfw,
        popularity: Popularity { views: 100, favorites: 5 },
        file_size: size,
        file_type: Some("image/jpeg".into()),
    }
}

/// Holds each request until released and counts how many were made.
#[derive(Debug)]
struct HeldTransport {
    calls: AtomicUsize,
    started: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl Transport for HeldTransport {
    fn get(&self, _url: &str) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.started.lock().send(());
        let _ = self.release.lock().recv_timeout(Duration::from_secs(5));
        Ok(HttpResponse::ok(b"full-resolution".to_vec()))
    }
}

/// Fails with the scripted statuses first, then succeeds.
#[derive(Debug)]
struct Flaky {
    failures: Mutex<Vec<u16>>,
    calls: AtomicUsize,
}

impl Transport for Flaky {
    fn get(&self, _url: &str) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock();
        if failures.is_empty() {
            Ok(HttpResponse::ok(b"0123456789".to_vec()))
        } else {
            Ok(HttpResponse::status(failures.remove(0)))
        }
    }
}

#[derive(Debug, Default)]
struct RecordingSleeper(Mutex<Vec<Duration>>);

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.0.lock().push(duration);
    }
}

fn channel_sink() -> (EventSink, Receiver<DownloadEvent>) {
    let (tx, rx) = mpsc::channel();
    let sink: EventSink = Box::new(move |event| {
        let _ = tx.send(event);
    });
    (sink, rx)
}

#[test]
fn duplicate_enqueue_while_running_downloads_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = AssetStore::open(dir.path()).unwrap();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let transport = Arc::new(HeldTransport {
        calls: AtomicUsize::new(0),
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    });
    let (sink, events) = channel_sink();
    let manager = DownloadManager::spawn_with(
        DownloadConfig::default(),
        transport.clone(),
        store.clone(),
        Arc::new(RecordingSleeper::default()),
        sink,
    )
    .unwrap();

    let wallpaper = entry("l8rw5y", None);
    let first = manager.enqueue(&wallpaper).unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(manager.status(first.id).unwrap().state, TaskState::Running);
    let second = manager.enqueue(&wallpaper).unwrap();
    assert_eq!(first, second);

    release_tx.send(()).unwrap();
    let event = events.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(event, DownloadEvent::Succeeded { attempts: 1, .. }));
    assert!(events.recv_timeout(Duration::from_millis(200)).is_err(), "exactly one event");

    assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.read(&AssetKey::full(&wallpaper)).unwrap().as_deref(), Some(&b"full-resolution"[..]));
}

#[test]
fn transient_failures_back_off_then_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let store = AssetStore::open(dir.path()).unwrap();
    let transport = Arc::new(Flaky { failures: Mutex::new(vec![503, 502]), calls: AtomicUsize::new(0) });
    let sleeper = Arc::new(RecordingSleeper::default());
    let (sink, events) = channel_sink();
    let manager = DownloadManager::spawn_with(
        DownloadConfig { concurrency: 1, ..DownloadConfig::default() },
        transport.clone(),
        store,
        sleeper.clone(),
        sink,
    )
    .unwrap();

    let handle = manager.enqueue(&entry("zm3e1o", Some(10))).unwrap();
    match events.recv_timeout(Duration::from_secs(5)).unwrap() {
        DownloadEvent::Succeeded { task, attempts, .. } => {
            assert_eq!(task, handle);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected success, got {other:?}"),
    }

    let delays = sleeper.0.lock().clone();
    assert_eq!(delays, vec![Duration::from_millis(500), Duration::from_secs(1)]);
    assert!(delays.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

    let status = manager.status(handle.id).unwrap();
    assert_eq!(status.attempts, 3);
    assert!(status.last_error.is_some_and(|err| err.is_transient()));
}

#[test]
fn rate_limit_hint_stretches_the_backoff() {
    #[derive(Debug)]
    struct LimitedOnce(AtomicUsize);

    impl Transport for LimitedOnce {
        fn get(&self, _url: &str) -> Result<HttpResponse, TransportError> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut response = HttpResponse::status(429);
                response.retry_after = Some(Duration::from_secs(3));
                Ok(response)
            } else {
                Ok(HttpResponse::ok(b"ok".to_vec()))
            }
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let sleeper = Arc::new(RecordingSleeper::default());
    let (sink, events) = channel_sink();
    let manager = DownloadManager::spawn_with(
        DownloadConfig { retry: RetryPolicy::default(), ..DownloadConfig::default() },
        Arc::new(LimitedOnce(AtomicUsize::new(0))),
        AssetStore::open(dir.path()).unwrap(),
        sleeper.clone(),
        sink,
    )
    .unwrap();

    manager.enqueue(&entry("4x9k2a", None)).unwrap();
    assert!(matches!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        DownloadEvent::Succeeded { attempts: 2, .. }
    ));
    assert_eq!(*sleeper.0.lock(), vec![Duration::from_secs(3)]);
}

#[test]
fn disk_failure_fails_only_that_task() {
    let dir = tempfile::tempdir().unwrap();
    let store = AssetStore::open(dir.path().join("assets")).unwrap();
    let transport = Arc::new(Flaky { failures: Mutex::new(Vec::new()), calls: AtomicUsize::new(0) });
    let (sink, events) = channel_sink();
    let manager = DownloadManager::spawn_with(
        DownloadConfig { concurrency: 1, ..DownloadConfig::default() },
        transport,
        store.clone(),
        Arc::new(RecordingSleeper::default()),
        sink,
    )
    .unwrap();

    // Occupy the shard directory path with a file so the write cannot create it.
    let blocked = entry("blockd", None);
    let target = store.path_for(&AssetKey::full(&blocked));
    let shard = target.parent().unwrap().parent().unwrap();
    std::fs::create_dir_all(shard.parent().unwrap()).unwrap();
    std::fs::write(shard, b"not a directory").unwrap();

    manager.enqueue(&blocked).unwrap();
    match events.recv_timeout(Duration::from_secs(5)).unwrap() {
        DownloadEvent::Failed { error, .. } => {
            assert!(matches!(error.source, wselector_core::CoreError::DiskWrite { .. }));
            assert_eq!(error.attempts, 1);
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let healthy = entry("okay01", None);
    let shard_of_healthy = store.path_for(&AssetKey::full(&healthy));
    if shard_of_healthy.starts_with(shard) {
        return;
    }
    manager.enqueue(&healthy).unwrap();
    assert!(matches!(
        events.recv_timeout(Duration::from_secs(5)).unwrap(),
        DownloadEvent::Succeeded { .. }
    ));
}
