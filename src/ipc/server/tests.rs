// IPC server tests over a real Unix socket.

use super::*;
use crate::config::Config;
use crate::ipc::client::IpcClient;
use crate::queue::{ItemStatus, QueueStore};
use std::io::Write as IoWrite;
use tempfile::TempDir;

struct TestDaemon {
    server: IpcServer,
    services: Arc<Services>,
    _tmp: TempDir,
}

fn start_daemon() -> TestDaemon {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.log_dir = tmp.path().join("logs");
    config.cache.root = tmp.path().join("cache");
    config.staging_dir = tmp.path().join("staging");
    config.library_dir = tmp.path().join("library");
    config.transcript_cache_dir = tmp.path().join("transcripts");
    config.ensure_directories().unwrap();

    let store = Arc::new(QueueStore::open_in_memory().unwrap());
    let services = Arc::new(Services::new(config, store));
    let manager = Arc::new(WorkflowManager::new(Arc::clone(&services)));
    let watcher = Arc::new(DiscWatcher::new(Arc::clone(&services), Box::new(|| {})));
    let hub = LogHub::in_memory();
    let shutdown = Arc::new(AtomicBool::new(false));

    let server = IpcServer::start(
        Arc::clone(&services),
        manager,
        watcher,
        hub,
        shutdown,
    )
    .unwrap();

    TestDaemon {
        server,
        services,
        _tmp: tmp,
    }
}

fn write_mkv(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    let mut file = fs::File::create(&path).unwrap();
    file.write_all(b"fake matroska payload").unwrap();
    path
}

#[test]
fn test_pid_lock_enforces_single_daemon() {
    let tmp = TempDir::new().unwrap();
    let pid_path = tmp.path().join("spindle.pid");

    let lock = PidLock::acquire(&pid_path).unwrap();
    let err = PidLock::acquire(&pid_path).unwrap_err();
    match err {
        SpindleError::AlreadyRunning(pid) => assert_eq!(pid, std::process::id()),
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }

    // Orderly release frees the path for the next daemon
    drop(lock);
    assert!(!pid_path.exists());
    PidLock::acquire(&pid_path).unwrap();
}

#[test]
fn test_status_round_trip() {
    let daemon = start_daemon();
    let socket = daemon.services.config.socket_path();

    let response = IpcClient::send(&socket, &Request::Status).unwrap();
    match response {
        Response::Status(status) => {
            assert_eq!(status.pid, std::process::id());
            assert_eq!(status.queue.total, 0);
            assert!(!status.watcher.paused);
        }
        other => panic!("unexpected response: {:?}", other),
    }
    daemon.server.stop();
}

#[test]
fn test_add_file_validates_and_inserts() {
    let daemon = start_daemon();
    let socket = daemon.services.config.socket_path();
    let mut client = IpcClient::connect(&socket).unwrap();

    // Unsupported extension is a validation error on the wire
    let bad = write_mkv(daemon._tmp.path(), "clip.wmv");
    let response = client
        .request(&Request::QueueAddFile { path: bad })
        .unwrap();
    match response {
        Response::Error { kind, .. } => assert_eq!(kind, "validation"),
        other => panic!("unexpected response: {:?}", other),
    }

    // Missing file likewise
    let response = client
        .request(&Request::QueueAddFile {
            path: daemon._tmp.path().join("nope.mkv"),
        })
        .unwrap();
    assert!(matches!(response, Response::Error { .. }));

    // A real mkv inserts at pending
    let good = write_mkv(daemon._tmp.path(), "clip.mkv");
    let response = client
        .request(&Request::QueueAddFile { path: good })
        .unwrap();
    let item = match response {
        Response::Item(item) => item,
        other => panic!("unexpected response: {:?}", other),
    };
    assert_eq!(item.status, ItemStatus::Pending);
    assert_eq!(
        item.metadata.as_ref().and_then(|m| m.source_size_bytes),
        Some(21)
    );
    daemon.server.stop();
}

#[test]
fn test_queue_operations_in_order_on_one_connection() {
    let daemon = start_daemon();
    let socket = daemon.services.config.socket_path();
    let mut client = IpcClient::connect(&socket).unwrap();

    let file = write_mkv(daemon._tmp.path(), "a.mkv");
    let item = match client.request(&Request::QueueAddFile { path: file }).unwrap() {
        Response::Item(item) => item,
        other => panic!("unexpected response: {:?}", other),
    };

    // describe -> stop -> list, all on the same connection
    match client.request(&Request::QueueDescribe { id: item.id }).unwrap() {
        Response::Item(described) => assert_eq!(described.id, item.id),
        other => panic!("unexpected response: {:?}", other),
    }

    match client.request(&Request::QueueStop { ids: vec![item.id] }).unwrap() {
        Response::StopOutcomes(outcomes) => assert_eq!(outcomes.len(), 1),
        other => panic!("unexpected response: {:?}", other),
    }

    match client
        .request(&Request::QueueList {
            statuses: Some(vec![ItemStatus::Failed]),
        })
        .unwrap()
    {
        Response::Items(items) => {
            assert_eq!(items.len(), 1);
            assert_eq!(items[0].id, item.id);
        }
        other => panic!("unexpected response: {:?}", other),
    }

    // Unknown id is a not_found wire error
    match client.request(&Request::QueueDescribe { id: 9999 }).unwrap() {
        Response::Error { kind, .. } => assert_eq!(kind, "not_found"),
        other => panic!("unexpected response: {:?}", other),
    }
    daemon.server.stop();
}

#[test]
fn test_database_health_over_ipc() {
    let daemon = start_daemon();
    let socket = daemon.services.config.socket_path();

    match IpcClient::send(&socket, &Request::DatabaseHealth).unwrap() {
        Response::Database(health) => {
            assert!(health.is_ok());
            assert_eq!(health.item_count, 0);
        }
        other => panic!("unexpected response: {:?}", other),
    }
    daemon.server.stop();
}

#[test]
fn test_disc_pause_resume_over_ipc() {
    let daemon = start_daemon();
    let socket = daemon.services.config.socket_path();
    let mut client = IpcClient::connect(&socket).unwrap();

    match client.request(&Request::DiscPause).unwrap() {
        Response::Watcher(status) => assert!(status.paused),
        other => panic!("unexpected response: {:?}", other),
    }
    match client.request(&Request::DiscResume).unwrap() {
        Response::Watcher(status) => assert!(!status.paused),
        other => panic!("unexpected response: {:?}", other),
    }
    daemon.server.stop();
}
