// Daemon composition root
//
// Wires the pieces together and owns the shutdown order: stop claiming
// work, wait for in-flight stages, then tear down the IPC surface so the
// PID file and socket disappear last.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::disc::DiscWatcher;
use crate::error::Result;
use crate::ipc::server::IpcServer;
use crate::logging;
use crate::queue::QueueStore;
use crate::services::Services;
use crate::workflow::WorkflowManager;

/// Run the daemon in the foreground until a stop request arrives.
pub fn run(config: Config) -> Result<()> {
    config.validate()?;
    config.ensure_directories()?;

    let hub = logging::init(&config.log_dir, config.retention_days)?;
    log::info!("Spindle {} starting", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(QueueStore::open(&config.db_path)?);
    let services = Arc::new(Services::new(config, store));

    let manager = Arc::new(WorkflowManager::new(Arc::clone(&services)));
    let shutdown = manager.shutdown_flag();

    let wake_manager = Arc::clone(&manager);
    let watcher = Arc::new(DiscWatcher::new(
        Arc::clone(&services),
        Box::new(move || wake_manager.wake()),
    ));

    // PID lock and socket come up before any work is claimed, so a second
    // daemon fails fast without touching the queue.
    let server = IpcServer::start(
        Arc::clone(&services),
        Arc::clone(&manager),
        Arc::clone(&watcher),
        hub,
        Arc::clone(&shutdown),
    )?;

    Arc::clone(&manager).start()?;

    let watch_watcher = Arc::clone(&watcher);
    let watch_shutdown = Arc::clone(&shutdown);
    let watcher_handle = std::thread::Builder::new()
        .name("disc-watcher".to_string())
        .spawn(move || watch_watcher.watch_loop(watch_shutdown))?;

    log::info!("Spindle ready");
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("Spindle shutting down");
    manager.stop();
    let _ = watcher_handle.join();
    server.stop();
    log::info!("Spindle stopped");
    Ok(())
}
