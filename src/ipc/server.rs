// IPC server: Unix socket endpoint and single-daemon enforcement
//
// The PID file is the single-daemon authority: an exclusive flock plus the
// owner's pid. Whoever holds the lock may freely replace a stale socket
// file left by a crashed predecessor. Connections get a thread each;
// requests on one connection are answered strictly in order.

use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::constants::DEFAULT_FOLLOW_WAIT_MILLIS;
use crate::disc::DiscWatcher;
use crate::error::{Result, SpindleError};
use crate::ipc::{read_frame, write_frame, DaemonStatus, Request, Response};
use crate::logging::LogHub;
use crate::services::Services;
use crate::workflow::WorkflowManager;

/// Exclusive PID file. Held for the daemon's lifetime; dropped on orderly
/// shutdown, which also removes the file.
#[derive(Debug)]
pub struct PidLock {
    file: fs::File,
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<PidLock> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let mut reader = &file;
            let _ = reader.read_to_string(&mut holder);
            let pid = holder.trim().parse().unwrap_or(0);
            return Err(SpindleError::AlreadyRunning(pid));
        }

        file.set_len(0)?;
        let mut writer = &file;
        writeln!(writer, "{}", std::process::id())?;
        writer.flush()?;

        Ok(PidLock {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

struct ServerCtx {
    services: Arc<Services>,
    manager: Arc<WorkflowManager>,
    watcher: Arc<DiscWatcher>,
    hub: Arc<LogHub>,
    shutdown: Arc<AtomicBool>,
    started: Instant,
}

pub struct IpcServer {
    ctx: Arc<ServerCtx>,
    socket_path: PathBuf,
    _pid_lock: PidLock,
    accept_handle: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    /// Bind the socket, write the PID file, and start accepting. Fails fast
    /// with `AlreadyRunning` when another daemon holds the PID lock.
    pub fn start(
        services: Arc<Services>,
        manager: Arc<WorkflowManager>,
        watcher: Arc<DiscWatcher>,
        hub: Arc<LogHub>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<IpcServer> {
        let pid_lock = PidLock::acquire(&services.config.pid_path())?;

        let socket_path = services.config.socket_path();
        // We hold the PID lock, so any existing socket file is stale
        let _ = fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;

        let ctx = Arc::new(ServerCtx {
            services,
            manager,
            watcher,
            hub,
            shutdown,
            started: Instant::now(),
        });

        let accept_ctx = Arc::clone(&ctx);
        let accept_handle = std::thread::Builder::new()
            .name("ipc-accept".to_string())
            .spawn(move || accept_loop(listener, accept_ctx))?;

        log::info!("IPC listening at {}", socket_path.display());
        Ok(IpcServer {
            ctx,
            socket_path,
            _pid_lock: pid_lock,
            accept_handle: Mutex::new(Some(accept_handle)),
        })
    }

    /// Wait for the accept loop to finish (it exits once the shutdown flag
    /// is set) and remove the socket file.
    pub fn stop(&self) {
        self.ctx.shutdown.store(true, Ordering::Relaxed);
        let handle = self
            .accept_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn accept_loop(listener: UnixListener, ctx: Arc<ServerCtx>) {
    while !ctx.shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, _)) => {
                let conn_ctx = Arc::clone(&ctx);
                let spawned = std::thread::Builder::new()
                    .name("ipc-conn".to_string())
                    .spawn(move || handle_connection(stream, conn_ctx));
                if let Err(e) = spawned {
                    log::error!("Failed to spawn IPC connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => {
                log::error!("IPC accept failed: {}", e);
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }
}

fn handle_connection(mut stream: UnixStream, ctx: Arc<ServerCtx>) {
    loop {
        let request: Request = match read_frame(&mut stream) {
            Ok(Some(request)) => request,
            Ok(None) => return, // peer closed
            Err(e) => {
                log::debug!("IPC connection dropped: {}", e);
                return;
            }
        };

        let response = dispatch(&ctx, &request);
        if let Err(e) = write_frame(&mut stream, &response) {
            log::debug!("IPC reply failed: {}", e);
            return;
        }

        if matches!(request, Request::Stop) {
            ctx.shutdown.store(true, Ordering::Relaxed);
            ctx.manager.wake();
            return;
        }
    }
}

fn dispatch(ctx: &ServerCtx, request: &Request) -> Response {
    match try_dispatch(ctx, request) {
        Ok(response) => response,
        Err(error) => Response::error(&error),
    }
}

fn try_dispatch(ctx: &ServerCtx, request: &Request) -> Result<Response> {
    let services = &ctx.services;
    match request {
        Request::Status => {
            let cache_stats = services.cache.stats()?;
            Ok(Response::Status(Box::new(DaemonStatus {
                pid: std::process::id(),
                uptime_seconds: ctx.started.elapsed().as_secs(),
                queue: services.store.health()?,
                lanes: ctx.manager.lane_activity(),
                watcher: ctx.watcher.status(),
                stages: ctx.manager.stage_health(),
                cache_entries: cache_stats.entries,
                cache_total_bytes: cache_stats.total_bytes,
            })))
        }
        Request::Stop => Ok(Response::Ok),
        Request::QueueList { statuses } => {
            let filter = statuses.clone().unwrap_or_default();
            Ok(Response::Items(services.store.list(&filter)?))
        }
        Request::QueueStatus => Ok(Response::Stats(services.store.stats()?)),
        Request::QueueHealth => Ok(Response::Health(services.store.health()?)),
        Request::QueueDescribe { id } => {
            let item = services
                .store
                .get(*id)?
                .ok_or_else(|| SpindleError::NotFound(format!("item {}", id)))?;
            Ok(Response::Item(Box::new(item)))
        }
        Request::QueueRemove { ids } => Ok(Response::Count {
            count: services.store.remove(ids)?,
        }),
        Request::QueueClear { scope } => Ok(Response::Count {
            count: services.store.clear(*scope)?,
        }),
        Request::QueueResetStuck => Ok(Response::Count {
            count: services
                .store
                .reset_stuck(services.config.stale_deadline_seconds())?,
        }),
        Request::QueueRetry { ids } => {
            let count = services.store.retry(ids.as_deref())?;
            ctx.manager.wake();
            Ok(Response::Count { count })
        }
        Request::QueueRetryEpisode { id, episode_key } => {
            let new_status = services.store.retry_episode(*id, episode_key)?;
            ctx.manager.wake();
            Ok(Response::RetryEpisode { new_status })
        }
        Request::QueueStop { ids } => {
            let outcomes = services.store.stop(ids)?;
            ctx.manager.wake();
            Ok(Response::StopOutcomes(outcomes))
        }
        Request::QueueAddFile { path } => {
            if !path.exists() {
                return Err(SpindleError::Validation(format!(
                    "file does not exist: {}",
                    path.display()
                )));
            }
            let mut item = services.store.create_file(path)?;
            // Remember the source size for later sanity checks
            if let Ok(meta) = fs::metadata(path) {
                let mut doc = crate::media::MediaMetadata::movie(
                    path.file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_default(),
                    None,
                );
                doc.source_size_bytes = Some(meta.len());
                item.metadata = Some(doc);
                services.store.update(&item)?;
            }
            ctx.manager.wake();
            log::info!("Item {}: queued file {}", item.id, path.display());
            Ok(Response::Item(Box::new(item)))
        }
        Request::ProcessCached {
            fingerprint,
            allow_duplicate,
        } => Ok(Response::Inserted(
            ctx.watcher.process_cached_entry(fingerprint, *allow_duplicate)?,
        )),
        Request::DiscPause => {
            ctx.watcher.pause();
            Ok(Response::Watcher(ctx.watcher.status()))
        }
        Request::DiscResume => {
            ctx.watcher.resume();
            Ok(Response::Watcher(ctx.watcher.status()))
        }
        Request::DiscDetected {
            device,
            allow_duplicate,
        } => Ok(Response::Inserted(
            ctx.watcher.notify_inserted(device, *allow_duplicate)?,
        )),
        Request::CacheStats => Ok(Response::Cache(Box::new(services.cache.stats()?))),
        Request::CacheRemove {
            number,
            fingerprint,
        } => match (number, fingerprint) {
            (Some(number), _) => {
                let (fingerprint, bytes_freed) = services.cache.remove_entry_by_number(*number)?;
                Ok(Response::CacheRemoved {
                    fingerprint,
                    bytes_freed,
                })
            }
            (None, Some(fingerprint)) => {
                let bytes_freed = services.cache.remove_by_fingerprint(fingerprint)?;
                Ok(Response::CacheRemoved {
                    fingerprint: fingerprint.clone(),
                    bytes_freed,
                })
            }
            (None, None) => Err(SpindleError::Validation(
                "cache_remove needs an entry number or a fingerprint".to_string(),
            )),
        },
        Request::CacheClear => {
            let (count, bytes_freed) = services.cache.clear()?;
            Ok(Response::CacheCleared { count, bytes_freed })
        }
        Request::DatabaseHealth => Ok(Response::Database(Box::new(
            services.store.database_health()?,
        ))),
        Request::NotificationTest => {
            if services.notifier.send_test() {
                Ok(Response::Ok)
            } else {
                Err(SpindleError::Configuration(
                    "no notification backend configured".to_string(),
                ))
            }
        }
        Request::LogTail {
            offset,
            limit,
            follow,
            wait_ms,
        } => {
            let wait = Duration::from_millis(if *wait_ms == 0 {
                DEFAULT_FOLLOW_WAIT_MILLIS
            } else {
                *wait_ms
            });
            let (lines, offset) = ctx.hub.tail(*offset, *limit, *follow, wait);
            Ok(Response::LogLines { lines, offset })
        }
        Request::LogStream {
            since,
            limit,
            follow,
            wait_ms,
            filters,
        } => {
            let wait = Duration::from_millis(if *wait_ms == 0 {
                DEFAULT_FOLLOW_WAIT_MILLIS
            } else {
                *wait_ms
            });
            let (events, next, dropped) = ctx.hub.stream(*since, *limit, *follow, wait, filters);
            Ok(Response::LogEvents {
                events,
                next,
                dropped,
            })
        }
    }
}

#[cfg(test)]
mod tests;
