#![deny(clippy::unwrap_used)]

// The local endpoint compile clients talk to. Binds a posix stream socket,
// checks the peer's effective uid on every accepted connection, and drives
// each request through `task::run`. The named-pipe transport is declared as
// an interface only; no adapter is implemented.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

#[cfg(unix)]
use std::{
    os::fd::{AsRawFd, RawFd},
    os::unix::fs::PermissionsExt,
};

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use anyhow::{Context, Result};
use ccx_shared::{RunRequestData, RunRequestDataWire};
use tokio::sync::watch;

use crate::{engine::Engine, task};

const SOCKET_MODE: u32 = 0o600;

#[derive(Clone, Copy, Debug)]
struct PeerCred {
    uid: u32,
}

// Flips once the peer half-closes its end of the socket.
#[derive(Clone)]
struct CloseNotifier(watch::Receiver<bool>);

pub trait LocalTransport: Send + Sync {
    fn describe(&self) -> String;
}

pub struct PosixSocketTransport {
    pub path: PathBuf,
}

impl LocalTransport for PosixSocketTransport {
    fn describe(&self) -> String {
        format!("unix:{}", self.path.display())
    }
}

#[cfg(windows)]
pub struct NamedPipeTransport {
    pub name: String,
    pub busy_retry: std::time::Duration,
}

#[cfg(windows)]
impl LocalTransport for NamedPipeTransport {
    fn describe(&self) -> String {
        format!("pipe:{}", self.name)
    }
}

#[derive(Default)]
pub struct IdleCounter {
    active: AtomicUsize,
}

impl IdleCounter {
    pub fn is_idle(&self) -> bool {
        self.active.load(Ordering::Acquire) == 0
    }

    fn guard(self: &Arc<Self>) -> IdleGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        IdleGuard(self.clone())
    }
}

struct IdleGuard(Arc<IdleCounter>);

impl Drop for IdleGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

pub fn backpressure_cap(worker_threads: usize) -> usize {
    let max_total_fds = rlimit_nofile().unwrap_or(4096) as usize;
    (max_total_fds / 3)
        .saturating_sub(worker_threads * 2)
        .saturating_sub(2)
        .max(1)
}

#[cfg(unix)]
fn rlimit_nofile() -> Option<u64> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is POD sized exactly for this call.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    (rc == 0).then_some(rlim.rlim_cur as u64)
}

#[cfg(not(unix))]
fn rlimit_nofile() -> Option<u64> {
    None
}

#[cfg(unix)]
fn process_uid() -> u32 {
    // SAFETY: getuid takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(unix)]
fn on_connect(connection: &dyn std::any::Any, extensions: &mut actix_web::dev::Extensions) {
    let Some(stream) = connection.downcast_ref::<actix_web::rt::net::UnixStream>() else {
        return;
    };
    let peer_uid = stream
        .peer_cred()
        .map(|cred| cred.uid())
        .unwrap_or(u32::MAX);
    extensions.insert(PeerCred { uid: peer_uid });

    let (tx, rx) = watch::channel(false);
    extensions.insert(CloseNotifier(rx));

    if let Ok(dup_fd) = dup_raw_fd(stream.as_raw_fd()) {
        tokio::spawn(watch_for_peer_close(dup_fd, tx));
    }
}

#[cfg(unix)]
fn dup_raw_fd(fd: RawFd) -> std::io::Result<RawFd> {
    // SAFETY: `fd` is the valid, open socket fd of the connection actix just accepted.
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(dup)
    }
}

// Watches a duplicated fd for the peer closing its write half mid-request
// (`recv(MSG_PEEK)` returning zero bytes) without disturbing the bytes
// actix-web itself is reading from the original fd.
#[cfg(unix)]
async fn watch_for_peer_close(fd: RawFd, tx: watch::Sender<bool>) {
    // SAFETY: `fd` was freshly `dup`'d above and is owned solely by this task.
    let std_stream = unsafe { <std::os::unix::net::UnixStream as std::os::fd::FromRawFd>::from_raw_fd(fd) };
    if std_stream.set_nonblocking(true).is_err() {
        return;
    }
    let Ok(stream) = tokio::net::UnixStream::from_std(std_stream) else {
        return;
    };
    let mut peek_buf = [0u8; 1];
    loop {
        if tx.is_closed() {
            return;
        }
        if stream.readable().await.is_err() {
            return;
        }
        let raw = stream.as_raw_fd();
        let peeked = stream.try_io(tokio::io::Interest::READABLE, || {
            // SAFETY: `raw` stays open for the duration of this call; `peek_buf` is
            // sized for the read and MSG_PEEK leaves the socket buffer untouched.
            let n = unsafe {
                libc::recv(
                    raw,
                    peek_buf.as_mut_ptr() as *mut libc::c_void,
                    peek_buf.len(),
                    libc::MSG_PEEK,
                )
            };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n)
            }
        });
        match peeked {
            Ok(0) => {
                let _ = tx.send(true);
                return;
            }
            Ok(_) => {
                // Bytes are sitting in the socket buffer (the request itself); the
                // peer hasn't closed, and there's nothing further to watch for
                // until it does on a later wakeup.
                return;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => return,
        }
    }
}

#[cfg(not(unix))]
fn on_connect(_connection: &dyn std::any::Any, _extensions: &mut actix_web::dev::Extensions) {}

#[cfg(not(unix))]
fn process_uid() -> u32 {
    0
}

#[actix_web::get("/")]
async fn route_index() -> impl actix_web::Responder {
    "ccx_daemon"
}

#[actix_web::post("/run")]
async fn route_run(
    req: HttpRequest,
    body: web::Json<RunRequestDataWire>,
    engine: web::Data<Engine>,
    idle: web::Data<IdleCounter>,
) -> HttpResponse {
    let peer_uid = req.conn_data::<PeerCred>().map(|cred| cred.uid);
    if peer_uid != Some(process_uid()) {
        log::warn!(
            "rejecting IPC connection from uid {:?}, daemon runs as {}",
            peer_uid,
            process_uid()
        );
        return HttpResponse::Forbidden().finish();
    }

    let request = match RunRequestData::from_wire(&body) {
        Ok(request) => request,
        Err(err) => {
            return HttpResponse::BadRequest().body(format!("malformed request envelope: {err}"));
        }
    };

    let _idle_guard = idle.into_inner().guard();

    let canceled = Arc::new(AtomicBool::new(false));
    if let Some(notifier) = req.conn_data::<CloseNotifier>() {
        let mut rx = notifier.0.clone();
        let canceled_for_watch = canceled.clone();
        tokio::spawn(async move {
            if rx.changed().await.is_ok() && *rx.borrow() {
                canceled_for_watch.store(true, Ordering::Release);
            }
        });
    }

    match task::run(engine.into_inner(), request, canceled).await {
        Some(response) => HttpResponse::Ok().json(response.to_wire()),
        // Client disconnected before a reply could be produced, no bytes go back.
        None => HttpResponse::Ok().finish(),
    }
}

// How long a graceful shutdown waits for in-flight tasks before actix-web
// drops them anyway.
const SHUTDOWN_DRAIN_SECS: u64 = 30;

#[cfg(unix)]
pub async fn serve(
    engine: web::Data<Engine>,
    idle: web::Data<IdleCounter>,
    path: &Path,
    worker_threads: usize,
) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("removing stale socket"),
    }

    let engine_for_shutdown = engine.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .app_data(idle.clone())
            .service(route_index)
            .service(route_run)
    })
    .on_connect(on_connect)
    .max_connections(backpressure_cap(worker_threads))
    .shutdown_timeout(SHUTDOWN_DRAIN_SECS)
    .bind_uds(path)
    .with_context(|| format!("binding local socket at {}", path.display()))?
    .run();

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))
        .await
        .ok();

    let handle = server.handle();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log::info!("shutdown requested, draining in-flight tasks");
        handle.stop(true).await;
    });

    log::info!("ccx_daemon listening on unix:{}", path.display());
    let result = server.await.context("IPC listener stopped");

    if let Err(err) = engine_for_shutdown.compiler_info_cache.checkpoint() {
        log::warn!("failed to checkpoint compiler-info cache on shutdown: {err:#}");
    }
    result
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            log::warn!("failed to install SIGTERM handler: {err}");
            std::future::pending::<()>().await;
            unreachable!()
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
pub async fn serve(
    _engine: web::Data<Engine>,
    _idle: web::Data<IdleCounter>,
    _path: &Path,
    _worker_threads: usize,
) -> Result<()> {
    anyhow::bail!("the named-pipe transport is an interface only; no adapter is implemented")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_cap_is_never_zero_even_on_tiny_rlimits() {
        assert!(backpressure_cap(64) >= 1);
    }

    #[test]
    fn backpressure_cap_shrinks_as_worker_threads_grow() {
        let small = backpressure_cap(2);
        let large = backpressure_cap(32);
        assert!(large <= small);
    }

    #[test]
    fn idle_counter_starts_idle_and_tracks_guards() {
        let counter = Arc::new(IdleCounter::default());
        assert!(counter.is_idle());
        {
            let _guard = counter.guard();
            assert!(!counter.is_idle());
        }
        assert!(counter.is_idle());
    }

    #[tokio::test]
    async fn posix_transport_describes_its_path() {
        let transport = PosixSocketTransport {
            path: PathBuf::from("/tmp/ccx.sock"),
        };
        assert_eq!(transport.describe(), "unix:/tmp/ccx.sock");
    }
}
