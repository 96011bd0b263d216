//! The server loop: accepter sockets, per-connection tasks, signal-driven
//! shutdown.
//!
//! `run()` wires everything together and then turns the calling thread into
//! the I/O listener. One accepter socket is opened per worker, all bound to
//! the same address with `SO_REUSEPORT` so the kernel spreads connections.
//! Each accepted fd gets a detached task that parses requests, routes them
//! and writes responses until the peer closes, errors or times out.

use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use corio_runtime::{dispatch_to_pool, pool, spawn};
use corio_uring::{awaiter, ctx, Fd, IoError};
use nix::sys::signal::{self, SigHandler, Signal};

use crate::config;
use crate::http::request::{Parser, Request};
use crate::http::response::{Response, StatusCode};
use crate::mime;
use crate::routing;

const READ_BUF_SIZE: usize = 8192;
const READ_TIMEOUT: Duration = Duration::from_millis(200);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_millis(1000);

static SIGINT_FLAG: AtomicBool = AtomicBool::new(false);
static ACCEPTER_FDS: OnceLock<Mutex<Vec<RawFd>>> = OnceLock::new();

fn accepter_fds() -> &'static Mutex<Vec<RawFd>> {
    ACCEPTER_FDS.get_or_init(|| Mutex::new(Vec::new()))
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    // Async-signal-safe: just raise the flag; the watcher thread does the
    // queue work.
    SIGINT_FLAG.store(true, Ordering::Release);
}

async fn handle_connection(fd: Fd, peer: SocketAddrV4) {
    dispatch_to_pool().await;

    let mut read_buf = [0u8; READ_BUF_SIZE];
    let mut timeout = READ_TIMEOUT;
    let mut parser = Parser::new();

    loop {
        while parser.is_empty() {
            match awaiter::read(fd.get(), &mut read_buf)
                .link_timeout(timeout)
                .await
            {
                Ok(0) => {
                    log::debug!("{}: peer closed connection", peer);
                    return;
                }
                Ok(n) => parser.feed(&read_buf[..n as usize]),
                Err(e) => {
                    log::debug!("failed to read from {}: {}", peer, e);
                    return;
                }
            }
        }

        let request = match parser.pop_front() {
            Some(Ok(request)) => request,
            Some(Err(e)) => {
                log::error!("failed to parse request from {}: {}", peer, e);
                let response = routing::error_response(StatusCode::BadRequest).to_bytes();
                let _ = awaiter::write(fd.get(), &response)
                    .link_timeout(timeout)
                    .await;
                return;
            }
            None => continue,
        };

        let mut close = false;
        match request.headers.get("Connection").map(String::as_str) {
            Some("close") => close = true,
            Some("keep-alive") => timeout = KEEPALIVE_TIMEOUT,
            _ => {}
        }

        let response = routing::route(&request).to_bytes();
        if let Err(e) = awaiter::write(fd.get(), &response)
            .link_timeout(timeout)
            .await
        {
            log::error!("failed to write response to {}: {}", peer, e);
            return;
        }
        if close {
            return;
        }
    }
}

async fn accept_loop(fd: RawFd) {
    dispatch_to_pool().await;
    loop {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut addrlen: libc::socklen_t = 0;
        match awaiter::accept(fd, &mut addr, &mut addrlen).await {
            Ok(conn) => {
                let peer = corio_uring::fd::sockaddr_in_to(&addr);
                log::info!("fd[{}]: accepted connection from {}", fd, peer);
                spawn(handle_connection(Fd::new(conn), peer));
            }
            Err(IoError::Timeout) => {
                log::debug!("accept timed out, retrying");
            }
            Err(e) => {
                log::error!("failed to accept connection: {}", e);
                return;
            }
        }
    }
}

/// Walk the document root and register a GET (content) and HEAD (size) route
/// per regular file. `index.html` additionally serves its directory path.
fn register_static_file_routes() {
    let root = match std::fs::canonicalize(config::root_path()) {
        Ok(root) => root,
        Err(e) => {
            log::error!(
                "document root {} is not usable: {}",
                config::root_path().display(),
                e
            );
            std::process::abort();
        }
    };
    if !root.is_dir() {
        log::error!("document root {} is not a directory", root.display());
        std::process::abort();
    }
    walk_dir(&root, &root);
}

fn walk_dir(root: &Path, dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("skipping unreadable directory {}: {}", dir.display(), e);
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_dir(root, &path);
        } else if path.is_file() {
            register_file(root, &path);
        }
    }
}

fn register_file(root: &Path, path: &Path) {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) => {
            log::warn!("failed to read {}: {}", path.display(), e);
            return;
        }
    };
    if content.is_empty() {
        log::warn!("skipping empty file: {}", path.display());
        return;
    }

    let relative = path.strip_prefix(root).unwrap_or(path);
    let route = format!("/{}", relative.to_string_lossy());
    let content_type = path
        .extension()
        .map(|ext| mime::from_extension(&ext.to_string_lossy()))
        .unwrap_or("application/octet-stream");

    let mut routes = vec![route.clone()];
    if path.file_name().is_some_and(|n| n == "index.html") {
        let dir_route = route.trim_end_matches("index.html");
        routes.push(dir_route.trim_end_matches('/').to_string() + "/");
        if dir_route != "/" {
            routes.push(dir_route.trim_end_matches('/').to_string());
        }
    }

    let size = content.len();
    let body = Arc::new(content);
    for route in routes {
        if route.is_empty() {
            continue;
        }
        log::info!("adding static route `{}` -> `{}`", route, path.display());
        let body = Arc::clone(&body);
        routing::get(&route, move |_req: &Request| {
            Response::with_body(StatusCode::Ok, content_type, body.as_slice().to_vec())
        });
        routing::head(&route, move |_req: &Request| {
            Response::head_only(content_type, size)
        });
    }
}

fn open_accepters(addr: SocketAddrV4) -> Vec<Fd> {
    let mut accepters = Vec::new();
    for _ in 0..config::worker_count() {
        let fd = Fd::open_socket(addr, config::max_worker_conn(), |raw| {
            let one: libc::c_int = 1;
            unsafe {
                libc::setsockopt(
                    raw,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    (&one as *const libc::c_int).cast(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                libc::setsockopt(
                    raw,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEPORT,
                    (&one as *const libc::c_int).cast(),
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
            }
        });
        if !fd.is_valid() {
            log::error!(
                "failed to open listener socket on {}: {}",
                addr,
                std::io::Error::last_os_error()
            );
            std::process::abort();
        }
        accepters.push(fd);
    }
    accepters
}

fn spawn_sigint_watcher() {
    std::thread::Builder::new()
        .name("corio-signal-watcher".into())
        .spawn(|| {
            while !SIGINT_FLAG.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(50));
            }
            log::info!("received SIGINT, stopping server");
            for fd in accepter_fds().lock().unwrap().iter() {
                let fd = *fd;
                spawn(async move {
                    if let Err(e) = awaiter::cancel_fd(fd).await {
                        log::error!("failed to cancel fd {}: {}", fd, e);
                    }
                });
            }
            ctx::request_stop();
        })
        .expect("failed to spawn signal watcher");
}

/// Start the server and run the I/O listener on the calling thread until a
/// SIGINT-driven stop completes.
pub fn run() {
    let addr = match config::listen_addr() {
        Some(addr) => addr,
        None => {
            log::error!("listen address is not configured");
            std::process::abort();
        }
    };

    pool::init(config::worker_count());
    register_static_file_routes();

    let accepters = open_accepters(addr);
    {
        let mut fds = accepter_fds().lock().unwrap();
        fds.extend(accepters.iter().map(Fd::get));
    }
    for accepter in &accepters {
        spawn(accept_loop(accepter.get()));
    }

    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_sigint))
            .expect("failed to install SIGINT handler");
    }
    spawn_sigint_watcher();

    // Main thread becomes the completion listener; returns after the
    // shutdown drain.
    ctx::run();
    pool::shutdown();
}

/// Test hook: start accepting without installing signal handling, so a
/// harness can drive the server from another thread.
pub fn run_for_tests() {
    let addr = config::listen_addr().expect("listen address is not configured");
    pool::init(config::worker_count());
    let accepters = open_accepters(addr);
    for accepter in &accepters {
        spawn(accept_loop(accepter.get()));
    }
    std::mem::forget(accepters);
    ctx::run();
}
