//! Process-wide server configuration with a builder-chain front.
//!
//! Settings live behind a lazy global; the chain is sugar used at startup:
//!
//! ```ignore
//! ConfigChain::new()
//!     .listen_addr("127.0.0.1:8080".parse().unwrap())
//!     .root_path("www")
//!     .worker_count(4);
//! ```

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::http::response::StatusCode;

pub type ErrorPageProvider = fn(StatusCode) -> String;

struct Config {
    listen_addr: Mutex<Option<SocketAddrV4>>,
    root_path: Mutex<PathBuf>,
    worker_count: AtomicUsize,
    max_worker_conn: AtomicUsize,
    error_page_provider: Mutex<ErrorPageProvider>,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

fn config() -> &'static Config {
    CONFIG.get_or_init(|| Config {
        listen_addr: Mutex::new(None),
        root_path: Mutex::new(PathBuf::from("./www")),
        worker_count: AtomicUsize::new(4),
        max_worker_conn: AtomicUsize::new(128),
        error_page_provider: Mutex::new(default_error_page),
    })
}

fn default_error_page(status: StatusCode) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><title>{code} {reason}</title></head>\n\
         <body><h1>{code} {reason}</h1></body></html>\n",
        code = status.code(),
        reason = status.reason()
    )
}

pub fn listen_addr() -> Option<SocketAddrV4> {
    *config().listen_addr.lock().unwrap()
}

pub fn root_path() -> PathBuf {
    config().root_path.lock().unwrap().clone()
}

pub fn worker_count() -> usize {
    config().worker_count.load(Ordering::Relaxed)
}

/// Listen backlog hint per accepter socket.
pub fn max_worker_conn() -> usize {
    config().max_worker_conn.load(Ordering::Relaxed)
}

pub fn error_page(status: StatusCode) -> String {
    let provider = *config().error_page_provider.lock().unwrap();
    provider(status)
}

/// Builder-chain over the global settings.
pub struct ConfigChain;

impl ConfigChain {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self
    }

    pub fn listen_addr(self, addr: SocketAddrV4) -> Self {
        *config().listen_addr.lock().unwrap() = Some(addr);
        self
    }

    pub fn root_path(self, path: impl Into<PathBuf>) -> Self {
        *config().root_path.lock().unwrap() = path.into();
        self
    }

    pub fn worker_count(self, count: usize) -> Self {
        config().worker_count.store(count, Ordering::Relaxed);
        self
    }

    pub fn max_worker_conn(self, count: usize) -> Self {
        config().max_worker_conn.store(count, Ordering::Relaxed);
        self
    }

    pub fn error_page_provider(self, provider: ErrorPageProvider) -> Self {
        *config().error_page_provider.lock().unwrap() = provider;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        assert_eq!(root_path(), PathBuf::from("./www"));
        assert_eq!(worker_count(), 4);
        assert_eq!(max_worker_conn(), 128);
    }

    #[test]
    fn test_default_error_page_mentions_status() {
        let page = error_page(StatusCode::NotFound);
        assert!(page.contains("404"));
        assert!(page.contains("Not Found"));
    }
}
