//! # corio-web — HTTP/1.1 over the corio runtime
//!
//! Request parsing, response formatting, per-method routing tables with a
//! parameterised radix tree, static-file routes, the per-connection handler
//! and the accept loop. The heavy lifting (tasks, queues, the kernel ring)
//! lives in `corio-runtime` and `corio-uring`.

pub mod config;
pub mod http;
pub mod mime;
pub mod routing;
pub mod server;

pub use config::ConfigChain;
pub use http::request::{Method, Parser, Request};
pub use http::response::{Response, StatusCode};
