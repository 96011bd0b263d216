//! corio-httpd — demo HTTP/1.1 server.
//!
//! Usage:
//!     corio-httpd --address 127.0.0.1:8080 --path ./www
//!
//! Serves the document root plus a few dynamic routes exercising the
//! router, parameter binding and JSON bodies.

use std::net::SocketAddrV4;

use corio_web::{routing, ConfigChain, Response, StatusCode};

fn usage_and_exit(program: &str) -> ! {
    eprintln!("usage: {} [--address <host:port>] [--path <docroot>]", program);
    std::process::exit(1);
}

fn parse_args() -> (SocketAddrV4, String) {
    let args: Vec<String> = std::env::args().collect();
    let mut address: SocketAddrV4 = "127.0.0.1:8080".parse().unwrap();
    let mut docroot = "./www".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--address" | "-a" => {
                i += 1;
                let value = args.get(i).unwrap_or_else(|| usage_and_exit(&args[0]));
                address = value.parse().unwrap_or_else(|_| {
                    eprintln!("invalid address: {}", value);
                    std::process::exit(1);
                });
            }
            "--path" | "-p" => {
                i += 1;
                let value = args.get(i).unwrap_or_else(|| usage_and_exit(&args[0]));
                docroot = value.clone();
            }
            _ => usage_and_exit(&args[0]),
        }
        i += 1;
    }
    (address, docroot)
}

fn main() {
    corio_log::init();

    let (address, docroot) = parse_args();
    ConfigChain::new()
        .listen_addr(address)
        .root_path(docroot)
        .worker_count(4)
        .max_worker_conn(128);

    routing::get("/hello", |_req| {
        Response::with_body(StatusCode::Ok, "text/plain", "Hello, World!")
    });

    routing::dynamic::get("/user/{id}", |_req, params| {
        Response::with_body(
            StatusCode::Ok,
            "text/plain",
            format!("User ID: {}", params["id"]),
        )
    });

    routing::get("/data", |_req| {
        let payload = serde_json::json!({
            "message": "Hello, JSON!",
            "value": 42,
            "array": [1, 2, 3],
        });
        Response::with_body(StatusCode::Ok, "application/json", payload.to_string())
    });

    routing::post("/submit", |req| {
        let parsed: Result<serde_json::Value, _> = serde_json::from_slice(&req.body);
        match parsed {
            Ok(serde_json::Value::Object(mut object)) => {
                object.insert("status".into(), "received".into());
                Response::with_body(
                    StatusCode::Ok,
                    "application/json",
                    serde_json::Value::Object(object).to_string(),
                )
            }
            _ => routing::error_response(StatusCode::BadRequest),
        }
    });

    log::info!("listening on {}", address);
    corio_web::server::run();
}
