//! Literal end-to-end scenarios over a real socket.
//!
//! The whole stack is process-global (router tables, I/O context, worker
//! pool), so one test function runs the scenarios sequentially against a
//! single server instance with workers=1 — which is also what makes the
//! FIFO scenario meaningful.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use corio_web::{routing, ConfigChain, Response, StatusCode};

const ADDR: &str = "127.0.0.1:18921";

fn start_server() {
    ConfigChain::new()
        .listen_addr(ADDR.parse().unwrap())
        .worker_count(1)
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
    routing::post("/submit", |req| {
        if req.body.first() == Some(&b'{') && req.body.last() == Some(&b'}') {
            Response::with_body(
                StatusCode::Ok,
                "application/json",
                "{\"status\":\"received\"}",
            )
        } else {
            routing::error_response(StatusCode::BadRequest)
        }
    });

    std::thread::spawn(corio_web::server::run_for_tests);
}

fn connect() -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(ADDR) {
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            return stream;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    panic!("server did not come up on {}", ADDR);
}

/// Read one response: status line + headers, then a Content-Length body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read response head");
        assert!(n > 0, "connection closed mid-header");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("Content-Length")
                .then(|| value.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("read response body");
    (head, body)
}

#[test]
fn test_end_to_end_scenarios() {
    start_server();

    // 1. Static route.
    {
        let mut stream = connect();
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert_eq!(body, b"Hello, World!");
    }

    // 2. Parameter binding.
    {
        let mut stream = connect();
        stream
            .write_all(b"GET /user/42 HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, b"User ID: 42");
    }

    // 3. POST with body.
    {
        let mut stream = connect();
        stream
            .write_all(b"POST /submit HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let body = String::from_utf8(body).unwrap();
        assert!(body.contains("\"status\":\"received\""), "body: {}", body);
    }

    // 4. OPTIONS *.
    {
        let mut stream = connect();
        stream
            .write_all(b"OPTIONS * HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Allow: GET, HEAD, POST, PUT, DELETE, OPTIONS\r\n"));
        assert!(head.contains("Content-Length: 0\r\n"));
        assert!(body.is_empty());
    }

    // 5. Malformed Content-Length: 400 and the connection closes.
    {
        let mut stream = connect();
        stream
            .write_all(b"POST /submit HTTP/1.1\r\nContent-Length: abc\r\n\r\n")
            .unwrap();
        let (head, _body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "head: {}", head);
        // Server closes after a parse failure: the next read hits EOF.
        let mut rest = Vec::new();
        let n = stream.read_to_end(&mut rest).unwrap();
        assert_eq!(n, 0);
    }

    // 6. 100 keep-alive requests on one socket, responses in order.
    {
        let mut stream = connect();
        for i in 0..100 {
            let request = format!(
                "GET /user/{} HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
                i
            );
            stream.write_all(request.as_bytes()).unwrap();
            let (head, body) = read_response(&mut stream);
            assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
            assert_eq!(body, format!("User ID: {}", i).as_bytes());
        }
    }
}
