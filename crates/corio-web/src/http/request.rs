//! Request model and the incremental parser.
//!
//! The parser is a message-bearing task: the connection handler feeds it raw
//! read buffers with [`Parser::feed`] and collects parsed messages (or a
//! parse failure) from [`Parser::pop_front`]. Inside, a plain async loop
//! awaits more input whenever a line or body is incomplete — the state
//! machine between chunks is just the loop's local variables.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use corio_runtime::{MessageSource, SendableTask};

use super::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Connect,
    Trace,
}

pub const METHOD_COUNT: usize = 8;

impl Method {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            "CONNECT" => Some(Self::Connect),
            "TRACE" => Some(Self::Trace),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::Get => 0,
            Self::Post => 1,
            Self::Put => 2,
            Self::Delete => 3,
            Self::Head => 4,
            Self::Options => 5,
            Self::Connect => 6,
            Self::Trace => 7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Origin { path: String, query: String },
    Asterisk,
    Absolute,
    Authority,
}

#[derive(Debug, Clone)]
pub struct RequestLine {
    pub method: Method,
    pub target: Target,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub line: RequestLine,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

type ParseOutcome = Result<Request, ParseError>;
type OutQueue = Arc<Mutex<VecDeque<ParseOutcome>>>;

/// Incremental HTTP/1.1 request parser.
pub struct Parser {
    task: SendableTask<Vec<u8>>,
    queue: OutQueue,
}

impl Parser {
    pub fn new() -> Self {
        let queue: OutQueue = Arc::new(Mutex::new(VecDeque::new()));
        let out = Arc::clone(&queue);
        let task = SendableTask::new(move |source| parse_loop(source, out));
        Self { task, queue }
    }

    /// Feed one chunk of raw input.
    pub fn feed(&mut self, data: &[u8]) {
        self.task.send(data.to_vec());
    }

    /// True while no complete message (or failure) is available.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }

    /// Take the next parsed message; `Err` marks a malformed request, after
    /// which the parser produces nothing further.
    pub fn pop_front(&mut self) -> Option<ParseOutcome> {
        self.queue.lock().unwrap().pop_front()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

async fn parse_loop(source: MessageSource<Vec<u8>>, out: OutQueue) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        // Tolerate blank lines between pipelined messages.
        let line = loop {
            let line = read_line(&mut buf, &source).await;
            if !line.is_empty() {
                break line;
            }
        };

        let request_line = match parse_request_line(&line) {
            Ok(line) => line,
            Err(e) => {
                out.lock().unwrap().push_back(Err(e));
                return;
            }
        };

        let mut headers = HashMap::new();
        loop {
            let line = read_line(&mut buf, &source).await;
            if line.is_empty() {
                break;
            }
            match parse_header(&line) {
                Ok((name, value)) => {
                    headers.insert(name, value);
                }
                Err(e) => {
                    out.lock().unwrap().push_back(Err(e));
                    return;
                }
            }
        }

        let body_len = match headers.get("Content-Length") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(len) => len,
                Err(_) => {
                    out.lock().unwrap().push_back(Err(ParseError::BadContentLength));
                    return;
                }
            },
            None => 0,
        };
        while buf.len() < body_len {
            let chunk = source.recv().await;
            buf.extend_from_slice(&chunk);
        }
        let body: Vec<u8> = buf.drain(..body_len).collect();

        out.lock().unwrap().push_back(Ok(Request {
            line: request_line,
            headers,
            body,
        }));
    }
}

async fn read_line(buf: &mut Vec<u8>, source: &MessageSource<Vec<u8>>) -> Vec<u8> {
    loop {
        if let Some(pos) = find_crlf(buf) {
            let mut line: Vec<u8> = buf.drain(..pos + 2).collect();
            line.truncate(pos);
            return line;
        }
        let chunk = source.recv().await;
        buf.extend_from_slice(&chunk);
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadRequestLine)?;
    let mut parts = line.splitn(3, ' ');
    let method = parts
        .next()
        .and_then(Method::from_token)
        .ok_or(ParseError::BadRequestLine)?;
    let target = parse_target(parts.next().ok_or(ParseError::BadRequestLine)?)?;
    let version = parts.next().ok_or(ParseError::BadRequestLine)?;
    if !version.starts_with("HTTP/") {
        return Err(ParseError::BadRequestLine);
    }
    Ok(RequestLine {
        method,
        target,
        version: version.to_string(),
    })
}

fn parse_target(target: &str) -> Result<Target, ParseError> {
    if target == "*" {
        return Ok(Target::Asterisk);
    }
    if target.starts_with('/') {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };
        if !is_absolute_path(path) || !is_query(query) {
            return Err(ParseError::BadTarget);
        }
        return Ok(Target::Origin {
            path: path.to_string(),
            query: query.to_string(),
        });
    }
    if target.contains("://") {
        Ok(Target::Absolute)
    } else {
        Ok(Target::Authority)
    }
}

// pchar without pct-encoded, per RFC 3986.
fn is_pchar(c: u8) -> bool {
    c.is_ascii_alphanumeric() || b"-._~!$&'()*+,;=:@".contains(&c)
}

fn is_escaped_run(bytes: &[u8], extra: fn(u8) -> bool) -> bool {
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if bytes.get(i + 1).map_or(true, |c| !c.is_ascii_hexdigit())
                    || bytes.get(i + 2).map_or(true, |c| !c.is_ascii_hexdigit())
                {
                    return false;
                }
                i += 3;
            }
            c if is_pchar(c) || extra(c) => i += 1,
            _ => return false,
        }
    }
    true
}

fn is_absolute_path(path: &str) -> bool {
    is_escaped_run(path.as_bytes(), |c| c == b'/')
}

fn is_query(query: &str) -> bool {
    is_escaped_run(query.as_bytes(), |c| c == b'/' || c == b'?')
}

fn parse_header(line: &[u8]) -> Result<(String, String), ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadHeader)?;
    let (name, value) = line.split_once(':').ok_or(ParseError::BadHeader)?;
    if name.is_empty() || name.contains(' ') {
        return Err(ParseError::BadHeader);
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut Parser, data: &[u8]) {
        parser.feed(data);
    }

    #[test]
    fn test_simple_get() {
        let mut parser = Parser::new();
        feed_all(&mut parser, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n");
        let request = parser.pop_front().unwrap().unwrap();
        assert_eq!(request.line.method, Method::Get);
        assert_eq!(
            request.line.target,
            Target::Origin {
                path: "/hello".into(),
                query: "".into()
            }
        );
        assert_eq!(request.headers.get("Host").unwrap(), "x");
        assert!(request.body.is_empty());
    }

    #[test]
    fn test_split_across_chunks() {
        let mut parser = Parser::new();
        parser.feed(b"POST /submit HT");
        assert!(parser.is_empty());
        parser.feed(b"TP/1.1\r\nContent-Le");
        assert!(parser.is_empty());
        parser.feed(b"ngth: 2\r\n\r\n{}");
        let request = parser.pop_front().unwrap().unwrap();
        assert_eq!(request.line.method, Method::Post);
        assert_eq!(request.body, b"{}");
    }

    #[test]
    fn test_bad_content_length_is_failure() {
        let mut parser = Parser::new();
        parser.feed(b"POST /x HTTP/1.1\r\nContent-Length: abc\r\n\r\n");
        assert!(matches!(
            parser.pop_front().unwrap(),
            Err(ParseError::BadContentLength)
        ));
    }

    #[test]
    fn test_asterisk_target() {
        let mut parser = Parser::new();
        parser.feed(b"OPTIONS * HTTP/1.1\r\nHost: x\r\n\r\n");
        let request = parser.pop_front().unwrap().unwrap();
        assert_eq!(request.line.method, Method::Options);
        assert_eq!(request.line.target, Target::Asterisk);
    }

    #[test]
    fn test_pipelined_requests() {
        let mut parser = Parser::new();
        parser.feed(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = parser.pop_front().unwrap().unwrap();
        let second = parser.pop_front().unwrap().unwrap();
        let path_of = |r: &Request| match &r.line.target {
            Target::Origin { path, .. } => path.clone(),
            _ => panic!("expected origin form"),
        };
        assert_eq!(path_of(&first), "/a");
        assert_eq!(path_of(&second), "/b");
    }

    #[test]
    fn test_garbage_request_line() {
        let mut parser = Parser::new();
        parser.feed(b"NONSENSE\r\n\r\n");
        assert!(parser.pop_front().unwrap().is_err());
    }
}
