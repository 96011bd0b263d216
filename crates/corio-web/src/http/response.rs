//! Response model and serialisation.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok = 200,
    BadRequest = 400,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    InternalServerError = 500,
    NotImplemented = 501,
}

impl StatusCode {
    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
        }
    }

    pub fn code(self) -> u16 {
        self as u16
    }
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Body response with `Content-Type` and `Content-Length` filled in.
    pub fn with_body(
        status: StatusCode,
        content_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let body = body.into();
        let mut response = Self::new(status);
        response.set_header("Content-Type", content_type);
        response.set_header("Content-Length", body.len().to_string());
        response.body = body;
        response
    }

    /// Header-only variant used for HEAD routes: advertises the size without
    /// carrying the body.
    pub fn head_only(content_type: impl Into<String>, size: usize) -> Self {
        let mut response = Self::new(StatusCode::Ok);
        response.set_header("Content-Type", content_type);
        response.set_header("Content-Length", size.to_string());
        response
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Serialise status line, headers, blank line and body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status.code(), self.status.reason()).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_body_sets_framing_headers() {
        let response = Response::with_body(StatusCode::Ok, "text/plain", "Hello, World!");
        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: text/plain\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("\r\nHello, World!"));
    }

    #[test]
    fn test_head_only_has_no_body() {
        let response = Response::head_only("text/html", 1024);
        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.contains("Content-Length: 1024\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
