//! HTTP/1.1 request reading over a raw stream.

use std::collections::HashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("connection closed before a full request arrived")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RequestError {
    pub fn status_code(&self) -> u16 {
        match self {
            RequestError::TooLarge(_) => 413,
            _ => 400,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Path plus query string exactly as sent.
    pub target: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads one request. The body is read exactly to `Content-Length`.
pub async fn read_request<R: AsyncRead + Unpin>(stream: &mut R, max_body: usize) -> Result<HttpRequest, RequestError> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 8192];

    let head_end = loop {
        if let Some(pos) = find(&buffer, b"\r\n\r\n") {
            break pos;
        }
        if buffer.len() > MAX_HEAD_BYTES {
            return Err(RequestError::Malformed("header section too large".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RequestError::Closed);
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let head = std::str::from_utf8(&buffer[..head_end])
        .map_err(|_| RequestError::Malformed("header section is not valid UTF-8".to_string()))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, target) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v)) if v.starts_with("HTTP/1.") => (m.to_string(), t.to_string()),
        _ => return Err(RequestError::Malformed(format!("bad request line {:?}", request_line))),
    };

    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RequestError::Malformed(format!("bad header line {:?}", line)))?;
        headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
    }

    let header = |name: &str| headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());
    if header("transfer-encoding").is_some_and(|v| v.to_ascii_lowercase().contains("chunked")) {
        return Err(RequestError::Malformed("chunked transfer encoding is not supported".to_string()));
    }
    let content_length = match header("content-length") {
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(format!("bad content-length {:?}", v)))?,
        None => 0,
    };
    if content_length > max_body {
        return Err(RequestError::TooLarge(max_body));
    }

    let mut body = buffer.split_off(head_end + 4);
    body.truncate(content_length);
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RequestError::Closed);
        }
        let take = n.min(content_length - body.len());
        body.extend_from_slice(&chunk[..take]);
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), parse_query(q)),
        None => (target.clone(), HashMap::new()),
    };

    Ok(HttpRequest {
        method,
        target,
        path: percent_decode(&path),
        query,
        headers,
        body,
    })
}

pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

/// Decodes `%XX` escapes and `+`. Invalid escapes are kept verbatim.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reads_binary_body() {
        let mut raw = b"POST /run?name=demo HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\n".to_vec();
        raw.extend_from_slice(&[0, 159, 146, 150]);
        let req = read_request(&mut raw.as_slice(), 1024).await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/run");
        assert_eq!(req.target, "/run?name=demo");
        assert_eq!(req.query_param("name"), Some("demo"));
        assert_eq!(req.header("HOST"), Some("x"));
        assert_eq!(req.body, vec![0, 159, 146, 150]);
    }

    #[tokio::test]
    async fn test_rejects_oversized_body() {
        let raw = b"POST /upload HTTP/1.1\r\nContent-Length: 100\r\n\r\n".to_vec();
        let err = read_request(&mut raw.as_slice(), 10).await.unwrap_err();
        assert_eq!(err.status_code(), 413);
    }

    #[tokio::test]
    async fn test_truncated_body_is_closed() {
        let raw = b"POST /run HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc".to_vec();
        assert!(matches!(read_request(&mut raw.as_slice(), 1024).await, Err(RequestError::Closed)));
    }

    #[tokio::test]
    async fn test_malformed_request_line() {
        let raw = b"garbage\r\n\r\n".to_vec();
        assert!(matches!(read_request(&mut raw.as_slice(), 1024).await, Err(RequestError::Malformed(_))));
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%20b+c"), "a b c");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
        assert_eq!(parse_query("name=de%6Do&flag")["name"], "demo");
    }
}
