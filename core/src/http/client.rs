//! Minimal async HTTP GET client.
//!
//! Every outbound FS2 request is a GET with `Connection: close`, so the
//! client here connects, writes one request, reads one response, done.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::protocol::error::Fs2Error;

use super::parse::{find_header_end, parse_content_length};

/// Default wall-clock budget for one exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed `http://host:port/path` URL. Only the plain-HTTP scheme is
/// spoken in this implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    pub host: String,
    pub port: u16,
    /// Always begins with `/`.
    pub path: String,
}

impl HttpUrl {
    pub fn parse(url: &str) -> Option<HttpUrl> {
        let rest = url.strip_prefix("http://")?;
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        // Bracketed IPv6 hosts carry colons of their own.
        let (host, port) = if let Some(v6) = authority.strip_prefix('[') {
            let (host, after) = v6.split_once(']')?;
            let port = match after.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None => 80,
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host.to_string(), port.parse().ok()?),
                None => (authority.to_string(), 80),
            }
        };
        if host.is_empty() {
            return None;
        }
        Some(HttpUrl {
            host,
            port,
            path: path.to_string(),
        })
    }

    /// Same authority, different path.
    pub fn with_path(&self, path: impl Into<String>) -> HttpUrl {
        HttpUrl {
            host: self.host.clone(),
            port: self.port,
            path: path.into(),
        }
    }

    fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "http://{}{}", self.authority(), self.path)
    }
}

/// A buffered response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names lowercased.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Perform one GET. Extra headers are sent verbatim.
pub async fn get(
    url: &HttpUrl,
    extra_headers: &[(String, String)],
    timeout: Duration,
) -> Result<HttpResponse, Fs2Error> {
    tokio::time::timeout(timeout, get_inner(url, extra_headers))
        .await
        .map_err(|_| Fs2Error::Network(format!("timed out fetching {}", url)))?
}

/// GET with a `Range: bytes=start-end` header.
pub async fn get_range(
    url: &HttpUrl,
    start: u64,
    end_inclusive: u64,
    extra_headers: &[(String, String)],
    timeout: Duration,
) -> Result<HttpResponse, Fs2Error> {
    let mut headers = extra_headers.to_vec();
    headers.push(("Range".to_string(), format!("bytes={}-{}", start, end_inclusive)));
    get(url, &headers, timeout).await
}

async fn get_inner(
    url: &HttpUrl,
    extra_headers: &[(String, String)],
) -> Result<HttpResponse, Fs2Error> {
    let mut socket = TcpStream::connect((url.host.as_str(), url.port))
        .await
        .map_err(|e| Fs2Error::Network(format!("connect {}: {}", url, e)))?;

    let mut request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\n",
        url.path,
        url.authority()
    );
    for (name, value) in extra_headers {
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    request.push_str("Connection: close\r\n\r\n");

    socket
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Fs2Error::Network(format!("send {}: {}", url, e)))?;

    read_response(&mut socket)
        .await
        .map_err(|e| Fs2Error::Network(format!("read {}: {}", url, e)))
}

async fn read_response(socket: &mut TcpStream) -> std::io::Result<HttpResponse> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    // Read until the header block is complete.
    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before headers",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "empty response"))?;
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad status line"))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }

    let mut body = buf[header_end..].to_vec();
    let content_length = parse_content_length(&head);
    if content_length > 0 {
        while body.len() < content_length {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body",
                ));
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body.truncate(content_length);
    } else {
        // No length: the peer signals the end by closing.
        loop {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    Ok(HttpResponse {
        status,
        headers,
        body,
    })
}
