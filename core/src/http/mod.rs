//! Hand-rolled HTTP/1.1 plumbing shared by both roles.
//!
//! Every FS2 exchange is a single GET with `Connection: close`; nothing
//! here supports keep-alive, pipelining or request bodies, and nothing
//! needs to.

pub mod client;
pub mod parse;

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::warn;

use parse::{find_header_end, RequestHead};

/// Largest request head we will buffer before giving up on a client.
const MAX_REQUEST_BYTES: usize = 16 * 1024;

/// A parsed inbound request.
#[derive(Debug, Clone)]
pub struct Request {
    pub head: RequestHead,
    pub remote: SocketAddr,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.header(name)
    }

    /// Read one request head off a socket. Returns None on EOF, a
    /// malformed head, or a head that never terminates within bounds.
    pub async fn read(socket: &mut TcpStream, remote: SocketAddr) -> Option<Request> {
        let mut buf = vec![0u8; MAX_REQUEST_BYTES];
        let mut total = 0;
        loop {
            let n = match socket.read(&mut buf[total..]).await {
                Ok(0) => return None,
                Ok(n) => n,
                Err(_) => return None,
            };
            total += n;
            if let Some(end) = find_header_end(&buf[..total]) {
                let raw = String::from_utf8_lossy(&buf[..end]);
                let head = RequestHead::parse(&raw)?;
                return Some(Request { head, remote });
            }
            if total >= buf.len() {
                warn!(%remote, "request head too large");
                return None;
            }
        }
    }
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        302 => "Found",
        307 => "Temporary Redirect",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        412 => "Precondition Failed",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// An outbound response under construction.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16) -> Response {
        Response {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Response {
        Response::new(status)
            .with_header("Content-Type", "text/plain")
            .with_body(body.into().into_bytes())
    }

    pub fn xml(status: u16, body: impl Into<String>) -> Response {
        Response::new(status)
            .with_header("Content-Type", "text/xml")
            .with_body(body.into().into_bytes())
    }

    pub fn redirect(status: u16, location: &str) -> Response {
        Response::new(status).with_header("Location", location)
    }

    pub fn not_found() -> Response {
        Response::text(404, "File not found.")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Response {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Response {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialise status line + headers for a body of `body_len` bytes.
    /// Used directly when a file is streamed instead of buffered.
    pub fn head_bytes(&self, body_len: u64) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, status_text(self.status));
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str(&format!("Content-Length: {}\r\n", body_len));
        out.push_str("Connection: close\r\n\r\n");
        out.into_bytes()
    }

    /// Write the whole response and shut the socket down.
    pub async fn send(self, socket: &mut TcpStream) -> std::io::Result<()> {
        let head = self.head_bytes(self.body.len() as u64);
        socket.write_all(&head).await?;
        socket.write_all(&self.body).await?;
        // Signal EOF so oneshot clients finish promptly.
        let _ = socket.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_head_format() {
        let r = Response::text(200, "hi").with_header("fs2-alias", "bob");
        let head = String::from_utf8(r.head_bytes(2)).unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("fs2-alias: bob\r\n"));
        assert!(head.contains("Content-Length: 2\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn redirect_carries_location() {
        let r = Response::redirect(307, "/download/abcd");
        assert_eq!(r.status, 307);
        assert_eq!(r.header("location"), Some("/download/abcd"));
    }

    #[test]
    fn status_text_covers_protocol_codes() {
        for code in [200, 206, 302, 307, 400, 404, 412, 500, 503] {
            assert_ne!(status_text(code), "Unknown");
        }
        assert_eq!(status_text(999), "Unknown");
    }

    #[tokio::test]
    async fn request_read_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"GET /ping?x=1 HTTP/1.1\r\nfs2-version: FS2_13\r\n\r\n")
                .await
                .unwrap();
            s
        });

        let (mut socket, remote) = listener.accept().await.unwrap();
        let req = Request::read(&mut socket, remote).await.unwrap();
        assert_eq!(req.head.method, "GET");
        assert_eq!(req.head.path, "/ping");
        assert_eq!(req.head.query["x"], "1");
        assert_eq!(req.header("fs2-version"), Some("FS2_13"));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn request_read_eof_is_none() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let s = TcpStream::connect(addr).await.unwrap();
            drop(s);
        });
        let (mut socket, remote) = listener.accept().await.unwrap();
        assert!(Request::read(&mut socket, remote).await.is_none());
        client.await.unwrap();
    }
}
