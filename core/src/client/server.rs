//! The client's HTTP file server: exports share files (with ranged,
//! throttled, slot-limited downloads), the saved file lists, and the
//! `/ping` endpoint indexnodes probe for liveness and share manifests.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::parse::{resolve_range, ResolvedRange};
use crate::http::{Request, Response};
use crate::protocol::constants::{FILELIST_EXTENSION, FS2_PROTOCOL_VERSION};
use crate::resilience::bandwidth::TokenBucket;
use crate::resilience::slots::{SlotResult, UploadSlots};
use crate::wire::xml::{filelist_to_xml, manifest_to_xml};

use super::peerstats::PeerStats;
use super::share::ShareEngine;

/// Decides whether a request may read the manifest and file lists.
/// Wired to the communicator's known-indexnode check.
pub(crate) type IndexnodeGate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

pub(crate) struct FileServer {
    pub alias: String,
    pub port: u16,
    pub engine: Arc<ShareEngine>,
    pub slots: Arc<UploadSlots>,
    pub net_bucket: Arc<TokenBucket>,
    pub peerstats: Arc<PeerStats>,
    pub gate: IndexnodeGate,
}

impl FileServer {
    /// Accept loop. Runs until the returned task is aborted at
    /// shutdown.
    pub fn spawn(self: Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (socket, remote) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => continue,
                };
                let server = self.clone();
                tokio::spawn(async move {
                    server.handle_connection(socket, remote).await;
                });
            }
        })
    }

    async fn handle_connection(&self, mut socket: TcpStream, remote: SocketAddr) {
        let Some(request) = Request::read(&mut socket, remote).await else {
            return;
        };
        let path = request.head.path.clone();

        // Share downloads stream straight to the socket.
        if let Some(rest) = path.strip_prefix("/shares/") {
            self.send_share_file(&mut socket, &request, rest).await;
            return;
        }

        let response = match path.as_str() {
            "/ping" => self.ping(&request),
            p if p.starts_with("/filelists/") => self.filelist(&request, &p["/filelists/".len()..]),
            _ => Response::not_found(),
        };
        let response = self.with_fs2_headers(response);
        if let Err(e) = response.send(&mut socket).await {
            debug!(%remote, error = %e, "failed to send response");
        }
    }

    fn with_fs2_headers(&self, response: Response) -> Response {
        response
            .with_header("fs2-version", FS2_PROTOCOL_VERSION)
            .with_header("fs2-alias", &self.alias)
            .with_header("fs2-port", &self.port.to_string())
    }

    /// Liveness probe and share manifest, for indexnodes only.
    fn ping(&self, request: &Request) -> Response {
        if request.header("fs2-version").is_none() || !(self.gate)(request) {
            return Response::text(403, "Forbidden.");
        }
        Response::xml(200, manifest_to_xml(&self.engine.manifest()))
    }

    /// Serve a saved file list, in either flavor.
    fn filelist(&self, request: &Request, name: &str) -> Response {
        if request.header("fs2-version").is_none() || !(self.gate)(request) {
            return Response::text(403, "Forbidden.");
        }
        // List names are flat files; no traversal allowed.
        if name.contains('/') || name.contains("..") {
            return Response::not_found();
        }
        if let Some(share_name) = name.strip_suffix(FILELIST_EXTENSION) {
            let Some(share) = self.engine.share_named(share_name) else {
                return Response::not_found();
            };
            return Response::new(200)
                .with_header("Content-Type", "application/octet-stream")
                .with_body(share.list_snapshot().encode());
        }
        if let Some(share_name) = name.strip_suffix(".xml") {
            let Some(share) = self.engine.share_named(share_name) else {
                return Response::not_found();
            };
            return Response::xml(200, filelist_to_xml(&share.list_snapshot()));
        }
        Response::not_found()
    }

    /// Stream one share file, honouring Range, the upload slots and the
    /// network bucket.
    async fn send_share_file(&self, socket: &mut TcpStream, request: &Request, rest: &str) {
        let response = match self.resolve_share_file(rest).await {
            Ok(path) => {
                let alias = request
                    .header("fs2-alias")
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| request.remote.ip().to_string());
                match self.slots.try_acquire(&alias) {
                    SlotResult::Granted(_guard) => {
                        self.stream_file(socket, request, &path, &alias).await;
                        return;
                    }
                    SlotResult::Queued(position) => Response::text(503, "Upload slots busy.")
                        .with_header("fs2-queued", &position.to_string()),
                }
            }
            Err(response) => response,
        };
        let response = self.with_fs2_headers(response);
        let _ = response.send(socket).await;
    }

    /// Map `/shares/{share}/{path...}` onto a real file, refusing
    /// anything that escapes the share's canonical root.
    async fn resolve_share_file(&self, rest: &str) -> Result<PathBuf, Response> {
        let (share_name, rel) = match rest.split_once('/') {
            Some(pair) => pair,
            None => (rest, ""),
        };
        let Some(share) = self.engine.share_named(share_name) else {
            return Err(Response::not_found());
        };
        let root = share.canonical_root();
        let mut path = root.clone();
        for segment in rel.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(Response::not_found());
            }
            path.push(segment);
        }
        let Ok(real) = tokio::fs::canonicalize(&path).await else {
            return Err(Response::not_found());
        };
        if !real.starts_with(&root) {
            warn!(path = %path.display(), "share path escape attempt");
            return Err(Response::not_found());
        }
        match tokio::fs::metadata(&real).await {
            Ok(meta) if meta.is_file() => Ok(real),
            _ => Err(Response::not_found()),
        }
    }

    async fn stream_file(
        &self,
        socket: &mut TcpStream,
        request: &Request,
        path: &std::path::Path,
        alias: &str,
    ) {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(_) => {
                let _ = self.with_fs2_headers(Response::not_found()).send(socket).await;
                return;
            }
        };
        let length = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(_) => {
                let _ = self.with_fs2_headers(Response::not_found()).send(socket).await;
                return;
            }
        };

        // Malformed or out-of-range requests degrade to the full body.
        let range = request.header("range").and_then(|header| {
            let resolved = resolve_range(header, length);
            if resolved.is_none() {
                info!(header, "unserviceable range, sending full response");
            }
            resolved
        });
        let (status, range) = match range {
            Some(range) => (206, range),
            None => (
                200,
                ResolvedRange {
                    start: 0,
                    count: length,
                },
            ),
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut response = Response::new(status)
            .with_header("Accept-Ranges", "bytes")
            .with_header("Content-Type", "application/octet-stream")
            .with_header(
                "Content-Disposition",
                &format!("attachment; filename=\"{}\";", file_name),
            )
            .with_header("Content-Transfer-Encoding", "binary");
        if status == 206 {
            response = response.with_header(
                "Content-Range",
                &format!("bytes {}-{}/{}", range.start, range.end(), range.count),
            );
        }
        let response = self.with_fs2_headers(response);

        info!(peer = alias, file = %path.display(), start = range.start,
              count = range.count, "upload");

        if socket.write_all(&response.head_bytes(range.count)).await.is_err() {
            return;
        }
        if file.seek(std::io::SeekFrom::Start(range.start)).await.is_err() {
            return;
        }
        let mut remaining = range.count;
        let mut buf = vec![0u8; 64 * 1024];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let got = match file.read(&mut buf[..want]).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(_) => break,
            };
            self.net_bucket.acquire(got as u64).await;
            if socket.write_all(&buf[..got]).await.is_err() {
                debug!(peer = alias, "peer broke the pipe");
                break;
            }
            self.peerstats.sent_bytes(alias, got as u64);
            remaining -= got as u64;
        }
        if remaining == 0 {
            self.peerstats.sent_file(alias);
        }
        let _ = socket.shutdown().await;
    }
}
