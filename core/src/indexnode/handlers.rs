//! Indexnode HTTP endpoints: /hello, /browse, /search, /download,
//! /alternatives, /stats, /robots.txt.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use xml::writer::{EmitterConfig, XmlEvent};

use crate::http::parse::url_encode;
use crate::http::{Request, Response};
use crate::protocol::constants::{CLIENT_PORT_MAX, CLIENT_PORT_MIN, FS2_PROTOCOL_VERSION};
use crate::protocol::types::FileHash;

use super::filesystem::EntryInfo;
use super::peers::HelloInfo;
use super::stats::build_stats_page;
use super::IndexNodeInner;

/// Accept loop. Each connection is one request on its own task; the
/// loop itself runs until its task is aborted at shutdown.
pub(crate) async fn serve(inner: Arc<IndexNodeInner>, listener: TcpListener) {
    loop {
        let (socket, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(_) => continue,
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            handle_connection(inner, socket, remote).await;
        });
    }
}

async fn handle_connection(inner: Arc<IndexNodeInner>, mut socket: TcpStream, remote: SocketAddr) {
    let Some(request) = Request::read(&mut socket, remote).await else {
        return;
    };
    let response = dispatch(&inner, &request).await;
    let response = response
        .with_header("fs2-version", FS2_PROTOCOL_VERSION)
        .with_header("fs2-alias", &inner.config.alias)
        .with_header("fs2-port", &inner.local_addr.port().to_string());
    if let Err(e) = response.send(&mut socket).await {
        debug!(%remote, error = %e, "failed to send response");
    }
}

async fn dispatch(inner: &Arc<IndexNodeInner>, request: &Request) -> Response {
    let path = request.head.path.clone();
    match path.as_str() {
        "/" => Response::redirect(307, "/browse"),
        "/hello" => hello(inner, request).await,
        "/search" => search(inner, request),
        "/stats" => stats(inner),
        "/robots.txt" => Response::text(200, "User-agent: *\nDisallow: /\n"),
        p if p == "/browse" || p.starts_with("/browse/") => browse(inner, p),
        p if p.starts_with("/download/") => download(inner, &p["/download/".len()..]),
        p if p.starts_with("/alternatives/") => alternatives(inner, &p["/alternatives/".len()..]),
        _ => Response::not_found(),
    }
}

/// Registration. Browsers and broken clients are turned away on header
/// grounds before the registry does any work.
async fn hello(inner: &Arc<IndexNodeInner>, request: &Request) -> Response {
    if request.header("fs2-version").is_none() {
        info!(remote = %request.remote.ip(), "likely web-browser registration attempt");
        return Response::text(400, "Invalid registration");
    }
    let cltoken = request.header("fs2-cltoken").and_then(|v| v.parse::<u64>().ok());
    let port = request.header("fs2-port").and_then(|v| v.parse::<u16>().ok());
    let (Some(cltoken), Some(port)) = (cltoken, port) else {
        info!(remote = %request.remote.ip(), "registration with missing headers");
        return Response::text(400, "Invalid registration");
    };
    if !(CLIENT_PORT_MIN..=CLIENT_PORT_MAX).contains(&port) {
        return Response::text(400, "Invalid registration");
    }

    let info = HelloInfo {
        ip: request.remote.ip(),
        port,
        cltoken,
        alias: request.header("fs2-alias").unwrap_or_default().to_string(),
        secure: false,
        loopback: request.remote.ip().is_loopback(),
        avatar_hash: request.header("fs2-avatarhash").map(|s| s.to_string()),
    };

    match inner.registry.hello(info).await {
        Ok(avatar_hash) => Response::text(200, "").with_header("fs2-avatarhash", &avatar_hash),
        Err(412) => Response::text(412, "Uncontactable client"),
        Err(status) => Response::text(status, "Invalid registration"),
    }
}

/// Directory listings; file paths redirect to their download URL.
fn browse(inner: &Arc<IndexNodeInner>, full_path: &str) -> Response {
    let path = full_path.strip_prefix("/browse").unwrap_or("");
    let path = path.trim_matches('/');

    let Some(entry) = inner.fs.lookup_path(path) else {
        return Response::not_found();
    };
    if !entry.is_directory() {
        let hash = entry.hash.map(|h| h.to_hex()).unwrap_or_default();
        return Response::redirect(307, &format!("/download/{}", hash));
    }
    match inner.fs.browse(path) {
        Some(children) => Response::xml(200, render_listing("browse", None, &children)),
        None => Response::not_found(),
    }
}

fn search(inner: &Arc<IndexNodeInner>, request: &Request) -> Response {
    let query = request.head.query.get("q").cloned().unwrap_or_default();
    if !query.is_empty() {
        info!(
            who = request.header("fs2-alias").unwrap_or("?"),
            query = %query,
            "search"
        );
    }
    let results = inner.fs.search_name(&query, inner.config.search_max_results);
    Response::xml(200, render_listing("search", Some(&query), &results))
}

/// Redirect to one peer that holds the bytes.
fn download(inner: &Arc<IndexNodeInner>, hex: &str) -> Response {
    let Some(hash) = FileHash::from_hex(hex) else {
        return Response::text(400, "Malformed hash");
    };
    for entry in inner.fs.search_hash(&hash) {
        let Some(share) = entry.share else { continue };
        let Some(authority) = inner.registry.share_authority(share) else {
            continue;
        };
        let Some(share_path) = entry.share_path() else {
            continue;
        };
        inner.fs.increment_sent(entry.size);
        let url = format!("http://{}/shares/{}", authority, encode_path(share_path));
        return Response::redirect(302, &url);
    }
    Response::not_found()
}

/// Every peer URL holding a hash.
fn alternatives(inner: &Arc<IndexNodeInner>, hex: &str) -> Response {
    let Some(hash) = FileHash::from_hex(hex) else {
        return Response::text(400, "Malformed hash");
    };
    let entries = inner.fs.search_hash(&hash);

    let mut buf = Vec::new();
    {
        let mut w = EmitterConfig::new().perform_indent(true).create_writer(&mut buf);
        let hex = hash.to_hex();
        let _ = w.write(XmlEvent::start_element("fs2-alternatives").attr("fs2-hash", &hex));
        for entry in &entries {
            let Some(share) = entry.share else { continue };
            let Some(authority) = inner.registry.share_authority(share) else {
                continue;
            };
            let Some(share_path) = entry.share_path() else {
                continue;
            };
            let url = format!("http://{}/shares/{}", authority, encode_path(share_path));
            let size = entry.size.to_string();
            let alias = entry.owner_alias().unwrap_or("").to_string();
            let _ = w.write(
                XmlEvent::start_element("entry")
                    .attr("name", &entry.name)
                    .attr("fs2-size", &size)
                    .attr("fs2-clientalias", &alias)
                    .attr("url", &url),
            );
            let _ = w.write(XmlEvent::end_element());
        }
        let _ = w.write(XmlEvent::end_element());
    }
    Response::xml(200, String::from_utf8(buf).unwrap_or_default())
}

fn stats(inner: &Arc<IndexNodeInner>) -> Response {
    let for_generation = inner.clone();
    let page = inner.stats.page(move || {
        build_stats_page(
            &for_generation.fs,
            &for_generation.registry,
            &for_generation.config.alias,
            for_generation.started_unix_ms,
        )
    });
    Response::xml(200, page)
}

/// URL-encode each path segment, keeping the separators.
fn encode_path(path: &str) -> String {
    path.split('/').map(url_encode).collect::<Vec<_>>().join("/")
}

/// The shared listing document for browse and search pages.
fn render_listing(kind: &str, query: Option<&str>, entries: &[EntryInfo]) -> String {
    let mut buf = Vec::new();
    {
        let mut w = EmitterConfig::new().perform_indent(true).create_writer(&mut buf);
        let count = entries.len().to_string();
        let mut root = XmlEvent::start_element("fs2-index")
            .attr("kind", kind)
            .attr("results", &count);
        if let Some(query) = query {
            root = root.attr("query", query);
        }
        let _ = w.write(root);
        for entry in entries {
            let size = entry.size.to_string();
            let encoded = encode_path(&entry.path);
            let browse_path = format!("/browse/{}", encoded);
            let hash = entry.hash.map(|h| h.to_hex());
            let href = match &hash {
                Some(hex) => format!("/download/{}", hex),
                None => browse_path.clone(),
            };
            let alias = entry.owner_alias().unwrap_or("").to_string();
            let mut element = XmlEvent::start_element("entry")
                .attr("kind", if entry.is_directory() { "directory" } else { "file" })
                .attr("name", &entry.name)
                .attr("fs2-size", &size)
                .attr("fs2-path", &browse_path)
                .attr("href", &href);
            if let Some(hex) = &hash {
                element = element.attr("fs2-hash", hex);
            }
            if !alias.is_empty() {
                element = element.attr("fs2-clientalias", &alias);
            }
            let _ = w.write(element);
            let _ = w.write(XmlEvent::end_element());
        }
        let _ = w.write(XmlEvent::end_element());
    }
    String::from_utf8(buf).unwrap_or_else(|e| {
        warn!(error = %e, "listing was not utf8");
        String::new()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::FILE_DIGEST_BYTES;

    #[test]
    fn encode_path_keeps_separators() {
        assert_eq!(encode_path("bob/my files/a&b.txt"), "bob/my%20files/a%26b.txt");
    }

    #[test]
    fn listing_renders_files_and_dirs() {
        let entries = vec![
            EntryInfo {
                name: "music".to_string(),
                size: 10,
                link_count: 2,
                hash: None,
                share: Some(1),
                path: "bob/music".to_string(),
            },
            EntryInfo {
                name: "song.ogg".to_string(),
                size: 5,
                link_count: 1,
                hash: Some(FileHash([9; FILE_DIGEST_BYTES])),
                share: Some(1),
                path: "bob/music/song.ogg".to_string(),
            },
        ];
        let page = render_listing("browse", None, &entries);
        assert!(page.contains("kind=\"directory\""));
        assert!(page.contains("kind=\"file\""));
        assert!(page.contains("/browse/bob/music"));
        assert!(page.contains(&format!("/download/{}", "09".repeat(FILE_DIGEST_BYTES))));
        assert!(page.contains("fs2-clientalias=\"bob\""));
    }
}
