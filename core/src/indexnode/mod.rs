//! The indexnode role: aggregates registered peers' file lists into one
//! searchable virtual filesystem and redirects downloads to the peers
//! that hold the bytes.

pub mod advertiser;
pub mod filesystem;

pub(crate) mod handlers;
pub(crate) mod peers;
pub(crate) mod shares;
pub(crate) mod stats;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::protocol::config::IndexnodeConfig;
use crate::protocol::error::Fs2Error;

pub use advertiser::{generate_capability_value, AdvertSource};
pub use filesystem::{EntryId, EntryInfo, Filesystem};

use advertiser::spawn_advertiser;
use peers::PeerRegistry;
use shares::RefreshPool;
use stats::StatsCache;

pub(crate) struct IndexNodeInner {
    pub config: IndexnodeConfig,
    pub fs: Arc<Filesystem>,
    pub registry: Arc<PeerRegistry>,
    pub stats: Arc<StatsCache>,
    pub started_unix_ms: u64,
    pub local_addr: SocketAddr,
    pub advert_uid: u64,
    pub capability: u64,
    pub running: Arc<tokio::sync::RwLock<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A running indexnode. Shut it down explicitly; dropping the handle
/// leaves background tasks running.
pub struct IndexNode {
    inner: Arc<IndexNodeInner>,
}

impl IndexNode {
    /// Bind listeners, start the refresh pool and (optionally) the
    /// advertiser.
    pub async fn start(config: IndexnodeConfig) -> Result<IndexNode, Fs2Error> {
        let listener = TcpListener::bind((config.bind_address, config.port))
            .await
            .map_err(|e| {
                Fs2Error::StartFailed(format!(
                    "cannot bind {}:{}: {}",
                    config.bind_address, config.port, e
                ))
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Fs2Error::StartFailed(e.to_string()))?;

        let running = Arc::new(tokio::sync::RwLock::new(true));
        let fs = Arc::new(Filesystem::new());
        let (pool, worker_handles) =
            RefreshPool::spawn(config.refresh_pool_size, fs.clone(), running.clone());
        let registry = PeerRegistry::new(
            fs.clone(),
            pool,
            running.clone(),
            config.alias.clone(),
            local_addr.port(),
            Duration::from_millis(config.ping_interval_ms),
            config.max_failed_livenesses,
            config.localonly_aliases.clone(),
        );

        let advert_uid = if config.advert_uid == 0 {
            rand::thread_rng().gen_range(1..u64::MAX)
        } else {
            config.advert_uid
        };
        let started_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let inner = Arc::new(IndexNodeInner {
            stats: StatsCache::new(Duration::from_millis(config.stats_cache_ms)),
            capability: generate_capability_value(),
            config,
            fs,
            registry,
            started_unix_ms,
            local_addr,
            advert_uid,
            running: running.clone(),
            tasks: Mutex::new(worker_handles),
        });

        let serve = tokio::spawn(handlers::serve(inner.clone(), listener));
        inner.tasks.lock().unwrap().push(serve);

        if inner.config.advertise {
            let source = Arc::new(StandaloneAdvertSource {
                inner: inner.clone(),
            });
            let advertiser = spawn_advertiser(
                source,
                inner.config.advert_port,
                Duration::from_millis(inner.config.advertise_interval_ms),
                running,
            );
            inner.tasks.lock().unwrap().push(advertiser);
        }

        info!(addr = %local_addr, "indexnode listening");
        Ok(IndexNode { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    pub fn advert_uid(&self) -> u64 {
        self.inner.advert_uid
    }

    pub fn capability(&self) -> u64 {
        self.inner.capability
    }

    pub fn filesystem(&self) -> Arc<Filesystem> {
        self.inner.fs.clone()
    }

    /// Stop listeners, tickers and workers. Pending refreshes may finish
    /// in flight but no new work starts.
    pub async fn shutdown(&self) {
        *self.inner.running.write().await = false;
        self.inner.registry.shutdown();
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!("indexnode stopped");
    }
}

/// A standalone indexnode is always active and always prospective, so
/// its presence inhibits weaker auto-indexnodes.
struct StandaloneAdvertSource {
    inner: Arc<IndexNodeInner>,
}

impl AdvertSource for StandaloneAdvertSource {
    fn is_active(&self) -> bool {
        true
    }
    fn is_prospective(&self) -> bool {
        true
    }
    fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }
    fn capability(&self) -> u64 {
        self.inner.capability
    }
    fn advert_uid(&self) -> u64 {
        self.inner.advert_uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::http::client::{self, HttpUrl};
    use crate::protocol::constants::{FILE_DIGEST_VERSION, FS2_PROTOCOL_VERSION};
    use crate::protocol::types::{FileHash, ShareType};
    use crate::wire::filelist::{FileList, Item};
    use crate::wire::xml::{manifest_to_xml, ManifestShare};

    fn hash(seed: u8) -> FileHash {
        FileHash([seed; 32])
    }

    /// A canned peer: serves /ping (manifest) and /filelists/<name>
    /// (binary list) until dropped.
    struct FakePeer {
        port: u16,
        stop: Arc<tokio::sync::Notify>,
    }

    impl FakePeer {
        async fn start(share_name: &str, list: FileList) -> FakePeer {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let stop = Arc::new(tokio::sync::Notify::new());
            let stopped = stop.clone();
            let manifest = manifest_to_xml(&[ManifestShare {
                name: share_name.to_string(),
                revision: list.revision,
                share_type: ShareType::FileList,
            }]);
            let encoded = list.encode();

            tokio::spawn(async move {
                loop {
                    let accepted = tokio::select! {
                        _ = stopped.notified() => break,
                        accepted = listener.accept() => accepted,
                    };
                    let Ok((mut socket, _)) = accepted else { break };
                    let manifest = manifest.clone();
                    let encoded = encoded.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 2048];
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        let request = String::from_utf8_lossy(&buf[..n]).to_string();
                        let body: Vec<u8> = if request.starts_with("GET /ping") {
                            manifest.into_bytes()
                        } else if request.starts_with("GET /filelists/") {
                            encoded
                        } else {
                            Vec::new()
                        };
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nfs2-alias: bob\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        let _ = socket.write_all(head.as_bytes()).await;
                        let _ = socket.write_all(&body).await;
                        let _ = socket.shutdown().await;
                    });
                }
            });
            FakePeer { port, stop }
        }

        fn stop(&self) {
            self.stop.notify_waiters();
        }
    }

    fn bob_list() -> FileList {
        let mut music = Item::new_directory("music");
        music.insert_child(Item::new_file("song.ogg", 1000, 7, FILE_DIGEST_VERSION, hash(1)));
        let mut root = Item::new_directory("share");
        root.insert_child(music);
        root.recompute_aggregates();
        FileList {
            revision: 1,
            last_refreshed: 0,
            root,
        }
    }

    fn hello_headers(port: u16) -> Vec<(String, String)> {
        vec![
            ("fs2-version".to_string(), FS2_PROTOCOL_VERSION.to_string()),
            ("fs2-port".to_string(), port.to_string()),
            ("fs2-cltoken".to_string(), "17".to_string()),
            ("fs2-alias".to_string(), "bob".to_string()),
        ]
    }

    fn url(node: &IndexNode, path: &str) -> HttpUrl {
        HttpUrl::parse(&format!("http://127.0.0.1:{}{}", node.port(), path)).unwrap()
    }

    async fn wait_for_import(node: &IndexNode) {
        for _ in 0..100 {
            if node.filesystem().count_files() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("peer share never imported");
    }

    async fn registered_node() -> (IndexNode, FakePeer) {
        let node = IndexNode::start(IndexnodeConfig::for_testing()).await.unwrap();
        let peer = FakePeer::start("share", bob_list()).await;
        let resp = client::get(
            &url(&node, "/hello"),
            &hello_headers(peer.port),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 200);
        wait_for_import(&node).await;
        (node, peer)
    }

    #[tokio::test]
    async fn register_then_browse() {
        let (node, peer) = registered_node().await;

        let listing = client::get(&url(&node, "/browse/bob"), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(listing.status, 200);
        let body = String::from_utf8(listing.body).unwrap();
        assert!(body.contains("name=\"share\""), "body: {}", body);

        peer.stop();
        node.shutdown().await;
    }

    #[tokio::test]
    async fn browse_file_redirects_to_download() {
        let (node, peer) = registered_node().await;

        let resp = client::get(
            &url(&node, "/browse/bob/share/music/song.ogg"),
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 307);
        let location = resp.header("location").unwrap();
        assert_eq!(location, &format!("/download/{}", hash(1).to_hex()));

        // Following the redirect lands on the peer's share URL.
        let download = client::get(
            &url(&node, location),
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(download.status, 302);
        let target = download.header("location").unwrap();
        assert!(
            target.ends_with("/shares/share/music/song.ogg"),
            "target: {}",
            target
        );
        assert!(target.contains(&peer.port.to_string()));

        peer.stop();
        node.shutdown().await;
    }

    #[tokio::test]
    async fn search_finds_by_keyword() {
        let (node, peer) = registered_node().await;

        let resp = client::get(&url(&node, "/search?q=song"), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        let body = String::from_utf8(resp.body).unwrap();
        assert!(body.contains("song.ogg"), "body: {}", body);

        let miss = client::get(&url(&node, "/search?q=zebra"), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(String::from_utf8(miss.body).unwrap().contains("results=\"0\""));

        peer.stop();
        node.shutdown().await;
    }

    #[tokio::test]
    async fn alternatives_lists_peer_urls() {
        let (node, peer) = registered_node().await;

        let resp = client::get(
            &url(&node, &format!("/alternatives/{}", hash(1).to_hex())),
            &[],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(resp.status, 200);
        let body = String::from_utf8(resp.body).unwrap();
        assert!(body.contains("fs2-clientalias=\"bob\""), "body: {}", body);
        assert!(body.contains("/shares/share/music/song.ogg"), "body: {}", body);

        peer.stop();
        node.shutdown().await;
    }

    #[tokio::test]
    async fn hello_refusals() {
        let node = IndexNode::start(IndexnodeConfig::for_testing()).await.unwrap();

        // No fs2-version header: browser heuristic.
        let resp = client::get(&url(&node, "/hello"), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status, 400);

        // Port outside the permitted range.
        let mut headers = hello_headers(41000);
        headers[1].1 = "80".to_string();
        let resp = client::get(&url(&node, "/hello"), &headers, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status, 400);

        // Valid headers but nothing listening on the claimed port.
        let headers = hello_headers(49_151);
        let resp = client::get(&url(&node, "/hello"), &headers, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(resp.status, 412);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn dead_peer_is_evicted_and_alias_freed() {
        let (node, peer) = registered_node().await;
        assert_eq!(node.filesystem().count_files(), 1);

        // Kill the peer; the 200ms test ping interval with tolerance 2
        // evicts within a few intervals.
        peer.stop();
        let fs = node.filesystem();
        let mut evicted = false;
        for _ in 0..100 {
            if fs.lookup_path("bob").is_none() {
                evicted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(evicted, "peer was never evicted");
        assert_eq!(fs.count_files(), 0);
        assert!(fs.search_hash(&hash(1)).is_empty());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn stats_and_robots_respond() {
        let (node, peer) = registered_node().await;

        let robots = client::get(&url(&node, "/robots.txt"), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert!(String::from_utf8(robots.body).unwrap().contains("Disallow: /"));

        // First stats call may serve the still-empty cache; poll until
        // the generated page arrives.
        let mut saw_stats = false;
        for _ in 0..50 {
            let stats = client::get(&url(&node, "/stats"), &[], Duration::from_secs(5))
                .await
                .unwrap();
            let body = String::from_utf8(stats.body).unwrap();
            if body.contains("file-count") {
                saw_stats = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(saw_stats);

        peer.stop();
        node.shutdown().await;
    }

    #[tokio::test]
    async fn responses_carry_fs2_headers() {
        let node = IndexNode::start(IndexnodeConfig::for_testing()).await.unwrap();
        let resp = client::get(&url(&node, "/robots.txt"), &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.header("fs2-version"), Some(FS2_PROTOCOL_VERSION));
        assert_eq!(resp.header("fs2-alias"), Some("indexnode"));
        node.shutdown().await;
    }

    #[tokio::test]
    async fn share_revision_bump_triggers_reimport() {
        let (node, peer) = registered_node().await;
        peer.stop();

        // Same peer address re-hellos with a richer list at revision 2.
        let mut list = bob_list();
        list.revision = 2;
        let mut root_children: BTreeMap<String, Item> = list.root.children.clone().unwrap();
        root_children.insert(
            "extra.txt".to_string(),
            Item::new_file("extra.txt", 5, 0, FILE_DIGEST_VERSION, hash(2)),
        );
        list.root.children = Some(root_children);
        list.root.recompute_aggregates();

        // A new fake peer on a fresh port registers as a new peer and
        // serves the bigger list.
        let peer2 = FakePeer::start("share", list).await;
        let mut headers = hello_headers(peer2.port);
        headers[3].1 = "carol".to_string();
        let resp = client::get(&url(&node, "/hello"), &headers, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);

        let fs = node.filesystem();
        let mut seen = false;
        for _ in 0..100 {
            if fs.lookup_path("carol/share/extra.txt").is_some() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(seen, "revision 2 content never imported");

        peer2.stop();
        node.shutdown().await;
    }
}
