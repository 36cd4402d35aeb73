//! The peer registry: registration via `/hello`, alias uniqueness,
//! liveness pings and eviction.
//!
//! Identity is (ip, port). Lock discipline: the peers map, the alias
//! set and each peer's state are separate short-lived mutexes; the
//! alias set may nest a peer's state inside it, never the reverse, and
//! no lock is held across network I/O.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::client::{self, HttpUrl};
use crate::protocol::constants::FS2_PROTOCOL_VERSION;
use crate::wire::xml::{manifest_from_xml, ManifestShare};

use super::filesystem::{EntryId, Filesystem};
use super::shares::{RefreshPool, ShareRecord};

/// Scraped, untrusted `/hello` headers. Validation happened at the
/// handler; reachability is proven here.
#[derive(Debug, Clone)]
pub(crate) struct HelloInfo {
    pub ip: IpAddr,
    pub port: u16,
    pub cltoken: u64,
    pub alias: String,
    pub secure: bool,
    pub loopback: bool,
    pub avatar_hash: Option<String>,
}

#[derive(Debug)]
pub(crate) struct PeerState {
    pub alias: String,
    pub cltoken: u64,
    pub secure: bool,
    pub avatar_hash: String,
    pub failed_liveness: u32,
    pub fs_root: Option<EntryId>,
    pub shares: HashMap<String, Arc<ShareRecord>>,
    pub evicted: bool,
}

/// A registered peer.
pub(crate) struct Peer {
    pub address: SocketAddr,
    pub loopback: bool,
    pub state: Mutex<PeerState>,
    /// At most one liveness ping may be outstanding.
    ping_in_flight: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
    /// Identity this indexnode presents on requests to the peer.
    our_alias: String,
    our_port: u16,
}

impl Peer {
    fn new(info: &HelloInfo, our_alias: &str, our_port: u16) -> Arc<Peer> {
        Arc::new(Peer {
            address: SocketAddr::new(info.ip, info.port),
            loopback: info.loopback,
            state: Mutex::new(PeerState {
                alias: String::new(),
                cltoken: info.cltoken,
                secure: info.secure,
                avatar_hash: info.avatar_hash.clone().unwrap_or_default(),
                failed_liveness: 0,
                fs_root: None,
                shares: HashMap::new(),
                evicted: false,
            }),
            ping_in_flight: AtomicBool::new(false),
            ticker: Mutex::new(None),
            our_alias: our_alias.to_string(),
            our_port,
        })
    }

    pub fn alias(&self) -> String {
        self.state.lock().unwrap().alias.clone()
    }

    pub fn fs_root(&self) -> EntryId {
        self.state
            .lock()
            .unwrap()
            .fs_root
            .expect("peer registered without fs root")
    }

    fn fs_root_opt(&self) -> Option<EntryId> {
        self.state.lock().unwrap().fs_root
    }

    pub fn avatar_hash(&self) -> String {
        self.state.lock().unwrap().avatar_hash.clone()
    }

    pub fn is_evicted(&self) -> bool {
        self.state.lock().unwrap().evicted
    }

    /// `host:port` form usable inside a URL.
    pub fn url_authority(&self) -> String {
        match self.address.ip() {
            IpAddr::V6(ip) => format!("[{}]:{}", ip, self.address.port()),
            IpAddr::V4(ip) => format!("{}:{}", ip, self.address.port()),
        }
    }

    pub fn url(&self, path: &str) -> HttpUrl {
        HttpUrl {
            host: self.address.ip().to_string(),
            port: self.address.port(),
            path: path.to_string(),
        }
    }

    /// Headers this indexnode sends the peer: the protocol gate, our
    /// identity, and an echo of the peer's token so its filters accept
    /// us.
    pub fn request_headers(&self) -> Vec<(String, String)> {
        let token = self.state.lock().unwrap().cltoken;
        vec![
            ("fs2-version".to_string(), FS2_PROTOCOL_VERSION.to_string()),
            ("fs2-alias".to_string(), self.our_alias.clone()),
            ("fs2-port".to_string(), self.our_port.to_string()),
            ("fs2-cltoken".to_string(), token.to_string()),
        ]
    }
}

/// What a `/ping` of a peer yielded.
struct PingOutcome {
    alias: Option<String>,
    /// None when the body did not parse; the peer is still alive.
    manifest: Option<Vec<ManifestShare>>,
}

pub(crate) struct PeerRegistry {
    fs: Arc<Filesystem>,
    pool: RefreshPool,
    peers: Mutex<HashMap<SocketAddr, Arc<Peer>>>,
    aliases: Mutex<HashSet<String>>,
    all_shares: Mutex<HashMap<u64, Arc<ShareRecord>>>,
    next_share_uid: AtomicU64,
    running: Arc<tokio::sync::RwLock<bool>>,
    our_alias: String,
    our_port: u16,
    ping_interval: Duration,
    max_failed: u32,
    localonly: HashSet<String>,
}

impl PeerRegistry {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<Filesystem>,
        pool: RefreshPool,
        running: Arc<tokio::sync::RwLock<bool>>,
        our_alias: String,
        our_port: u16,
        ping_interval: Duration,
        max_failed: u32,
        localonly: Vec<String>,
    ) -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry {
            fs,
            pool,
            peers: Mutex::new(HashMap::new()),
            aliases: Mutex::new(HashSet::new()),
            all_shares: Mutex::new(HashMap::new()),
            next_share_uid: AtomicU64::new(1),
            running,
            our_alias,
            our_port,
            ping_interval,
            max_failed,
            localonly: localonly.into_iter().collect(),
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// (alias, total share size, avatar hash) per peer, for the stats
    /// page.
    pub fn client_summaries(&self) -> Vec<(String, u64, String)> {
        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().values().cloned().collect();
        peers
            .iter()
            .map(|peer| {
                let size = peer
                    .fs_root_opt()
                    .and_then(|root| self.fs.entry_info(root))
                    .map(|info| info.size)
                    .unwrap_or(0);
                (peer.alias(), size, peer.avatar_hash())
            })
            .collect()
    }

    /// The `host:port` serving a share, for download redirects. None if
    /// the owning peer is gone.
    pub fn share_authority(&self, share_uid: u64) -> Option<String> {
        let record = self.all_shares.lock().unwrap().get(&share_uid).cloned()?;
        let owner = record.owner.upgrade()?;
        if owner.is_evicted() {
            return None;
        }
        Some(owner.url_authority())
    }

    /// Handle a `/hello`: register a new peer (proving reachability
    /// first) or refresh an existing one. Returns the avatar hash we
    /// hold for the peer, or an HTTP status for refusal.
    pub async fn hello(self: &Arc<Self>, info: HelloInfo) -> Result<String, u16> {
        let address = SocketAddr::new(info.ip, info.port);

        let existing = self.peers.lock().unwrap().get(&address).cloned();
        if let Some(peer) = existing {
            self.peer_said_hello(&peer, &info);
            return Ok(peer.avatar_hash());
        }

        // New peer: contact it back before believing anything.
        let probe = Peer::new(&info, &self.our_alias, self.our_port);
        let outcome = match Self::fetch_ping(&probe).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(peer = %address, error = %e, "registration ping failed");
                return Err(412);
            }
        };

        self.assign_alias(&probe, &info.alias);
        let fs_root = self.fs.register_client(&probe.alias());
        probe.state.lock().unwrap().fs_root = Some(fs_root);

        {
            let mut peers = self.peers.lock().unwrap();
            if let Some(raced) = peers.get(&address).cloned() {
                // Someone else registered this address while we pinged.
                drop(peers);
                self.fs.deregister_client(fs_root);
                self.aliases.lock().unwrap().remove(&probe.alias());
                self.peer_said_hello(&raced, &info);
                return Ok(raced.avatar_hash());
            }
            peers.insert(address, probe.clone());
        }

        self.start_ticker(&probe);
        info!(peer = %probe.alias(), %address, "peer registered");

        // A ping reply can rename us before the map insert.
        if let Some(alias) = outcome.alias {
            self.assign_alias(&probe, &alias);
        }
        self.reconcile_shares(&probe, outcome.manifest);
        Ok(probe.avatar_hash())
    }

    /// An already-registered peer said hello again: refresh its token,
    /// secure flag and alias, then reconsider its share list.
    fn peer_said_hello(self: &Arc<Self>, peer: &Arc<Peer>, info: &HelloInfo) {
        {
            let mut state = peer.state.lock().unwrap();
            state.cltoken = info.cltoken;
            state.secure = info.secure;
            state.failed_liveness = 0;
            if let Some(avatar) = &info.avatar_hash {
                state.avatar_hash = avatar.clone();
            }
        }
        self.assign_alias(peer, &info.alias);

        let registry = self.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            match Self::fetch_ping(&peer).await {
                Ok(outcome) => {
                    if let Some(alias) = outcome.alias {
                        registry.assign_alias(&peer, &alias);
                    }
                    registry.reconcile_shares(&peer, outcome.manifest);
                }
                Err(e) => {
                    warn!(peer = %peer.alias(), error = %e, "share list fetch after hello failed");
                }
            }
        });
    }

    /// Apply the alias rules: empty becomes `Unnamed@ip:port`, slashes
    /// are stripped, and a collision or a reserved local-only alias on a
    /// non-loopback peer gets the address suffixed. Renames the peer's
    /// filesystem root to match.
    pub(crate) fn assign_alias(&self, peer: &Arc<Peer>, proposed: &str) {
        let base = if proposed.is_empty() {
            format!("Unnamed@{}", peer.url_authority())
        } else {
            proposed.replace('/', " ")
        };

        let chosen = {
            let mut aliases = self.aliases.lock().unwrap();
            let current = peer.state.lock().unwrap().alias.clone();
            if base == current {
                return;
            }
            let collides = aliases.contains(&base)
                || (self.localonly.contains(&base) && !peer.loopback);
            let chosen = if collides {
                format!("{}@{}", base, peer.url_authority())
            } else {
                base
            };
            if chosen == current {
                return;
            }
            aliases.remove(&current);
            aliases.insert(chosen.clone());
            peer.state.lock().unwrap().alias = chosen.clone();
            chosen
        };

        if let Some(root) = peer.fs_root_opt() {
            self.fs.rename(root, &chosen);
        }
    }

    /// Diff a fresh manifest against the peer's current shares: delist
    /// what vanished, create what appeared, and queue refreshes where
    /// the peer's revision ran ahead.
    fn reconcile_shares(self: &Arc<Self>, peer: &Arc<Peer>, manifest: Option<Vec<ManifestShare>>) {
        let Some(manifest) = manifest else { return };

        let mut to_delist: Vec<Arc<ShareRecord>> = Vec::new();
        let mut to_queue: Vec<Arc<ShareRecord>> = Vec::new();
        {
            let mut state = peer.state.lock().unwrap();
            if state.evicted {
                return;
            }
            let mut dead: HashMap<String, Arc<ShareRecord>> = state.shares.clone();
            for entry in manifest {
                dead.remove(&entry.name);
                match state.shares.get(&entry.name) {
                    Some(share) => {
                        if share.set_pending(entry.revision) {
                            to_queue.push(share.clone());
                        }
                    }
                    None => {
                        let uid = self.next_share_uid.fetch_add(1, Ordering::Relaxed);
                        let record =
                            ShareRecord::new(uid, entry.name.clone(), entry.share_type, peer);
                        state.shares.insert(entry.name.clone(), record.clone());
                        self.all_shares.lock().unwrap().insert(uid, record.clone());
                        if record.set_pending(entry.revision) {
                            to_queue.push(record);
                        }
                    }
                }
            }
            for (name, share) in dead {
                state.shares.remove(&name);
                to_delist.push(share);
            }
        }

        for share in to_delist {
            self.all_shares.lock().unwrap().remove(&share.uid);
            share.delist(&self.fs);
        }
        for share in to_queue {
            self.pool.submit(share);
        }
    }

    /// One liveness check. Success resets the failure counter; failure
    /// beyond the tolerance evicts the peer.
    async fn check_liveness(self: &Arc<Self>, peer: &Arc<Peer>) {
        match Self::fetch_ping(peer).await {
            Ok(outcome) => {
                if let Some(alias) = outcome.alias {
                    self.assign_alias(peer, &alias);
                }
                peer.state.lock().unwrap().failed_liveness = 0;
            }
            Err(_) => {
                let failed = {
                    let mut state = peer.state.lock().unwrap();
                    state.failed_liveness += 1;
                    state.failed_liveness
                };
                info!(
                    peer = %peer.alias(),
                    "missed a ping ({}/{})",
                    failed,
                    self.max_failed + 1
                );
                if failed > self.max_failed {
                    self.destroy_peer(peer);
                }
            }
        }
    }

    /// Evict: stop the ticker, drop from the map, delist every share,
    /// free the alias, erase the filesystem subtree.
    pub(crate) fn destroy_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        let shares: Vec<Arc<ShareRecord>> = {
            let mut state = peer.state.lock().unwrap();
            if state.evicted {
                return;
            }
            state.evicted = true;
            state.shares.values().cloned().collect()
        };

        if let Some(ticker) = peer.ticker.lock().unwrap().take() {
            ticker.abort();
        }
        self.peers.lock().unwrap().remove(&peer.address);

        for share in shares {
            self.all_shares.lock().unwrap().remove(&share.uid);
            share.delist(&self.fs);
        }

        let alias = peer.alias();
        self.aliases.lock().unwrap().remove(&alias);
        if let Some(root) = peer.fs_root_opt() {
            self.fs.deregister_client(root);
        }
        info!(peer = %alias, "peer disconnected");
    }

    fn start_ticker(self: &Arc<Self>, peer: &Arc<Peer>) {
        let registry = self.clone();
        let peer_for_task = peer.clone();
        let interval = self.ping_interval;
        let running = self.running.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // immediate first tick is uninteresting
            loop {
                ticker.tick().await;
                if !*running.read().await || peer_for_task.is_evicted() {
                    break;
                }
                if peer_for_task.ping_in_flight.swap(true, Ordering::SeqCst) {
                    warn!(
                        peer = %peer_for_task.alias(),
                        "responding slower than the ping interval, skipping a tick"
                    );
                    continue;
                }
                let registry = registry.clone();
                let peer = peer_for_task.clone();
                tokio::spawn(async move {
                    registry.check_liveness(&peer).await;
                    peer.ping_in_flight.store(false, Ordering::SeqCst);
                });
            }
            debug!("liveness ticker stopped");
        });
        *peer.ticker.lock().unwrap() = Some(handle);
    }

    async fn fetch_ping(peer: &Arc<Peer>) -> Result<PingOutcome, crate::protocol::error::Fs2Error> {
        let response = client::get(
            &peer.url("/ping"),
            &peer.request_headers(),
            Duration::from_secs(15),
        )
        .await?;
        if !response.is_success() {
            return Err(crate::protocol::error::Fs2Error::Network(format!(
                "ping answered {}",
                response.status
            )));
        }
        let alias = response.header("fs2-alias").map(|s| s.to_string());
        let manifest = std::str::from_utf8(&response.body)
            .ok()
            .and_then(|text| manifest_from_xml(text).ok());
        Ok(PingOutcome { alias, manifest })
    }

    /// Stop every peer's ticker. Called at indexnode shutdown.
    pub fn shutdown(&self) {
        let peers: Vec<Arc<Peer>> = self.peers.lock().unwrap().values().cloned().collect();
        for peer in peers {
            if let Some(ticker) = peer.ticker.lock().unwrap().take() {
                ticker.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::ShareType;

    fn test_info(ip: [u8; 4], port: u16, alias: &str) -> HelloInfo {
        HelloInfo {
            ip: IpAddr::from(ip),
            port,
            cltoken: 17,
            alias: alias.to_string(),
            secure: false,
            loopback: false,
            avatar_hash: None,
        }
    }

    fn test_registry(fs: Arc<Filesystem>, localonly: Vec<String>) -> Arc<PeerRegistry> {
        let running = Arc::new(tokio::sync::RwLock::new(true));
        let (pool, _workers) = RefreshPool::spawn(1, fs.clone(), running.clone());
        PeerRegistry::new(
            fs,
            pool,
            running,
            "test-index".to_string(),
            42424,
            Duration::from_secs(60),
            2,
            localonly,
        )
    }

    /// Register a peer without the network reachability probe.
    fn register_direct(
        registry: &Arc<PeerRegistry>,
        fs: &Arc<Filesystem>,
        info: &HelloInfo,
    ) -> Arc<Peer> {
        let peer = Peer::new(info, "test-index", 42424);
        registry.assign_alias(&peer, &info.alias);
        let root = fs.register_client(&peer.alias());
        peer.state.lock().unwrap().fs_root = Some(root);
        registry
            .peers
            .lock()
            .unwrap()
            .insert(peer.address, peer.clone());
        peer
    }

    #[tokio::test]
    async fn alias_collision_gets_address_suffix() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec![]);
        let bob1 = register_direct(&registry, &fs, &test_info([10, 0, 0, 1], 41000, "bob"));
        let bob2 = register_direct(&registry, &fs, &test_info([10, 0, 0, 2], 41000, "bob"));
        assert_eq!(bob1.alias(), "bob");
        assert_eq!(bob2.alias(), "bob@10.0.0.2:41000");
        assert!(fs.lookup_path("bob").is_some());
        assert!(fs.lookup_path("bob@10.0.0.2:41000").is_some());
    }

    #[tokio::test]
    async fn empty_alias_becomes_unnamed() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec![]);
        let peer = register_direct(&registry, &fs, &test_info([10, 0, 0, 3], 41000, ""));
        assert_eq!(peer.alias(), "Unnamed@10.0.0.3:41000");
    }

    #[tokio::test]
    async fn slashes_are_stripped_from_aliases() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec![]);
        let peer = register_direct(&registry, &fs, &test_info([10, 0, 0, 4], 41000, "a/b"));
        assert_eq!(peer.alias(), "a b");
    }

    #[tokio::test]
    async fn reserved_alias_requires_loopback() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec!["admin".to_string()]);
        let outsider = register_direct(&registry, &fs, &test_info([10, 0, 0, 5], 41000, "admin"));
        assert_eq!(outsider.alias(), "admin@10.0.0.5:41000");

        let mut local = test_info([127, 0, 0, 1], 41001, "admin");
        local.loopback = true;
        let insider = {
            let peer = Peer::new(&local, "test-index", 42424);
            registry.assign_alias(&peer, &local.alias);
            peer
        };
        assert_eq!(insider.alias(), "admin");
    }

    #[tokio::test]
    async fn rename_is_noop_for_same_alias() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec![]);
        let peer = register_direct(&registry, &fs, &test_info([10, 0, 0, 6], 41000, "carol"));
        registry.assign_alias(&peer, "carol");
        assert_eq!(peer.alias(), "carol");
        // Rename to a fresh alias frees the old one.
        registry.assign_alias(&peer, "carla");
        assert_eq!(peer.alias(), "carla");
        assert!(fs.lookup_path("carla").is_some());
        assert!(fs.lookup_path("carol").is_none());
        assert!(!registry.aliases.lock().unwrap().contains("carol"));
    }

    fn manifest(entries: &[(&str, u32)]) -> Option<Vec<ManifestShare>> {
        Some(
            entries
                .iter()
                .map(|(name, revision)| ManifestShare {
                    name: name.to_string(),
                    revision: *revision,
                    share_type: ShareType::FileList,
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn reconcile_creates_updates_and_delists() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec![]);
        let peer = register_direct(&registry, &fs, &test_info([10, 0, 0, 7], 41000, "dave"));

        registry.reconcile_shares(&peer, manifest(&[("music", 1), ("docs", 2)]));
        {
            let state = peer.state.lock().unwrap();
            assert_eq!(state.shares.len(), 2);
            assert_eq!(state.shares["music"].pending_revision(), 1);
            assert_eq!(state.shares["docs"].pending_revision(), 2);
        }
        assert_eq!(registry.all_shares.lock().unwrap().len(), 2);

        // docs disappears, music bumps.
        registry.reconcile_shares(&peer, manifest(&[("music", 5)]));
        {
            let state = peer.state.lock().unwrap();
            assert_eq!(state.shares.len(), 1);
            assert_eq!(state.shares["music"].pending_revision(), 5);
        }
        assert_eq!(registry.all_shares.lock().unwrap().len(), 1);

        // Unparsed manifests change nothing.
        registry.reconcile_shares(&peer, None);
        assert_eq!(peer.state.lock().unwrap().shares.len(), 1);
    }

    #[tokio::test]
    async fn destroy_peer_unwinds_registry_state() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec![]);
        let peer = register_direct(&registry, &fs, &test_info([10, 0, 0, 8], 41000, "eve"));
        registry.reconcile_shares(&peer, manifest(&[("stuff", 1)]));

        registry.destroy_peer(&peer);
        assert!(peer.is_evicted());
        assert_eq!(registry.peer_count(), 0);
        assert!(registry.all_shares.lock().unwrap().is_empty());
        assert!(!registry.aliases.lock().unwrap().contains("eve"));
        assert!(fs.lookup_path("eve").is_none());
        // Idempotent.
        registry.destroy_peer(&peer);
    }

    #[tokio::test]
    async fn failed_liveness_evicts_after_tolerance() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec![]);
        // Address nothing listens on: every ping fails.
        let peer = register_direct(&registry, &fs, &test_info([127, 0, 0, 1], 1, "ghost"));
        for _ in 0..registry.max_failed {
            registry.check_liveness(&peer).await;
            assert!(!peer.is_evicted());
        }
        registry.check_liveness(&peer).await;
        assert!(peer.is_evicted());
        assert_eq!(registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn client_summaries_report_sizes() {
        let fs = Arc::new(Filesystem::new());
        let registry = test_registry(fs.clone(), vec![]);
        let peer = register_direct(&registry, &fs, &test_info([10, 0, 0, 9], 41000, "fred"));
        let mut tree = crate::wire::filelist::Item::new_directory("s");
        tree.insert_child(crate::wire::filelist::Item::new_file(
            "f",
            123,
            0,
            crate::protocol::constants::FILE_DIGEST_VERSION,
            crate::protocol::types::FileHash([1; 32]),
        ));
        tree.recompute_aggregates();
        fs.import_share(&tree, 1, peer.fs_root());

        let summaries = registry.client_summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].0, "fred");
        assert_eq!(summaries[0].1, 123);
    }
}
