//! Configuration for both roles.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::protocol::constants;

/// Configuration for a client instance.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory for persisted state (file lists, download queue, peer
    /// stats). If None, a per-user data directory is used.
    pub data_dir: Option<PathBuf>,

    /// Port the share server listens on. Must lie inside the permitted
    /// client port range.
    pub port: u16,

    /// Alias presented to indexnodes. Empty picks `Unnamed@ip:port` on the
    /// indexnode side.
    pub alias: String,

    /// Directory files are downloaded into by default.
    pub download_dir: Option<PathBuf>,

    /// Network budget in bytes/sec shared by uploads and downloads.
    /// Zero means unlimited.
    pub network_bytes_per_sec: u64,

    /// Hashing budget in bytes/sec for share refreshes. Zero means
    /// unlimited.
    pub hash_bytes_per_sec: u64,

    /// Total concurrent upload slots.
    pub upload_slots: usize,

    /// Concurrent upload slots granted to any single peer.
    pub upload_slots_per_peer: usize,

    /// Seconds between automatic share refreshes.
    pub share_auto_refresh_secs: u64,

    /// How often the refresh poll timer looks for overdue shares.
    pub share_refresh_poll_ms: u64,

    /// Maximum download files in flight at once.
    pub max_active_downloads: usize,

    /// Maximum concurrent chunks per download file.
    pub chunks_per_file: usize,

    /// Chunk size for ranged downloads.
    pub download_chunk_size: u64,

    /// Statically configured indexnode URLs, e.g. `http://host:port`.
    pub indexnodes: Vec<String>,

    /// Re-registration interval with each known indexnode.
    pub hello_interval_ms: u64,

    /// Listen for indexnode adverts and auto-register with active ones.
    pub autodetect_indexnodes: bool,

    /// Participate in auto-indexnode election (implies listening).
    pub auto_indexnode: bool,

    /// Port an elected internal indexnode binds to.
    pub internal_indexnode_port: u16,

    /// How often election is reconsidered.
    pub reconsider_interval_ms: u64,

    /// UDP port adverts are sent and received on.
    pub advert_port: u16,

    /// Debounce interval for download queue saves.
    pub queue_save_min_interval_ms: u64,

    /// Debounce interval for peer stats saves.
    pub peerstats_save_min_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            port: 41_234,
            alias: String::new(),
            download_dir: None,
            network_bytes_per_sec: 0,
            hash_bytes_per_sec: 0,
            upload_slots: 4,
            upload_slots_per_peer: 2,
            share_auto_refresh_secs: 3600,
            share_refresh_poll_ms: constants::SHARE_REFRESH_POLL_INTERVAL_MS,
            max_active_downloads: 4,
            chunks_per_file: 3,
            download_chunk_size: constants::DOWNLOAD_CHUNK_SIZE,
            indexnodes: Vec::new(),
            hello_interval_ms: 60_000,
            autodetect_indexnodes: true,
            auto_indexnode: false,
            internal_indexnode_port: 42_424,
            reconsider_interval_ms: constants::INTERNAL_INDEXNODE_RECONSIDER_MS,
            advert_port: constants::ADVERTISEMENT_DATAGRAM_PORT,
            queue_save_min_interval_ms: constants::QUEUE_SAVE_MIN_INTERVAL_MS,
            peerstats_save_min_interval_ms: constants::PEERSTATS_SAVE_MIN_INTERVAL_MS,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_download_dir(mut self, dir: PathBuf) -> Self {
        self.download_dir = Some(dir);
        self
    }

    pub fn with_network_bytes_per_sec(mut self, bps: u64) -> Self {
        self.network_bytes_per_sec = bps;
        self
    }

    pub fn with_hash_bytes_per_sec(mut self, bps: u64) -> Self {
        self.hash_bytes_per_sec = bps;
        self
    }

    pub fn with_upload_slots(mut self, total: usize, per_peer: usize) -> Self {
        self.upload_slots = total;
        self.upload_slots_per_peer = per_peer;
        self
    }

    /// Add a static indexnode URL.
    pub fn with_indexnode(mut self, url: impl Into<String>) -> Self {
        self.indexnodes.push(url.into());
        self
    }

    /// Replace the static indexnode list.
    pub fn with_indexnodes(mut self, urls: Vec<String>) -> Self {
        self.indexnodes = urls;
        self
    }

    pub fn with_auto_indexnode(mut self, enabled: bool) -> Self {
        self.auto_indexnode = enabled;
        self
    }

    pub fn with_advert_port(mut self, port: u16) -> Self {
        self.advert_port = port;
        self
    }

    pub fn with_max_active_downloads(mut self, n: usize) -> Self {
        self.max_active_downloads = n;
        self
    }

    /// Shrinks every interval so tests run quickly. Advert and autodetect
    /// machinery stays off unless a test turns it on.
    pub fn for_testing() -> Self {
        Self {
            share_auto_refresh_secs: 1,
            share_refresh_poll_ms: 100,
            hello_interval_ms: 300,
            autodetect_indexnodes: false,
            auto_indexnode: false,
            reconsider_interval_ms: 200,
            queue_save_min_interval_ms: 50,
            peerstats_save_min_interval_ms: 50,
            download_chunk_size: 64 * 1024,
            ..Self::default()
        }
    }
}

/// Configuration for an indexnode instance.
#[derive(Debug, Clone)]
pub struct IndexnodeConfig {
    /// Address the HTTP listener binds to.
    pub bind_address: IpAddr,

    /// Port the HTTP listener binds to.
    pub port: u16,

    /// Name presented on generated pages and response headers.
    pub alias: String,

    /// Size of the share refresh worker pool.
    pub refresh_pool_size: usize,

    /// Interval between liveness pings per peer.
    pub ping_interval_ms: u64,

    /// Consecutive ping failures tolerated before eviction.
    pub max_failed_livenesses: u32,

    /// Cap on streamed search results.
    pub search_max_results: usize,

    /// The stats page is regenerated at most this often.
    pub stats_cache_ms: u64,

    /// Whether to broadcast adverts.
    pub advertise: bool,

    /// UDP port adverts are sent to.
    pub advert_port: u16,

    /// Interval between advert datagrams.
    pub advertise_interval_ms: u64,

    /// Identity used in adverts. Zero picks a random one at start.
    pub advert_uid: u64,

    /// Aliases reserved for loopback peers only.
    pub localonly_aliases: Vec<String>,
}

impl Default for IndexnodeConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: 42_424,
            alias: "indexnode".to_string(),
            refresh_pool_size: 4,
            ping_interval_ms: constants::INDEXNODE_PING_INTERVAL_MS,
            max_failed_livenesses: constants::MAX_FAILED_LIVENESSES,
            search_max_results: constants::INDEXNODE_SEARCH_MAX_RESULTS,
            stats_cache_ms: constants::INDEXNODE_STATS_CACHE_MS,
            advertise: true,
            advert_port: constants::ADVERTISEMENT_DATAGRAM_PORT,
            advertise_interval_ms: constants::INDEXNODE_ADVERTISE_INTERVAL_MS,
            advert_uid: 0,
            localonly_aliases: Vec::new(),
        }
    }
}

impl IndexnodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_refresh_pool_size(mut self, n: usize) -> Self {
        self.refresh_pool_size = n;
        self
    }

    pub fn without_adverts(mut self) -> Self {
        self.advertise = false;
        self
    }

    pub fn with_localonly_alias(mut self, alias: impl Into<String>) -> Self {
        self.localonly_aliases.push(alias.into());
        self
    }

    /// Fast intervals, loopback bind, no adverts.
    pub fn for_testing() -> Self {
        Self {
            bind_address: IpAddr::from([127, 0, 0, 1]),
            port: 0,
            ping_interval_ms: 200,
            stats_cache_ms: 100,
            advertise: false,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_defaults() {
        let c = ClientConfig::default();
        assert!(c.port >= constants::CLIENT_PORT_MIN);
        assert_eq!(c.network_bytes_per_sec, 0);
        assert!(c.upload_slots >= c.upload_slots_per_peer);
        assert!(c.indexnodes.is_empty());
    }

    #[test]
    fn client_builder_chain() {
        let c = ClientConfig::new()
            .with_port(50_000)
            .with_alias("bob")
            .with_indexnode("http://10.0.0.1:42424")
            .with_upload_slots(8, 3)
            .with_auto_indexnode(true);
        assert_eq!(c.port, 50_000);
        assert_eq!(c.alias, "bob");
        assert_eq!(c.indexnodes.len(), 1);
        assert_eq!(c.upload_slots, 8);
        assert_eq!(c.upload_slots_per_peer, 3);
        assert!(c.auto_indexnode);
    }

    #[test]
    fn client_with_indexnodes_replaces() {
        let c = ClientConfig::new()
            .with_indexnode("http://a")
            .with_indexnodes(vec!["http://b".to_string()]);
        assert_eq!(c.indexnodes, vec!["http://b".to_string()]);
    }

    #[test]
    fn testing_config_is_fast() {
        let c = ClientConfig::for_testing();
        assert!(c.hello_interval_ms < 1000);
        assert!(c.share_refresh_poll_ms < 1000);
        let i = IndexnodeConfig::for_testing();
        assert!(!i.advertise);
        assert_eq!(i.port, 0);
    }

    #[test]
    fn indexnode_builder_chain() {
        let i = IndexnodeConfig::new()
            .with_port(1234)
            .with_alias("central")
            .with_refresh_pool_size(2)
            .without_adverts()
            .with_localonly_alias("admin");
        assert_eq!(i.port, 1234);
        assert_eq!(i.alias, "central");
        assert_eq!(i.refresh_pool_size, 2);
        assert!(!i.advertise);
        assert_eq!(i.localonly_aliases, vec!["admin".to_string()]);
    }
}
