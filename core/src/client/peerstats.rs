//! Per-peer transfer statistics and download-source ranking.
//!
//! Ranking, best first: peers that currently have us queued remotely
//! are indistinguishably worst; otherwise favourites beat
//! non-favourites; otherwise fewer current active downloads from us
//! wins; remaining ties break uniformly at random.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use rand::seq::SliceRandom;
use tracing::warn;

use crate::data::saver::SafeSaver;
use crate::protocol::error::Fs2Error;

const MAGIC: &[u8; 4] = b"FS2P";
const FORMAT_VERSION: u8 = 1;

/// Persisted per-peer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerRecord {
    pub favourite: bool,
    pub downloaded: u64,
    pub uploaded: u64,
    pub files_received: u32,
    pub files_sent: u32,
}

#[derive(Default)]
struct StatsInner {
    peers: HashMap<String, PeerRecord>,
    /// Peers that currently hold us in their upload queue. Transient.
    remote_queued: HashMap<String, u32>,
    /// Our active download count per peer. Transient.
    active_downloads: HashMap<String, u32>,
}

pub struct PeerStats {
    inner: Mutex<StatsInner>,
    saver: OnceLock<Arc<SafeSaver>>,
}

impl PeerStats {
    pub fn new() -> Arc<PeerStats> {
        Arc::new(PeerStats {
            inner: Mutex::new(StatsInner::default()),
            saver: OnceLock::new(),
        })
    }

    /// Load persisted stats; unreadable state starts fresh.
    pub fn load(path: &Path) -> Arc<PeerStats> {
        let stats = Self::new();
        match std::fs::read(path) {
            Ok(bytes) => match Self::decode(&bytes) {
                Ok(peers) => stats.inner.lock().unwrap().peers = peers,
                Err(e) => warn!(error = %e, "peer stats unreadable, starting afresh"),
            },
            Err(_) => {}
        }
        stats
    }

    /// Attach the debounced saver used after every mutation.
    pub fn set_saver(&self, saver: Arc<SafeSaver>) {
        let _ = self.saver.set(saver);
    }

    fn request_save(&self) {
        if let Some(saver) = self.saver.get() {
            saver.request_save();
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(32 + inner.peers.len() * 48);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&(inner.peers.len() as u32).to_be_bytes());
        let mut aliases: Vec<&String> = inner.peers.keys().collect();
        aliases.sort();
        for alias in aliases {
            let record = &inner.peers[alias];
            out.extend_from_slice(&(alias.len() as u16).to_be_bytes());
            out.extend_from_slice(alias.as_bytes());
            out.push(record.favourite as u8);
            out.extend_from_slice(&record.downloaded.to_be_bytes());
            out.extend_from_slice(&record.uploaded.to_be_bytes());
            out.extend_from_slice(&record.files_received.to_be_bytes());
            out.extend_from_slice(&record.files_sent.to_be_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<HashMap<String, PeerRecord>, Fs2Error> {
        let take = |bytes: &[u8], pos: &mut usize, n: usize| -> Result<Vec<u8>, Fs2Error> {
            if bytes.len() - *pos < n {
                return Err(Fs2Error::Parse("peer stats truncated".to_string()));
            }
            let out = bytes[*pos..*pos + n].to_vec();
            *pos += n;
            Ok(out)
        };
        let mut pos = 0;
        if take(bytes, &mut pos, 4)? != MAGIC {
            return Err(Fs2Error::Parse("bad peer stats magic".to_string()));
        }
        if take(bytes, &mut pos, 1)?[0] != FORMAT_VERSION {
            return Err(Fs2Error::Parse("unsupported peer stats version".to_string()));
        }
        let count = u32::from_be_bytes(take(bytes, &mut pos, 4)?.try_into().unwrap());
        let mut peers = HashMap::new();
        for _ in 0..count {
            let len = u16::from_be_bytes(take(bytes, &mut pos, 2)?.try_into().unwrap()) as usize;
            let alias = String::from_utf8(take(bytes, &mut pos, len)?)
                .map_err(|_| Fs2Error::Parse("alias not utf8".to_string()))?;
            let favourite = take(bytes, &mut pos, 1)?[0] != 0;
            let downloaded = u64::from_be_bytes(take(bytes, &mut pos, 8)?.try_into().unwrap());
            let uploaded = u64::from_be_bytes(take(bytes, &mut pos, 8)?.try_into().unwrap());
            let files_received = u32::from_be_bytes(take(bytes, &mut pos, 4)?.try_into().unwrap());
            let files_sent = u32::from_be_bytes(take(bytes, &mut pos, 4)?.try_into().unwrap());
            peers.insert(
                alias,
                PeerRecord {
                    favourite,
                    downloaded,
                    uploaded,
                    files_received,
                    files_sent,
                },
            );
        }
        Ok(peers)
    }

    pub fn record(&self, alias: &str) -> Option<PeerRecord> {
        self.inner.lock().unwrap().peers.get(alias).cloned()
    }

    /// Add a peer as a favourite (manual action).
    pub fn add_favourite(&self, alias: &str) {
        self.inner
            .lock()
            .unwrap()
            .peers
            .entry(alias.to_string())
            .or_default()
            .favourite = true;
        self.request_save();
    }

    pub fn is_favourite(&self, alias: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .peers
            .get(alias)
            .map(|r| r.favourite)
            .unwrap_or(false)
    }

    // --- Remote queue state (their uploads of our downloads) ---

    pub fn remotely_queued(&self, alias: &str) {
        *self
            .inner
            .lock()
            .unwrap()
            .remote_queued
            .entry(alias.to_string())
            .or_insert(0) += 1;
    }

    pub fn remote_queue_left(&self, alias: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.remote_queued.get_mut(alias) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.remote_queued.remove(alias);
            }
        }
    }

    // --- Download accounting ---

    pub fn download_started(&self, alias: &str) {
        *self
            .inner
            .lock()
            .unwrap()
            .active_downloads
            .entry(alias.to_string())
            .or_insert(0) += 1;
    }

    pub fn download_finished(&self, alias: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(count) = inner.active_downloads.get_mut(alias) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.active_downloads.remove(alias);
            }
        }
    }

    pub fn received_bytes(&self, alias: &str, bytes: u64) {
        self.inner
            .lock()
            .unwrap()
            .peers
            .entry(alias.to_string())
            .or_default()
            .downloaded += bytes;
        self.request_save();
    }

    pub fn received_file(&self, alias: &str) {
        self.inner
            .lock()
            .unwrap()
            .peers
            .entry(alias.to_string())
            .or_default()
            .files_received += 1;
        self.request_save();
    }

    // --- Upload accounting (from the file server) ---

    pub fn sent_bytes(&self, alias: &str, bytes: u64) {
        self.inner
            .lock()
            .unwrap()
            .peers
            .entry(alias.to_string())
            .or_default()
            .uploaded += bytes;
        self.request_save();
    }

    pub fn sent_file(&self, alias: &str) {
        self.inner
            .lock()
            .unwrap()
            .peers
            .entry(alias.to_string())
            .or_default()
            .files_sent += 1;
        self.request_save();
    }

    /// Pick the most attractive source alias out of the candidates.
    pub fn best_source(&self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let mut inner = self.inner.lock().unwrap();
        for alias in candidates {
            inner.peers.entry(alias.clone()).or_default();
        }

        let attractiveness = |inner: &StatsInner, alias: &String| {
            let queued = inner.remote_queued.contains_key(alias);
            let favourite = inner
                .peers
                .get(alias)
                .map(|r| r.favourite)
                .unwrap_or(false);
            let active = inner.active_downloads.get(alias).copied().unwrap_or(0);
            // Lower tuple sorts more attractive.
            (queued, !favourite, active)
        };

        let best = candidates
            .iter()
            .map(|alias| attractiveness(&inner, alias))
            .min()?;
        let tied: Vec<&String> = candidates
            .iter()
            .filter(|alias| attractiveness(&inner, alias) == best)
            .collect();
        tied.choose(&mut rand::thread_rng())
            .map(|alias| (*alias).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aliases(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn favourites_beat_plain_peers() {
        let stats = PeerStats::new();
        stats.add_favourite("fav");
        for _ in 0..64 {
            assert_eq!(
                stats.best_source(&aliases(&["plain", "fav"])).unwrap(),
                "fav"
            );
        }
    }

    #[test]
    fn remote_queued_peers_are_worst() {
        let stats = PeerStats::new();
        stats.add_favourite("fav");
        stats.remotely_queued("fav");
        // Even a favourite loses once it has queued us.
        for _ in 0..64 {
            assert_eq!(
                stats.best_source(&aliases(&["plain", "fav"])).unwrap(),
                "plain"
            );
        }
        // Until the queue state clears.
        stats.remote_queue_left("fav");
        assert_eq!(
            stats.best_source(&aliases(&["plain", "fav"])).unwrap(),
            "fav"
        );
    }

    #[test]
    fn fewer_active_downloads_wins() {
        let stats = PeerStats::new();
        stats.download_started("busy");
        stats.download_started("busy");
        stats.download_started("idle");
        stats.download_finished("idle");
        for _ in 0..64 {
            assert_eq!(
                stats.best_source(&aliases(&["busy", "idle"])).unwrap(),
                "idle"
            );
        }
    }

    #[test]
    fn ties_pick_any_candidate() {
        let stats = PeerStats::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            seen.insert(stats.best_source(&aliases(&["a", "b", "c"])).unwrap());
        }
        assert_eq!(seen.len(), 3, "uniform tie-break should hit everyone");
    }

    #[test]
    fn empty_candidates_yield_none() {
        let stats = PeerStats::new();
        assert_eq!(stats.best_source(&[]), None);
    }

    #[test]
    fn counters_accumulate() {
        let stats = PeerStats::new();
        stats.received_bytes("bob", 100);
        stats.received_bytes("bob", 50);
        stats.received_file("bob");
        stats.sent_bytes("bob", 10);
        stats.sent_file("bob");
        let record = stats.record("bob").unwrap();
        assert_eq!(record.downloaded, 150);
        assert_eq!(record.files_received, 1);
        assert_eq!(record.uploaded, 10);
        assert_eq!(record.files_sent, 1);
    }

    #[test]
    fn encode_decode_round_trip() {
        let stats = PeerStats::new();
        stats.add_favourite("alice");
        stats.received_bytes("alice", 1234);
        stats.sent_bytes("bob", 99);
        stats.received_file("alice");

        let bytes = stats.encode();
        let decoded = PeerStats::decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert!(decoded["alice"].favourite);
        assert_eq!(decoded["alice"].downloaded, 1234);
        assert_eq!(decoded["alice"].files_received, 1);
        assert_eq!(decoded["bob"].uploaded, 99);
        // Canonical encoding round-trips.
        let stats2 = PeerStats::new();
        stats2.inner.lock().unwrap().peers = decoded;
        assert_eq!(stats2.encode(), bytes);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(PeerStats::decode(b"nope").is_err());
        assert!(PeerStats::decode(b"FS2P\x02\x00\x00\x00\x00").is_err());
        let mut truncated = PeerStats::new().encode();
        truncated.extend_from_slice(&[0, 5, b'a']);
        // Count says zero but trailing garbage: tolerated (count-driven).
        let _ = PeerStats::decode(&truncated);
    }

    #[test]
    fn load_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let stats = PeerStats::load(&dir.path().join("peerstats"));
        assert_eq!(stats.record("anyone"), None);
    }

    #[test]
    fn load_saved_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peerstats");
        let stats = PeerStats::new();
        stats.add_favourite("carol");
        crate::data::saver::save_atomic(&path, &stats.encode()).unwrap();

        let loaded = PeerStats::load(&path);
        assert!(loaded.is_favourite("carol"));
    }
}
