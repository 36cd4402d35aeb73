//! Auto-indexnode election: every capable client advertises a
//! capability score; the best one elects itself and hosts an in-process
//! indexnode until someone better shows up.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::client::HttpUrl;
use crate::indexnode::{generate_capability_value, AdvertSource, IndexNode};
use crate::protocol::config::IndexnodeConfig;
use crate::wire::advert::Advert;

use super::communicator::IndexnodeCommunicator;

/// Remembers the capability claims heard from other clients.
pub struct CapabilityRecorder {
    records: Mutex<Vec<CapabilityRecord>>,
    our_uid: u64,
    decay: Duration,
}

struct CapabilityRecord {
    advert_uid: u64,
    capability: u64,
    last_received: Instant,
}

impl CapabilityRecorder {
    pub fn new(our_uid: u64, decay: Duration) -> Arc<CapabilityRecorder> {
        Arc::new(CapabilityRecorder {
            records: Mutex::new(Vec::new()),
            our_uid,
            decay,
        })
    }

    /// Record (or refresh) a capability claim.
    pub fn record(&self, advert_uid: u64, capability: u64) {
        let mut records = self.records.lock().unwrap();
        let now = Instant::now();
        match records.iter_mut().find(|r| r.advert_uid == advert_uid) {
            Some(record) => {
                record.capability = capability;
                record.last_received = now;
            }
            None => records.push(CapabilityRecord {
                advert_uid,
                capability,
                last_received: now,
            }),
        }
    }

    fn prune(records: &mut Vec<CapabilityRecord>, decay: Duration) {
        let now = Instant::now();
        records.retain(|r| now.duration_since(r.last_received) < decay);
    }

    /// The strongest unexpired claim: (capability, advert uid).
    pub fn greatest_recent(&self) -> Option<(u64, u64)> {
        let mut records = self.records.lock().unwrap();
        Self::prune(&mut records, self.decay);
        records
            .iter()
            .max_by_key(|r| r.capability)
            .map(|r| (r.capability, r.advert_uid))
    }

    /// Unexpired clients seen (including us if we have been heard).
    pub fn record_count(&self) -> usize {
        let mut records = self.records.lock().unwrap();
        Self::prune(&mut records, self.decay);
        records.len()
    }

    /// Our 1-based position in the capability ranking; 0 when our own
    /// advert has not been heard back yet.
    pub fn rank(&self) -> usize {
        let mut records = self.records.lock().unwrap();
        Self::prune(&mut records, self.decay);
        records.sort_by(|a, b| b.capability.cmp(&a.capability));
        records
            .iter()
            .position(|r| r.advert_uid == self.our_uid)
            .map(|p| p + 1)
            .unwrap_or(0)
    }

    /// Election test: our capability beats every claim we have heard,
    /// or the winning claim is our own.
    pub fn am_i_most_capable(&self, my_capability: u64) -> bool {
        match self.greatest_recent() {
            None => true,
            Some((capability, advert_uid)) => {
                my_capability > capability || advert_uid == self.our_uid
            }
        }
    }
}

/// Listens for adverts: active ones feed indexnode autodetection,
/// prospective ones feed the capability table.
pub(crate) fn spawn_advert_listener(
    advert_port: u16,
    communicator: Arc<IndexnodeCommunicator>,
    recorder: Arc<CapabilityRecorder>,
    running: Arc<tokio::sync::RwLock<bool>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, advert_port)).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(
                    port = advert_port,
                    error = %e,
                    "cannot listen for adverts; autodetection and autohosting unavailable"
                );
                return;
            }
        };
        let mut buf = [0u8; 512];
        loop {
            let (n, from) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(_) => continue,
            };
            if !*running.read().await {
                break;
            }
            let Ok(text) = std::str::from_utf8(&buf[..n]) else {
                continue;
            };
            match Advert::parse(text) {
                Some(Advert::Active { port, advert_uid }) => {
                    communicator.advert_received(from.ip(), port, advert_uid);
                }
                Some(Advert::Prospective {
                    capability,
                    advert_uid,
                }) => {
                    recorder.record(advert_uid, capability);
                }
                None => {}
            }
        }
        debug!("advert listener stopped");
    })
}

/// Decides when this client should host an indexnode itself.
pub(crate) struct AutoIndexnodeManager {
    pub recorder: Arc<CapabilityRecorder>,
    communicator: Arc<IndexnodeCommunicator>,
    capability: u64,
    advert_uid: u64,
    internal_port: u16,
    internal: tokio::sync::Mutex<Option<IndexNode>>,
    active: AtomicBool,
    enabled: bool,
}

impl AutoIndexnodeManager {
    pub fn new(
        communicator: Arc<IndexnodeCommunicator>,
        advert_uid: u64,
        internal_port: u16,
        decay: Duration,
        enabled: bool,
    ) -> Arc<AutoIndexnodeManager> {
        Arc::new(AutoIndexnodeManager {
            recorder: CapabilityRecorder::new(advert_uid, decay),
            communicator,
            capability: generate_capability_value(),
            advert_uid,
            internal_port,
            internal: tokio::sync::Mutex::new(None),
            active: AtomicBool::new(false),
            enabled,
        })
    }

    pub fn capability(&self) -> u64 {
        self.capability
    }

    pub fn advert_uid(&self) -> u64 {
        self.advert_uid
    }

    pub fn is_hosting(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// One election round: start hosting when we are the best candidate
    /// and nothing better serves already; relinquish when outranked.
    pub async fn reconsider(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }
        // Our own adverts echo back to us, so the table usually holds
        // our claim too; the election rule handles both cases.
        let elected = self.recorder.am_i_most_capable(self.capability)
            && !self.communicator.static_indexnode_active()
            && !self
                .communicator
                .remote_auto_indexnode_active(self.advert_uid);

        let mut internal = self.internal.lock().await;
        if elected && internal.is_none() {
            let config = IndexnodeConfig::new()
                .with_port(self.internal_port)
                .with_alias("autoindexnode")
                .without_adverts();
            match IndexNode::start(config).await {
                Ok(node) => {
                    info!(port = node.port(), "elected: hosting an internal indexnode");
                    let url = HttpUrl {
                        host: "127.0.0.1".to_string(),
                        port: node.port(),
                        path: "/".to_string(),
                    };
                    *internal = Some(node);
                    self.active.store(true, Ordering::Release);
                    self.communicator.add_node(url, self.advert_uid);
                }
                Err(e) => {
                    warn!(error = %e, "could not start internal indexnode");
                }
            }
        } else if !elected {
            if let Some(node) = internal.take() {
                info!("a better indexnode appeared, relinquishing");
                self.active.store(false, Ordering::Release);
                node.shutdown().await;
                self.communicator.remove_by_advert_uid(self.advert_uid);
            }
        }
    }

    /// Periodic reconsideration loop.
    pub fn spawn_reconsider_loop(
        self: &Arc<Self>,
        interval: Duration,
        running: Arc<tokio::sync::RwLock<bool>>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                manager.reconsider().await;
            }
        })
    }

    pub async fn shutdown(&self) {
        if let Some(node) = self.internal.lock().await.take() {
            node.shutdown().await;
        }
        self.active.store(false, Ordering::Release);
    }
}

/// What this client says in its adverts: always prospective while
/// election is enabled, active only while actually hosting.
pub(crate) struct ClientAdvertSource {
    pub manager: Arc<AutoIndexnodeManager>,
}

impl AdvertSource for ClientAdvertSource {
    fn is_active(&self) -> bool {
        self.manager.is_hosting()
    }
    fn is_prospective(&self) -> bool {
        self.manager.enabled
    }
    fn port(&self) -> u16 {
        self.manager.internal_port
    }
    fn capability(&self) -> u64 {
        self.manager.capability
    }
    fn advert_uid(&self) -> u64 {
        self.manager.advert_uid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(our_uid: u64) -> Arc<CapabilityRecorder> {
        CapabilityRecorder::new(our_uid, Duration::from_secs(60))
    }

    #[test]
    fn empty_table_elects_self() {
        assert!(recorder(1).am_i_most_capable(100));
    }

    #[test]
    fn greater_capability_wins() {
        let rec = recorder(1);
        rec.record(2, 500_000);
        assert!(rec.am_i_most_capable(500_001));
        assert!(!rec.am_i_most_capable(500_000), "ties do not elect");
        assert!(!rec.am_i_most_capable(400_000));
    }

    #[test]
    fn winning_uid_elects_despite_tie() {
        let rec = recorder(1);
        // Our own echoed advert carries the top capability.
        rec.record(1, 500_000);
        rec.record(2, 400_000);
        assert!(rec.am_i_most_capable(500_000));
        assert_eq!(rec.rank(), 1);
    }

    #[test]
    fn records_expire() {
        let rec = CapabilityRecorder::new(1, Duration::from_millis(20));
        rec.record(2, 900_000);
        assert!(!rec.am_i_most_capable(100));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(rec.record_count(), 0);
        assert!(rec.am_i_most_capable(100));
    }

    #[test]
    fn updates_refresh_capability_and_clock() {
        let rec = recorder(1);
        rec.record(2, 100);
        rec.record(2, 999_999);
        assert_eq!(rec.record_count(), 1);
        assert_eq!(rec.greatest_recent(), Some((999_999, 2)));
    }

    #[test]
    fn rank_orders_by_capability() {
        let rec = recorder(5);
        rec.record(5, 300);
        rec.record(6, 400);
        rec.record(7, 200);
        assert_eq!(rec.rank(), 2);
        assert_eq!(rec.record_count(), 3);
    }

    fn communicator() -> Arc<IndexnodeCommunicator> {
        IndexnodeCommunicator::new(
            "tester".to_string(),
            41234,
            Duration::from_secs(3600),
            true,
            Arc::new(tokio::sync::RwLock::new(true)),
        )
    }

    #[tokio::test]
    async fn elects_hosts_and_relinquishes() {
        let comm = communicator();
        let manager = AutoIndexnodeManager::new(
            comm.clone(),
            1,
            0, // ephemeral port for the internal node
            Duration::from_secs(60),
            true,
        );

        // Nothing else out there: we elect ourselves.
        manager.reconsider().await;
        assert!(manager.is_hosting());
        assert_eq!(comm.nodes().len(), 1, "registered with our own node");

        // A vastly superior claim arrives: we stand down.
        manager.recorder.record(99, u64::MAX - 1);
        manager.reconsider().await;
        assert!(!manager.is_hosting());
        assert!(comm.nodes().is_empty());

        manager.shutdown().await;
        comm.shutdown();
    }

    #[tokio::test]
    async fn disabled_manager_never_hosts() {
        let comm = communicator();
        let manager =
            AutoIndexnodeManager::new(comm.clone(), 1, 0, Duration::from_secs(60), false);
        manager.reconsider().await;
        assert!(!manager.is_hosting());
        assert!(comm.nodes().is_empty());
        manager.shutdown().await;
        comm.shutdown();
    }
}
