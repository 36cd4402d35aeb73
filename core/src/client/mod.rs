//! The client role: exports shares over HTTP, registers with
//! indexnodes, downloads from peers, and can elect itself as an
//! auto-indexnode.

pub mod autoindex;
pub mod communicator;
pub mod digest;
pub mod download;
pub mod peerstats;
pub mod share;

pub(crate) mod server;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::data::saver::{save_atomic, SafeSaver};
use crate::data::default_data_dir;
use crate::http::client::HttpUrl;
use crate::indexnode::advertiser::spawn_advertiser;
use crate::protocol::config::ClientConfig;
use crate::protocol::constants::UPLOAD_SLOT_EXPIRY_MS;
use crate::protocol::error::Fs2Error;
use crate::resilience::bandwidth::TokenBucket;
use crate::resilience::slots::UploadSlots;

pub use autoindex::CapabilityRecorder;
pub use communicator::{DownloadSource, NodeStatus, RegisteredIndexnode};
pub use download::{DownloadQueue, QueuedDownload};
pub use peerstats::{PeerRecord, PeerStats};
pub use share::{ErrorCause, Share, ShareStatus};

use autoindex::{spawn_advert_listener, AutoIndexnodeManager, ClientAdvertSource};
use communicator::IndexnodeCommunicator;
use download::DownloadController;
use server::FileServer;
use share::ShareEngine;

struct ClientInner {
    config: ClientConfig,
    data_dir: PathBuf,
    download_dir: PathBuf,
    local_port: u16,
    engine: Arc<ShareEngine>,
    communicator: Arc<IndexnodeCommunicator>,
    peerstats: Arc<PeerStats>,
    queue: Arc<DownloadQueue>,
    manager: Option<Arc<AutoIndexnodeManager>>,
    queue_saver: Arc<SafeSaver>,
    stats_saver: Arc<SafeSaver>,
    running: Arc<tokio::sync::RwLock<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A running client. Shut it down explicitly; dropping the handle
/// leaves background tasks running.
pub struct ClientNode {
    inner: Arc<ClientInner>,
}

impl ClientNode {
    pub async fn start(config: ClientConfig) -> Result<ClientNode, Fs2Error> {
        let data_dir = config.data_dir.clone().unwrap_or_else(default_data_dir);
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Fs2Error::StartFailed(format!("state dir: {}", e)))?;
        let download_dir = config
            .download_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("downloads"));

        let listener = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|e| Fs2Error::StartFailed(format!("cannot bind port {}: {}", config.port, e)))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| Fs2Error::StartFailed(e.to_string()))?
            .port();

        let running = Arc::new(tokio::sync::RwLock::new(true));
        let net_bucket = Arc::new(TokenBucket::new(config.network_bytes_per_sec));
        let hash_bucket = Arc::new(TokenBucket::new(config.hash_bytes_per_sec));

        let engine = ShareEngine::new(
            data_dir.join("filelists"),
            hash_bucket,
            Duration::from_secs(config.share_auto_refresh_secs),
        )
        .map_err(|e| Fs2Error::StartFailed(format!("filelists dir: {}", e)))?;

        // Persisted peer stats with a debounced saver.
        let peerstats = PeerStats::load(&data_dir.join("peerstats"));
        let stats_saver = {
            let peerstats = peerstats.clone();
            let path = data_dir.join("peerstats");
            SafeSaver::new(
                Duration::from_millis(config.peerstats_save_min_interval_ms),
                Arc::new(move || {
                    if let Err(e) = save_atomic(&path, &peerstats.encode()) {
                        tracing::warn!(error = %e, "peer stats save failed");
                    }
                }),
            )
        };
        peerstats.set_saver(stats_saver.clone());

        // Persisted download queue, same idiom.
        let queue = DownloadQueue::load(&data_dir.join("downloadqueue"));
        let queue_saver = {
            let queue = queue.clone();
            let path = data_dir.join("downloadqueue");
            SafeSaver::new(
                Duration::from_millis(config.queue_save_min_interval_ms),
                Arc::new(move || {
                    if let Err(e) = save_atomic(&path, &queue.encode()) {
                        tracing::warn!(error = %e, "download queue save failed");
                    }
                }),
            )
        };
        queue.set_saver(queue_saver.clone());

        let listen_for_adverts = config.autodetect_indexnodes || config.auto_indexnode;
        let communicator = IndexnodeCommunicator::new(
            config.alias.clone(),
            local_port,
            Duration::from_millis(config.hello_interval_ms),
            listen_for_adverts,
            running.clone(),
        );

        // Completed refreshes re-register us everywhere.
        {
            let communicator = communicator.clone();
            engine.set_change_listener(move || communicator.shares_changed());
        }
        // New peers anywhere clear the queue's no-source markers.
        {
            let queue = queue.clone();
            communicator.register_new_peer_listener(move || queue.new_peers_present());
        }

        let slots = UploadSlots::new(
            config.upload_slots,
            config.upload_slots_per_peer,
            Duration::from_millis(UPLOAD_SLOT_EXPIRY_MS),
        );
        let server = Arc::new(FileServer {
            alias: config.alias.clone(),
            port: local_port,
            engine: engine.clone(),
            slots,
            net_bucket: net_bucket.clone(),
            peerstats: peerstats.clone(),
            gate: {
                let communicator = communicator.clone();
                Arc::new(move |request| communicator.is_known_indexnode(request))
            },
        });

        let mut tasks = Vec::new();
        tasks.push(server.spawn(listener));

        for url in &config.indexnodes {
            match HttpUrl::parse(url) {
                Some(url) => communicator.add_node(url, 0),
                None => tracing::warn!(url, "ignoring malformed indexnode URL"),
            }
        }

        let controller = Arc::new(DownloadController {
            queue: queue.clone(),
            communicator: communicator.clone(),
            peerstats: peerstats.clone(),
            net_bucket,
            our_alias: config.alias.clone(),
            our_port: local_port,
            chunk_size: config.download_chunk_size,
            chunks_per_file: config.chunks_per_file,
            max_active: config.max_active_downloads,
            running: running.clone(),
        });
        tasks.push(controller.spawn());

        // Share refresh consideration timer.
        {
            let engine = engine.clone();
            let running = running.clone();
            let poll = Duration::from_millis(config.share_refresh_poll_ms);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(poll);
                loop {
                    ticker.tick().await;
                    if !*running.read().await {
                        break;
                    }
                    engine.refresh_overdue();
                }
            }));
        }

        // Auto-indexnode machinery: listener, election loop, adverts.
        let manager = if listen_for_adverts {
            let advert_uid = rand::thread_rng().gen_range(1..u64::MAX);
            let manager = AutoIndexnodeManager::new(
                communicator.clone(),
                advert_uid,
                config.internal_indexnode_port,
                Duration::from_millis(crate::protocol::constants::CAPABILITY_TABLE_DECAY_MS),
                config.auto_indexnode,
            );
            tasks.push(spawn_advert_listener(
                config.advert_port,
                communicator.clone(),
                manager.recorder.clone(),
                running.clone(),
            ));
            if config.auto_indexnode {
                tasks.push(manager.spawn_reconsider_loop(
                    Duration::from_millis(config.reconsider_interval_ms),
                    running.clone(),
                ));
                tasks.push(spawn_advertiser(
                    Arc::new(ClientAdvertSource {
                        manager: manager.clone(),
                    }),
                    config.advert_port,
                    Duration::from_millis(
                        crate::protocol::constants::INDEXNODE_ADVERTISE_INTERVAL_MS,
                    ),
                    running.clone(),
                ));
            }
            Some(manager)
        } else {
            None
        };

        info!(port = local_port, alias = %config.alias, "client started");
        Ok(ClientNode {
            inner: Arc::new(ClientInner {
                config,
                data_dir,
                download_dir,
                local_port,
                engine,
                communicator,
                peerstats,
                queue,
                manager,
                queue_saver,
                stats_saver,
                running,
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner.local_port
    }

    pub fn alias(&self) -> &str {
        &self.inner.config.alias
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Export a directory as a named share.
    pub async fn add_share(&self, name: &str, location: PathBuf) -> Result<(), Fs2Error> {
        self.inner.engine.add_share(name, location)
    }

    pub async fn remove_share(&self, name: &str) -> bool {
        self.inner.engine.remove_share(name)
    }

    pub fn shares(&self) -> Vec<Arc<Share>> {
        self.inner.engine.all_shares()
    }

    /// Re-scan every share now (the portable replacement for the old
    /// signal-triggered rescan).
    pub fn refresh_all_shares(&self) {
        self.inner.engine.refresh_all();
    }

    /// Start talking to another indexnode.
    pub fn add_indexnode(&self, url: &str) -> Result<(), Fs2Error> {
        let url = HttpUrl::parse(url)
            .ok_or_else(|| Fs2Error::InvalidInput(format!("bad indexnode URL: {}", url)))?;
        self.inner.communicator.add_node(url, 0);
        Ok(())
    }

    pub fn indexnodes(&self) -> Vec<Arc<RegisteredIndexnode>> {
        self.inner.communicator.nodes()
    }

    /// Queue files for download into `into` (or the default download
    /// directory). Returns how many were newly queued; resubmitting a
    /// file already queued in the same directory is a no-op.
    pub fn download(&self, files: &[QueuedDownload], into: Option<&Path>) -> usize {
        let target = into.unwrap_or(&self.inner.download_dir);
        self.inner.queue.submit(target, &[], files)
    }

    pub fn queue(&self) -> Arc<DownloadQueue> {
        self.inner.queue.clone()
    }

    pub fn peer_stats(&self) -> Arc<PeerStats> {
        self.inner.peerstats.clone()
    }

    /// True while this client hosts an elected internal indexnode.
    pub fn is_hosting_indexnode(&self) -> bool {
        self.inner
            .manager
            .as_ref()
            .map(|m| m.is_hosting())
            .unwrap_or(false)
    }

    /// Stop every background task and flush persisted state.
    pub async fn shutdown(&self) {
        *self.inner.running.write().await = false;
        self.inner.engine.shutdown();
        self.inner.communicator.shutdown();
        if let Some(manager) = &self.inner.manager {
            manager.shutdown().await;
        }
        self.inner.queue_saver.shutdown().await;
        self.inner.stats_saver.shutdown().await;
        for task in self.inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        info!(alias = %self.inner.config.alias, "client stopped");
    }
}
