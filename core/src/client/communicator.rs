//! The indexnode communicator: registers this client with every known
//! indexnode, re-registers on change, and answers "who has this file".
//!
//! Indexnodes arrive two ways: statically configured URLs and UDP
//! adverts (when autodetection is on). Each node gets its own hello
//! loop; a share-list change pokes every loop immediately.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::http::client::{self, HttpUrl};
use crate::http::Request;
use crate::protocol::constants::FS2_PROTOCOL_VERSION;
use crate::protocol::types::FileHash;
use crate::wire::xml::alternatives_from_xml;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Never successfully registered.
    Unregistered,
    /// Last hello was accepted.
    Registered,
    /// Last hello failed; retried on the next interval.
    Unreachable,
}

/// One indexnode this client talks to.
pub struct RegisteredIndexnode {
    /// Base URL (path `/`).
    pub url: HttpUrl,
    /// Zero for statically configured nodes.
    pub advert_uid: u64,
    /// Token we mint for this node; it echoes it back to authenticate.
    pub cltoken: u64,
    status: Mutex<NodeStatus>,
    poke: Notify,
}

impl RegisteredIndexnode {
    pub fn status(&self) -> NodeStatus {
        *self.status.lock().unwrap()
    }

    pub fn is_registered(&self) -> bool {
        self.status() == NodeStatus::Registered
    }

    fn was_advertised(&self) -> bool {
        self.advert_uid != 0
    }
}

/// A download source for one file at one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSource {
    pub alias: String,
    pub url: HttpUrl,
}

pub(crate) struct IndexnodeCommunicator {
    nodes: Mutex<Vec<Arc<RegisteredIndexnode>>>,
    our_alias: String,
    our_port: u16,
    hello_interval: Duration,
    autodetect: bool,
    running: Arc<tokio::sync::RwLock<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    new_peer_listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    next_token: AtomicU64,
}

impl IndexnodeCommunicator {
    pub fn new(
        our_alias: String,
        our_port: u16,
        hello_interval: Duration,
        autodetect: bool,
        running: Arc<tokio::sync::RwLock<bool>>,
    ) -> Arc<IndexnodeCommunicator> {
        Arc::new(IndexnodeCommunicator {
            nodes: Mutex::new(Vec::new()),
            our_alias,
            our_port,
            hello_interval,
            autodetect,
            running,
            tasks: Mutex::new(Vec::new()),
            new_peer_listeners: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(rand::thread_rng().gen()),
        })
    }

    /// Called when any connected indexnode may have new peers; the
    /// download queue clears its no-source markers in response.
    pub fn register_new_peer_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.new_peer_listeners.lock().unwrap().push(Box::new(listener));
    }

    fn fire_new_peers(&self) {
        for listener in self.new_peer_listeners.lock().unwrap().iter() {
            listener();
        }
    }

    pub fn nodes(&self) -> Vec<Arc<RegisteredIndexnode>> {
        self.nodes.lock().unwrap().clone()
    }

    /// Add and start talking to an indexnode. Duplicate URLs and advert
    /// uids are ignored.
    pub fn add_node(self: &Arc<Self>, url: HttpUrl, advert_uid: u64) {
        let node = {
            let mut nodes = self.nodes.lock().unwrap();
            let duplicate = nodes.iter().any(|n| {
                n.url == url || (advert_uid != 0 && n.advert_uid == advert_uid)
            });
            if duplicate {
                return;
            }
            let node = Arc::new(RegisteredIndexnode {
                url,
                advert_uid,
                cltoken: self.next_token.fetch_add(1, Ordering::Relaxed),
                status: Mutex::new(NodeStatus::Unregistered),
                poke: Notify::new(),
            });
            nodes.push(node.clone());
            node
        };
        info!(url = %node.url, advert_uid, "indexnode added");
        let task = self.spawn_hello_loop(node);
        self.tasks.lock().unwrap().push(task);
    }

    /// Drop an indexnode (used when an internal indexnode shuts down or
    /// autodetection is disabled).
    pub fn remove_by_advert_uid(&self, advert_uid: u64) {
        let mut nodes = self.nodes.lock().unwrap();
        nodes.retain(|n| {
            if n.advert_uid == advert_uid {
                *n.status.lock().unwrap() = NodeStatus::Unregistered;
                false
            } else {
                true
            }
        });
    }

    /// An advert arrived: register the sender if it is new.
    pub fn advert_received(self: &Arc<Self>, ip: IpAddr, port: u16, advert_uid: u64) {
        if !self.autodetect {
            return;
        }
        let known = self
            .nodes
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.advert_uid == advert_uid);
        if known {
            return;
        }
        let host = match ip {
            IpAddr::V6(v6) => v6.to_string(),
            IpAddr::V4(v4) => v4.to_string(),
        };
        let url = HttpUrl {
            host,
            port,
            path: "/".to_string(),
        };
        info!(%url, advert_uid, "autodetected indexnode");
        self.add_node(url, advert_uid);
    }

    /// Shares changed: re-register with everyone right away so the
    /// indexnodes reconsider our manifests.
    pub fn shares_changed(&self) {
        for node in self.nodes() {
            node.poke.notify_one();
        }
    }

    /// True if the requester is one of our indexnodes authenticating
    /// with the token we minted for it, or loopback.
    pub fn is_known_indexnode(&self, request: &Request) -> bool {
        if request.remote.ip().is_loopback() {
            return true;
        }
        let Some(token) = request
            .header("fs2-cltoken")
            .and_then(|t| t.parse::<u64>().ok())
        else {
            return false;
        };
        self.nodes.lock().unwrap().iter().any(|n| {
            n.cltoken == token && n.url.host == request.remote.ip().to_string()
        })
    }

    /// True if any indexnode is currently accepting us.
    pub fn has_registered_nodes(&self) -> bool {
        self.nodes.lock().unwrap().iter().any(|n| n.is_registered())
    }

    /// True if a statically configured indexnode is currently connected.
    pub fn static_indexnode_active(&self) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .any(|n| !n.was_advertised() && n.is_registered())
    }

    /// True if an advertised indexnode other than `own_uid` is
    /// currently connected.
    pub fn remote_auto_indexnode_active(&self, own_uid: u64) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .iter()
            .any(|n| n.was_advertised() && n.advert_uid != own_uid && n.is_registered())
    }

    fn hello_headers(&self, node: &RegisteredIndexnode) -> Vec<(String, String)> {
        vec![
            ("fs2-version".to_string(), FS2_PROTOCOL_VERSION.to_string()),
            ("fs2-port".to_string(), self.our_port.to_string()),
            ("fs2-cltoken".to_string(), node.cltoken.to_string()),
            ("fs2-alias".to_string(), self.our_alias.clone()),
        ]
    }

    fn spawn_hello_loop(self: &Arc<Self>, node: Arc<RegisteredIndexnode>) -> JoinHandle<()> {
        let communicator = self.clone();
        let running = self.running.clone();
        let interval = self.hello_interval;
        tokio::spawn(async move {
            loop {
                if !*running.read().await {
                    break;
                }
                // Dropped nodes stop quietly at the next wakeup.
                let still_known = communicator
                    .nodes
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|n| Arc::ptr_eq(n, &node));
                if !still_known {
                    break;
                }
                communicator.say_hello(&node).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = node.poke.notified() => {}
                }
            }
            debug!(url = %node.url, "hello loop stopped");
        })
    }

    async fn say_hello(&self, node: &Arc<RegisteredIndexnode>) {
        let url = node.url.with_path("/hello");
        let result = client::get(&url, &self.hello_headers(node), Duration::from_secs(15)).await;
        let new_status = match result {
            Ok(resp) if resp.is_success() => NodeStatus::Registered,
            Ok(resp) => {
                debug!(url = %node.url, status = resp.status, "hello refused");
                NodeStatus::Unreachable
            }
            Err(e) => {
                debug!(url = %node.url, error = %e, "hello failed");
                NodeStatus::Unreachable
            }
        };
        let was = {
            let mut status = node.status.lock().unwrap();
            std::mem::replace(&mut *status, new_status)
        };
        if new_status == NodeStatus::Registered && was != NodeStatus::Registered {
            info!(url = %node.url, "registered with indexnode");
            self.fire_new_peers();
        }
    }

    /// Merge download sources for a file across every registered
    /// indexnode, keyed by peer alias.
    pub async fn sources_for(&self, hash: &FileHash) -> HashMap<String, DownloadSource> {
        let nodes: Vec<Arc<RegisteredIndexnode>> = self
            .nodes()
            .into_iter()
            .filter(|n| n.is_registered())
            .collect();
        let mut sources = HashMap::new();
        for node in nodes {
            let url = node.url.with_path(format!("/alternatives/{}", hash.to_hex()));
            let response =
                match client::get(&url, &self.hello_headers(&node), Duration::from_secs(15)).await {
                    Ok(resp) if resp.is_success() => resp,
                    Ok(_) | Err(_) => continue,
                };
            let Ok(body) = std::str::from_utf8(&response.body) else {
                continue;
            };
            match alternatives_from_xml(body) {
                Ok(rows) => {
                    for row in rows {
                        if let Some(url) = HttpUrl::parse(&row.url) {
                            sources.insert(
                                row.alias.clone(),
                                DownloadSource {
                                    alias: row.alias,
                                    url,
                                },
                            );
                        }
                    }
                }
                Err(e) => warn!(url = %node.url, error = %e, "bad alternatives document"),
            }
        }
        sources
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}
