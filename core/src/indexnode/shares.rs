//! Peer shares as the indexnode sees them: one record per (peer, share
//! name), refreshed by a bounded worker pool.
//!
//! A share's `revision`/`pending_revision` pair drives the refresh
//! queue: a share is due iff `pending_revision > revision`, rapid
//! re-announcements coalesce onto one fetch, and `delisted` is terminal.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::http::client::{self, HttpUrl};
use crate::protocol::error::Fs2Error;
use crate::protocol::types::ShareType;
use crate::wire::filelist::FileList;
use crate::wire::xml as wire_xml;

use super::filesystem::Filesystem;
use super::peers::Peer;

/// One share belonging to one peer.
#[derive(Debug)]
pub(crate) struct ShareRecord {
    pub uid: u64,
    pub name: String,
    pub owner: Weak<Peer>,
    pub share_type: ShareType,
    pub state: Mutex<ShareState>,
    /// Serialises refreshes of this share.
    refresh_gate: tokio::sync::Mutex<()>,
}

#[derive(Debug, Default)]
pub(crate) struct ShareState {
    pub revision: u32,
    pub pending_revision: u32,
    /// True once this share's tree is present in the filesystem.
    pub listed: bool,
    /// Terminal: a delisted share is never refreshed again.
    pub delisted: bool,
}

impl ShareRecord {
    pub fn new(uid: u64, name: String, share_type: ShareType, owner: &Arc<Peer>) -> Arc<ShareRecord> {
        info!(share = %name, uid, "share created, awaiting first refresh");
        Arc::new(ShareRecord {
            uid,
            name,
            owner: Arc::downgrade(owner),
            share_type,
            state: Mutex::new(ShareState::default()),
            refresh_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn pending_revision(&self) -> u32 {
        self.state.lock().unwrap().pending_revision
    }

    /// Raise the pending revision. Returns true if the share became due
    /// and should be queued.
    pub fn set_pending(&self, revision: u32) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.delisted || revision <= state.pending_revision {
            return false;
        }
        state.pending_revision = revision;
        true
    }

    /// Mark delisted and pull the subtree out of the filesystem.
    pub fn delist(&self, fs: &Filesystem) {
        let was_listed = {
            let mut state = self.state.lock().unwrap();
            state.delisted = true;
            std::mem::replace(&mut state.listed, false)
        };
        if was_listed {
            if let Some(owner) = self.owner.upgrade() {
                fs.delist_share(owner.fs_root(), &self.name);
            }
        }
        if let Some(owner) = self.owner.upgrade() {
            info!(share = %self.name, peer = %owner.alias(), "share delisted");
        }
    }

    /// Fetch this share's file list from its owner and swap it into the
    /// filesystem.
    ///
    /// Rollback policy: not-found and transport errors roll
    /// `pending_revision` back so the next hello can retry; a list that
    /// fetched but failed to decode leaves the pending revision raised,
    /// poisoning the share until the peer bumps its revision again.
    pub async fn refresh(self: &Arc<Self>, fs: &Filesystem) {
        let _gate = self.refresh_gate.lock().await;

        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        {
            let state = self.state.lock().unwrap();
            if state.delisted || state.pending_revision <= state.revision {
                return;
            }
        }

        let url = owner.url(&format!(
            "/filelists/{}{}",
            crate::http::parse::url_encode(&self.name),
            self.share_type.extension()
        ));

        let body = match self.fetch_list(&owner, &url).await {
            Ok(body) => body,
            Err(e) => {
                warn!(share = %self.name, peer = %owner.alias(), error = %e,
                      "file list fetch failed, rolling back for retry");
                let mut state = self.state.lock().unwrap();
                state.pending_revision = state.revision;
                return;
            }
        };

        let list = match self.share_type {
            ShareType::FileList => FileList::decode(&body),
            ShareType::Xml => match std::str::from_utf8(&body) {
                Ok(text) => wire_xml::filelist_from_xml(text),
                Err(_) => Err(Fs2Error::Parse("file list is not utf8".to_string())),
            },
        };
        let list = match list {
            Ok(list) => list,
            Err(e) => {
                // No rollback: retrying a corrupt list would only damage
                // quality of service until the peer actually changes it.
                warn!(share = %self.name, peer = %owner.alias(), error = %e,
                      "file list did not decode");
                return;
            }
        };

        let was_listed = {
            let mut state = self.state.lock().unwrap();
            if state.delisted {
                return;
            }
            state.revision = list.revision;
            if list.revision > state.pending_revision {
                state.pending_revision = list.revision;
            }
            std::mem::replace(&mut state.listed, true)
        };

        let client_root = owner.fs_root();
        if was_listed {
            fs.delist_share(client_root, &self.name);
        }
        let mut tree = list.root;
        // The record's name is authoritative over what the list claims.
        tree.name = self.name.clone();
        fs.import_share(&tree, self.uid, client_root);
        info!(share = %self.name, peer = %owner.alias(), revision = list.revision,
              "refresh complete");
    }

    async fn fetch_list(&self, owner: &Arc<Peer>, url: &HttpUrl) -> Result<Vec<u8>, Fs2Error> {
        let response = client::get(url, &owner.request_headers(), Duration::from_secs(60)).await?;
        if response.status == 404 {
            return Err(Fs2Error::NotFound(format!("{}", url)));
        }
        if !response.is_success() {
            return Err(Fs2Error::Network(format!(
                "{} answered {}",
                url, response.status
            )));
        }
        Ok(response.body)
    }
}

/// Handle to the bounded refresh worker pool.
pub(crate) struct RefreshPool {
    tx: mpsc::UnboundedSender<Arc<ShareRecord>>,
}

impl RefreshPool {
    /// Spawn `size` workers feeding from one queue.
    pub fn spawn(
        size: usize,
        fs: Arc<Filesystem>,
        running: Arc<tokio::sync::RwLock<bool>>,
    ) -> (RefreshPool, Vec<tokio::task::JoinHandle<()>>) {
        let (tx, rx) = mpsc::unbounded_channel::<Arc<ShareRecord>>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut handles = Vec::with_capacity(size.max(1));
        for worker in 0..size.max(1) {
            let rx = rx.clone();
            let fs = fs.clone();
            let running = running.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let share = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(share) = share else { break };
                    if !*running.read().await {
                        break;
                    }
                    share.refresh(&fs).await;
                }
                debug!(worker, "refresh worker stopped");
            }));
        }
        (RefreshPool { tx }, handles)
    }

    /// Queue a share for refresh. Quietly drops once shut down.
    pub fn submit(&self, share: Arc<ShareRecord>) {
        let _ = self.tx.send(share);
    }
}
