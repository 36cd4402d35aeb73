//! The in-memory virtual filesystem: one tree merging every peer's
//! shares, plus two secondary indices (by content hash, by name keyword).
//!
//! Entries live in an arena addressed by `EntryId`; parents are plain
//! back-links into the arena. The whole structure sits behind one
//! RwLock taken only for the window of each operation, and every reader
//! gets owned snapshots (`EntryInfo`), so no lock is ever held across
//! I/O. Mutations keep three invariants:
//!
//! - a directory's size is the sum of its children's sizes
//! - a directory's link count is 2 + its child directory count
//! - an entry is present in both indices exactly while it is reachable
//!   from the root

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::protocol::constants::FILE_DIGEST_VERSION;
use crate::protocol::types::{keywords, FileHash};
use crate::wire::filelist::Item;

/// Index of an entry in the arena. Stale ids (for erased subtrees) are
/// simply absent; every public operation re-validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(u32);

#[derive(Debug)]
struct EntryNode {
    name: String,
    size: u64,
    link_count: u32,
    /// None marks a directory.
    hash: Option<FileHash>,
    /// Owning share uid; None for the root and per-client roots.
    share: Option<u64>,
    parent: Option<EntryId>,
    children: HashMap<String, EntryId>,
}

impl EntryNode {
    fn is_directory(&self) -> bool {
        self.hash.is_none()
    }
}

/// An owned snapshot of one entry, safe to hold without any lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
    pub link_count: u32,
    pub hash: Option<FileHash>,
    pub share: Option<u64>,
    /// Full path from the root, `/`-separated, starting with the owning
    /// peer's alias. Empty for the root itself.
    pub path: String,
}

impl EntryInfo {
    pub fn is_directory(&self) -> bool {
        self.hash.is_none()
    }

    /// The owning peer's alias (first path segment).
    pub fn owner_alias(&self) -> Option<&str> {
        self.path.split('/').next().filter(|s| !s.is_empty())
    }

    /// The path below the owning peer: `share/dir/file`.
    pub fn share_path(&self) -> Option<&str> {
        self.path.split_once('/').map(|(_, rest)| rest)
    }
}

struct FsInner {
    arena: Vec<Option<EntryNode>>,
    free: Vec<u32>,
    root: EntryId,
    hash_index: HashMap<FileHash, HashSet<EntryId>>,
    name_index: HashMap<String, HashSet<EntryId>>,
    file_count: u64,
}

/// The filesystem index. Cheap to share; all methods take `&self`.
pub struct Filesystem {
    inner: RwLock<FsInner>,
    estimated_transfer: AtomicU64,
}

impl Default for Filesystem {
    fn default() -> Self {
        Self::new()
    }
}

impl Filesystem {
    pub fn new() -> Filesystem {
        let root = EntryNode {
            name: String::new(),
            size: 0,
            link_count: 2,
            hash: None,
            share: None,
            parent: None,
            children: HashMap::new(),
        };
        Filesystem {
            inner: RwLock::new(FsInner {
                arena: vec![Some(root)],
                free: Vec::new(),
                root: EntryId(0),
                hash_index: HashMap::new(),
                name_index: HashMap::new(),
                file_count: 0,
            }),
            estimated_transfer: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> EntryId {
        self.inner.read().unwrap().root
    }

    /// Create the per-client container under the root.
    pub fn register_client(&self, alias: &str) -> EntryId {
        let mut fs = self.inner.write().unwrap();
        let root = fs.root;
        fs.node_mut(root).link_count += 1;
        fs.create_entry(root, alias.to_string(), None, 0, 2, None)
    }

    /// Remove a client's container and everything under it.
    pub fn deregister_client(&self, client_root: EntryId) {
        let mut fs = self.inner.write().unwrap();
        let Some(node) = fs.node(client_root) else {
            return;
        };
        let size = node.size;
        let root = fs.root;
        fs.node_mut(root).size -= size;
        fs.node_mut(root).link_count -= 1;
        fs.erase(client_root);
    }

    /// Rename an entry in place (used for peer alias changes). Keyword
    /// postings move with the name; the hash index is untouched.
    pub fn rename(&self, id: EntryId, new_name: &str) {
        let mut fs = self.inner.write().unwrap();
        let Some(node) = fs.node(id) else { return };
        let old_name = node.name.clone();
        if old_name == new_name {
            return;
        }
        if let Some(parent) = node.parent {
            fs.node_mut(parent).children.remove(&old_name);
            fs.node_mut(parent)
                .children
                .insert(new_name.to_string(), id);
        }
        fs.remove_name_index(id, &old_name);
        fs.node_mut(id).name = new_name.to_string();
        fs.add_name_index(id, new_name);
    }

    /// Graft a share's tree under a client root. Items with a foreign
    /// hash version or a malformed digest are skipped silently.
    pub fn import_share(&self, tree: &Item, share_uid: u64, client_root: EntryId) {
        let mut fs = self.inner.write().unwrap();
        if fs.node(client_root).is_none() {
            return;
        }
        // A leftover subtree of the same name would leak index entries.
        if let Some(stale) = fs.node(client_root).unwrap().children.get(&tree.name).copied() {
            let size = fs.node(stale).map(|n| n.size).unwrap_or(0);
            fs.node_mut(client_root).size -= size;
            fs.node_mut(client_root).link_count -= 1;
            let root = fs.root;
            fs.node_mut(root).size -= size;
            fs.erase(stale);
        }

        let share_root =
            fs.create_entry(client_root, tree.name.clone(), None, 0, 2, Some(share_uid));
        let imported = fs.import_children(tree, share_root, share_uid);
        fs.node_mut(client_root).link_count += 1;
        fs.node_mut(client_root).size += imported;
        let root = fs.root;
        fs.node_mut(root).size += imported;
    }

    /// Remove one share's subtree from under a client root. Returns
    /// false if no such share was listed.
    pub fn delist_share(&self, client_root: EntryId, share_name: &str) -> bool {
        let mut fs = self.inner.write().unwrap();
        let Some(client) = fs.node(client_root) else {
            return false;
        };
        let Some(share_root) = client.children.get(share_name).copied() else {
            return false;
        };
        let size = fs.node(share_root).map(|n| n.size).unwrap_or(0);
        fs.node_mut(client_root).size -= size;
        fs.node_mut(client_root).link_count -= 1;
        let root = fs.root;
        fs.node_mut(root).size -= size;
        fs.erase(share_root);
        true
    }

    /// Walk a `/`-separated path from the root. Empty segments are
    /// skipped, so the empty path is the root. Case-sensitive.
    pub fn lookup_path(&self, path: &str) -> Option<EntryInfo> {
        let fs = self.inner.read().unwrap();
        let id = fs.resolve(path)?;
        Some(fs.snapshot(id))
    }

    /// Children of the directory at `path`, sorted by name. None if the
    /// path does not resolve to a directory.
    pub fn browse(&self, path: &str) -> Option<Vec<EntryInfo>> {
        let fs = self.inner.read().unwrap();
        let id = fs.resolve(path)?;
        let node = fs.node(id)?;
        if !node.is_directory() {
            return None;
        }
        let mut out: Vec<EntryInfo> = node
            .children
            .values()
            .map(|&child| fs.snapshot(child))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Some(out)
    }

    /// Keyword search: the intersection of per-keyword posting lists in
    /// input order, capped at `max` results. Files are deduplicated by
    /// hash after intersection; directory hits are never deduplicated.
    pub fn search_name(&self, query: &str, max: usize) -> Vec<EntryInfo> {
        let words = keywords(query);
        if words.is_empty() {
            return Vec::new();
        }
        let fs = self.inner.read().unwrap();

        let mut results: Option<HashSet<EntryId>> = None;
        for word in &words {
            // An absent keyword empties the whole intersection.
            let Some(posting) = fs.name_index.get(word) else {
                return Vec::new();
            };
            results = Some(match results {
                None => posting.clone(),
                Some(set) => set.intersection(posting).copied().collect(),
            });
        }

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in results.unwrap_or_default() {
            let Some(node) = fs.node(id) else { continue };
            match node.hash {
                None => out.push(fs.snapshot(id)),
                Some(hash) => {
                    if seen.insert(hash) {
                        out.push(fs.snapshot(id));
                    }
                }
            }
            if out.len() >= max {
                break;
            }
        }
        out
    }

    /// Every file entry sharing this hash (the alternatives set).
    pub fn search_hash(&self, hash: &FileHash) -> Vec<EntryInfo> {
        let fs = self.inner.read().unwrap();
        match fs.hash_index.get(hash) {
            Some(set) => set.iter().map(|&id| fs.snapshot(id)).collect(),
            None => Vec::new(),
        }
    }

    /// One representative per hash class, classes ordered by descending
    /// cardinality, top `limit`. Expensive; callers cache.
    pub fn popular_files(&self, limit: usize) -> Vec<EntryInfo> {
        let fs = self.inner.read().unwrap();
        let mut classes: Vec<&HashSet<EntryId>> = fs.hash_index.values().collect();
        classes.sort_by(|a, b| b.len().cmp(&a.len()));
        classes
            .into_iter()
            .take(limit)
            .filter_map(|set| set.iter().next().map(|&id| fs.snapshot(id)))
            .collect()
    }

    /// Snapshot an entry by id, if it still exists.
    pub fn entry_info(&self, id: EntryId) -> Option<EntryInfo> {
        let fs = self.inner.read().unwrap();
        fs.node(id)?;
        Some(fs.snapshot(id))
    }

    pub fn count_files(&self) -> u64 {
        self.inner.read().unwrap().file_count
    }

    pub fn count_unique_files(&self) -> u64 {
        self.inner.read().unwrap().hash_index.len() as u64
    }

    /// The root's size: total bytes indexed.
    pub fn total_size(&self) -> u64 {
        let fs = self.inner.read().unwrap();
        let root = fs.root;
        fs.node(root).map(|n| n.size).unwrap_or(0)
    }

    /// One representative per hash class, summed. Linear in unique files.
    pub fn unique_size(&self) -> u64 {
        let fs = self.inner.read().unwrap();
        fs.hash_index
            .values()
            .filter_map(|set| set.iter().next())
            .filter_map(|&id| fs.node(id))
            .map(|n| n.size)
            .sum()
    }

    /// Bump the transfer estimate on every download hand-off.
    pub fn increment_sent(&self, bytes: u64) {
        self.estimated_transfer.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn estimated_transfer(&self) -> u64 {
        self.estimated_transfer.load(Ordering::Relaxed)
    }
}

impl FsInner {
    fn node(&self, id: EntryId) -> Option<&EntryNode> {
        self.arena.get(id.0 as usize)?.as_ref()
    }

    /// Panics on stale ids; internal callers validate first.
    fn node_mut(&mut self, id: EntryId) -> &mut EntryNode {
        self.arena[id.0 as usize].as_mut().expect("stale entry id")
    }

    fn alloc(&mut self, node: EntryNode) -> EntryId {
        match self.free.pop() {
            Some(slot) => {
                self.arena[slot as usize] = Some(node);
                EntryId(slot)
            }
            None => {
                self.arena.push(Some(node));
                EntryId((self.arena.len() - 1) as u32)
            }
        }
    }

    /// Create a child entry and index it. Does not touch parent
    /// aggregates; importers maintain those on the way up.
    fn create_entry(
        &mut self,
        parent: EntryId,
        name: String,
        hash: Option<FileHash>,
        size: u64,
        link_count: u32,
        share: Option<u64>,
    ) -> EntryId {
        let id = self.alloc(EntryNode {
            name: name.clone(),
            size,
            link_count,
            hash,
            share,
            parent: Some(parent),
            children: HashMap::new(),
        });
        self.node_mut(parent).children.insert(name.clone(), id);
        if let Some(hash) = hash {
            self.hash_index.entry(hash).or_default().insert(id);
            self.file_count += 1;
        }
        self.add_name_index(id, &name);
        id
    }

    /// Import an item's children under `parent`, returning the total
    /// file size imported.
    fn import_children(&mut self, item: &Item, parent: EntryId, share_uid: u64) -> u64 {
        let Some(children) = &item.children else {
            return 0;
        };
        let mut size_acc = 0u64;
        let mut links_acc = 0u32;
        for child in children.values() {
            match &child.hash {
                None => {
                    let dir = self.create_entry(
                        parent,
                        child.name.clone(),
                        None,
                        0,
                        2,
                        Some(share_uid),
                    );
                    size_acc += self.import_children(child, dir, share_uid);
                    links_acc += 1;
                }
                Some(hash) => {
                    if child.hash_version != FILE_DIGEST_VERSION {
                        continue;
                    }
                    self.create_entry(
                        parent,
                        child.name.clone(),
                        Some(*hash),
                        child.size,
                        1,
                        Some(share_uid),
                    );
                    size_acc += child.size;
                }
            }
        }
        let node = self.node_mut(parent);
        node.link_count += links_acc;
        node.size += size_acc;
        size_acc
    }

    /// Erase an entry and its whole subtree from the tree and both
    /// indices. Parent aggregates are the caller's business.
    fn erase(&mut self, id: EntryId) {
        let Some(node) = self.node(id) else { return };
        let name = node.name.clone();
        let parent = node.parent;
        let hash = node.hash;
        let children: Vec<EntryId> = node.children.values().copied().collect();

        if let Some(parent) = parent {
            if self.node(parent).is_some() {
                self.node_mut(parent).children.remove(&name);
            }
        }
        self.remove_name_index(id, &name);
        match hash {
            None => {
                for child in children {
                    // Children only detach from this (dying) node.
                    self.erase(child);
                }
            }
            Some(hash) => {
                if let Some(set) = self.hash_index.get_mut(&hash) {
                    set.remove(&id);
                    if set.is_empty() {
                        self.hash_index.remove(&hash);
                    }
                }
                self.file_count -= 1;
            }
        }
        self.arena[id.0 as usize] = None;
        self.free.push(id.0);
    }

    fn add_name_index(&mut self, id: EntryId, name: &str) {
        for word in keywords(name) {
            self.name_index.entry(word).or_default().insert(id);
        }
    }

    fn remove_name_index(&mut self, id: EntryId, name: &str) {
        for word in keywords(name) {
            if let Some(set) = self.name_index.get_mut(&word) {
                set.remove(&id);
                if set.is_empty() {
                    self.name_index.remove(&word);
                }
            }
        }
    }

    fn resolve(&self, path: &str) -> Option<EntryId> {
        let mut id = self.root;
        for segment in path.split('/') {
            if segment.is_empty() {
                continue;
            }
            id = *self.node(id)?.children.get(segment)?;
        }
        Some(id)
    }

    fn build_path(&self, id: EntryId) -> String {
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(node) = self.node(current) else { break };
            if node.parent.is_some() {
                segments.push(node.name.clone());
            }
            cursor = node.parent;
        }
        segments.reverse();
        segments.join("/")
    }

    fn snapshot(&self, id: EntryId) -> EntryInfo {
        let node = self.node(id).expect("snapshot of stale id");
        EntryInfo {
            name: node.name.clone(),
            size: node.size,
            link_count: node.link_count,
            hash: node.hash,
            share: node.share,
            path: self.build_path(id),
        }
    }
}
