//! The share engine: every exported directory tree gets a persisted
//! file list, built once and then incrementally refreshed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::data::saver::save_atomic;
use crate::data::volumes::VolumePools;
use crate::protocol::constants::{FILELIST_EXTENSION, FILE_DIGEST_VERSION, INCOMPLETE_SUFFIX};
use crate::protocol::error::Fs2Error;
use crate::protocol::types::ShareType;
use crate::resilience::bandwidth::TokenBucket;
use crate::wire::filelist::{FileList, Item};
use crate::wire::xml::ManifestShare;

use super::digest::digest_file;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareStatus {
    /// First ever walk; the list is not valid yet.
    Building,
    Refreshing,
    Active,
    Saving,
    Error,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCause {
    /// The shared directory is missing on disk.
    NotFound,
    /// The list could not be persisted.
    Unsaveable,
    Other,
}

/// One exported share.
pub struct Share {
    name: String,
    location: PathBuf,
    canonical: Mutex<PathBuf>,
    list_path: PathBuf,
    list: Mutex<FileList>,
    status: Mutex<ShareStatus>,
    error: Mutex<Option<(ErrorCause, String)>>,
    refresh_active: AtomicBool,
    stop: AtomicBool,
}

impl Share {
    /// Load a share, reading any previously saved list. A saved list
    /// whose internal name disagrees with the share name self-heals.
    pub(crate) fn load(
        name: &str,
        location: PathBuf,
        filelists_dir: &Path,
    ) -> Result<Arc<Share>, Fs2Error> {
        let canonical = location
            .canonicalize()
            .map_err(|e| Fs2Error::InvalidInput(format!("{}: {}", location.display(), e)))?;
        let list_path = filelists_dir.join(format!("{}{}", name, FILELIST_EXTENSION));

        let mut list = match fs::read(&list_path) {
            Ok(bytes) => match FileList::decode(&bytes) {
                Ok(list) => list,
                Err(e) => {
                    warn!(share = name, error = %e, "saved file list unreadable, rebuilding");
                    FileList::new(name)
                }
            },
            Err(_) => FileList::new(name),
        };

        if list.name() != name {
            info!(share = name, "file list internal name mismatch, healing");
            list.root.name = name.to_string();
            if let Err(e) = save_atomic(&list_path, &list.encode()) {
                warn!(share = name, error = %e, "could not heal file list");
            }
        }

        let status = if list.revision == 0 {
            ShareStatus::Building
        } else {
            ShareStatus::Active
        };

        Ok(Arc::new(Share {
            name: name.to_string(),
            location,
            canonical: Mutex::new(canonical),
            list_path,
            list: Mutex::new(list),
            status: Mutex::new(status),
            error: Mutex::new(None),
            refresh_active: AtomicBool::new(false),
            stop: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn status(&self) -> ShareStatus {
        *self.status.lock().unwrap()
    }

    pub fn error_cause(&self) -> Option<(ErrorCause, String)> {
        self.error.lock().unwrap().clone()
    }

    pub fn revision(&self) -> u32 {
        self.list.lock().unwrap().revision
    }

    pub fn size(&self) -> u64 {
        self.list.lock().unwrap().root.size
    }

    pub fn file_count(&self) -> u64 {
        self.list.lock().unwrap().root.file_count
    }

    /// Unix millis of the last completed refresh.
    pub fn last_refreshed(&self) -> u64 {
        self.list.lock().unwrap().last_refreshed
    }

    /// A clone of the current list (for serving the XML flavor).
    pub fn list_snapshot(&self) -> FileList {
        self.list.lock().unwrap().clone()
    }

    pub fn list_path(&self) -> &Path {
        &self.list_path
    }

    /// The canonical share root; downloads must stay inside it.
    pub fn canonical_root(&self) -> PathBuf {
        self.canonical.lock().unwrap().clone()
    }

    fn set_status(&self, status: ShareStatus) {
        let mut current = self.status.lock().unwrap();
        if *current == status {
            return;
        }
        *current = status;
        info!(share = %self.name, ?status, "share status");
    }

    fn set_error(&self, cause: ErrorCause, description: String) {
        *self.error.lock().unwrap() = Some((cause, description));
        self.set_status(ShareStatus::Error);
    }

    /// Ask an in-flight refresh to stop at its next directory boundary
    /// and mark the share dead.
    pub(crate) fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        self.set_status(ShareStatus::Shutdown);
    }

    /// Walk the tree and bring the list up to date. Blocking; run on a
    /// worker thread under the owning volume's permit. Returns true if
    /// the refresh completed (changed or not).
    pub(crate) fn run_refresh(&self, hash_bucket: &TokenBucket) -> bool {
        if self.status() == ShareStatus::Shutdown {
            return false;
        }
        let first_build = self.revision() == 0;
        self.set_status(if first_build {
            ShareStatus::Building
        } else {
            ShareStatus::Refreshing
        });

        if !self.location.exists() {
            warn!(share = %self.name, path = %self.location.display(), "share missing on disk");
            self.set_error(ErrorCause::NotFound, "not found on disk".to_string());
            return false;
        }
        let canonical = match self.location.canonicalize() {
            Ok(canonical) => canonical,
            Err(e) => {
                self.set_error(ErrorCause::NotFound, e.to_string());
                return false;
            }
        };
        *self.canonical.lock().unwrap() = canonical.clone();

        // Walk against a working copy so a cancelled refresh leaves the
        // live list untouched.
        let mut root = self.list.lock().unwrap().root.clone();
        let mut walker = Refresher {
            canonical_root: canonical.clone(),
            bucket: hash_bucket,
            stop: &self.stop,
            changed: 0,
        };
        walker.refresh_directory(&canonical, &mut root);
        if self.stop.load(Ordering::Acquire) {
            return false;
        }

        let changed = walker.changed > 0;
        {
            let mut list = self.list.lock().unwrap();
            list.root = root;
            if changed {
                list.revision += 1;
            }
            list.last_refreshed = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            info!(
                share = %self.name,
                revision = list.revision,
                changed = walker.changed,
                "refresh walked"
            );
        }

        self.set_status(ShareStatus::Saving);
        let encoded = self.list.lock().unwrap().encode();
        match save_atomic(&self.list_path, &encoded) {
            Ok(()) => {
                *self.error.lock().unwrap() = None;
                self.set_status(ShareStatus::Active);
                true
            }
            Err(e) => {
                warn!(share = %self.name, error = %e, "file list unsaveable");
                self.set_error(ErrorCause::Unsaveable, e.to_string());
                false
            }
        }
    }
}

/// One refresh pass over a share's directory tree.
struct Refresher<'a> {
    canonical_root: PathBuf,
    bucket: &'a TokenBucket,
    stop: &'a AtomicBool,
    changed: u64,
}

impl Refresher<'_> {
    /// Should this directory entry be exported at all?
    fn accept(&self, path: &Path, file_name: &str) -> bool {
        if file_name.ends_with(INCOMPLETE_SUFFIX) {
            return false;
        }
        let Ok(meta) = fs::symlink_metadata(path) else {
            return false;
        };
        if meta.file_type().is_symlink() {
            // Symlinked directories and links escaping the share root
            // would let a peer walk out of the export.
            match path.canonicalize() {
                Ok(real) => {
                    if real.is_dir() || !real.starts_with(&self.canonical_root) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        let hidden = file_name.starts_with('.');
        if hidden && !path.is_dir() {
            return false;
        }
        true
    }

    fn refresh_directory(&mut self, directory: &Path, item: &mut Item) {
        let mut children = item.children.take().unwrap_or_default();
        let mut vanished: std::collections::HashSet<String> =
            children.keys().cloned().collect();

        let reader = match fs::read_dir(directory) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(dir = %directory.display(), error = %e, "cannot read directory");
                item.children = Some(children);
                return;
            }
        };

        for entry in reader.flatten() {
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let path = entry.path();
            if !self.accept(&path, &name) {
                continue;
            }

            if vanished.remove(&name) {
                let existing = children.get_mut(&name).expect("tracked child");
                if !self.update_item(&path, existing) {
                    children.remove(&name);
                    self.changed += 1;
                }
            } else {
                let Ok(meta) = fs::metadata(&path) else { continue };
                let mut fresh = if meta.is_dir() {
                    Item::new_directory(name.clone())
                } else if meta.is_file() {
                    Item {
                        name: name.clone(),
                        size: 0,
                        last_modified: 0,
                        hash_version: 0,
                        hash: None,
                        file_count: 0,
                        children: None,
                    }
                } else {
                    continue;
                };
                if self.update_item(&path, &mut fresh) {
                    self.changed += 1;
                    children.insert(name, fresh);
                }
            }
        }

        // Anything we tracked but did not see has left the filesystem.
        for name in vanished {
            children.remove(&name);
            self.changed += 1;
        }

        // Aggregates on the way up.
        item.size = children.values().map(|c| c.size).sum();
        item.file_count = children.values().map(|c| c.file_count).sum();
        item.children = Some(children);
    }

    /// Returns false if the item could not be brought up to date and
    /// should not be listed.
    fn update_item(&mut self, path: &Path, item: &mut Item) -> bool {
        let Ok(meta) = fs::metadata(path) else {
            return false;
        };

        if meta.is_dir() {
            if item.hash.is_some() {
                // A file was replaced by a directory of the same name.
                *item = Item::new_directory(item.name.clone());
            }
            self.refresh_directory(path, item);
            return true;
        }
        if !meta.is_file() {
            return false;
        }

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut should_hash = item.hash.is_none();
        if item.size != meta.len() {
            should_hash = true;
            item.size = meta.len();
        }
        if item.last_modified != mtime {
            should_hash = true;
            item.last_modified = mtime;
        }
        if item.hash_version != FILE_DIGEST_VERSION {
            should_hash = true;
            item.hash_version = FILE_DIGEST_VERSION;
        }
        item.children = None;
        item.file_count = 1;

        if should_hash {
            self.changed += 1;
            match digest_file(path, self.bucket) {
                Ok(hash) => item.hash = Some(hash),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "could not hash");
                    return false;
                }
            }
        }
        true
    }
}

/// All shares of one client plus their refresh machinery.
pub(crate) struct ShareEngine {
    shares: Mutex<Vec<Arc<Share>>>,
    volumes: Arc<VolumePools>,
    hash_bucket: Arc<TokenBucket>,
    filelists_dir: PathBuf,
    auto_refresh: Duration,
    /// Fired after any completed refresh or share set change.
    on_change: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl ShareEngine {
    pub fn new(
        filelists_dir: PathBuf,
        hash_bucket: Arc<TokenBucket>,
        auto_refresh: Duration,
    ) -> std::io::Result<Arc<ShareEngine>> {
        fs::create_dir_all(&filelists_dir)?;
        Ok(Arc::new(ShareEngine {
            shares: Mutex::new(Vec::new()),
            volumes: VolumePools::new(),
            hash_bucket,
            filelists_dir,
            auto_refresh,
            on_change: OnceLock::new(),
        }))
    }

    pub fn set_change_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        let _ = self.on_change.set(Box::new(listener));
    }

    fn notify_changed(&self) {
        if let Some(listener) = self.on_change.get() {
            listener();
        }
    }

    pub fn filelists_dir(&self) -> &Path {
        &self.filelists_dir
    }

    /// Export a directory under a unique name and kick off its first
    /// build (or a refresh of a recovered list).
    pub fn add_share(self: &Arc<Self>, name: &str, location: PathBuf) -> Result<(), Fs2Error> {
        if name.is_empty() {
            return Err(Fs2Error::InvalidInput("empty share name".to_string()));
        }
        if self.share_named(name).is_some() {
            return Err(Fs2Error::InvalidInput(format!(
                "share name '{}' already exists",
                name
            )));
        }
        let share = Share::load(name, location, &self.filelists_dir)?;
        self.shares.lock().unwrap().push(share.clone());
        info!(share = name, "share added");
        self.schedule_refresh(&share);
        self.notify_changed();
        Ok(())
    }

    pub fn remove_share(self: &Arc<Self>, name: &str) -> bool {
        let removed = {
            let mut shares = self.shares.lock().unwrap();
            let before = shares.len();
            shares.retain(|share| {
                if share.name() == name {
                    share.shutdown();
                    false
                } else {
                    true
                }
            });
            before != shares.len()
        };
        if removed {
            self.notify_changed();
        }
        removed
    }

    pub fn share_named(&self, name: &str) -> Option<Arc<Share>> {
        self.shares
            .lock()
            .unwrap()
            .iter()
            .find(|share| share.name() == name)
            .cloned()
    }

    pub fn all_shares(&self) -> Vec<Arc<Share>> {
        self.shares.lock().unwrap().clone()
    }

    /// The manifest served from `/ping`: every share whose list is
    /// currently valid.
    pub fn manifest(&self) -> Vec<ManifestShare> {
        self.all_shares()
            .iter()
            .filter(|share| {
                !matches!(share.status(), ShareStatus::Building | ShareStatus::Error)
            })
            .map(|share| ManifestShare {
                name: share.name().to_string(),
                revision: share.revision(),
                share_type: ShareType::FileList,
            })
            .collect()
    }

    /// Queue a walk unless one is already queued or running.
    pub fn schedule_refresh(self: &Arc<Self>, share: &Arc<Share>) {
        if share.status() == ShareStatus::Shutdown {
            return;
        }
        if share.refresh_active.swap(true, Ordering::SeqCst) {
            return;
        }
        let engine = self.clone();
        let share = share.clone();
        tokio::spawn(async move {
            let _permit = engine.volumes.acquire(share.location()).await;
            let bucket = engine.hash_bucket.clone();
            let walked = {
                let share = share.clone();
                tokio::task::spawn_blocking(move || share.run_refresh(&bucket))
                    .await
                    .unwrap_or(false)
            };
            share.refresh_active.store(false, Ordering::SeqCst);
            if walked {
                engine.notify_changed();
            }
        });
    }

    pub fn refresh_all(self: &Arc<Self>) {
        for share in self.all_shares() {
            self.schedule_refresh(&share);
        }
    }

    /// Consider-refresh tick: schedule shares whose last completed
    /// refresh is older than the auto-refresh interval.
    pub fn refresh_overdue(self: &Arc<Self>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        for share in self.all_shares() {
            if matches!(
                share.status(),
                ShareStatus::Refreshing | ShareStatus::Building | ShareStatus::Saving
            ) {
                continue;
            }
            let due = share.last_refreshed() + self.auto_refresh.as_millis() as u64;
            if now >= due {
                self.schedule_refresh(&share);
            }
        }
    }

    pub fn shutdown(&self) {
        for share in self.all_shares() {
            share.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(path: &Path, content: &[u8]) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::File::create(path).unwrap().write_all(content).unwrap();
    }

    fn walk(share: &Arc<Share>) -> bool {
        share.run_refresh(&TokenBucket::new(0))
    }

    fn engine(dir: &Path) -> Arc<ShareEngine> {
        ShareEngine::new(
            dir.join("filelists"),
            Arc::new(TokenBucket::new(0)),
            Duration::from_secs(3600),
        )
        .unwrap()
    }

    #[test]
    fn first_build_lists_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("a.txt"), b"aaa");
        write_file(&root.join("sub/b.txt"), b"bbbb");

        let share = Share::load("stuff", root, dir.path()).unwrap();
        assert_eq!(share.status(), ShareStatus::Building);
        assert!(walk(&share));

        assert_eq!(share.status(), ShareStatus::Active);
        assert_eq!(share.revision(), 1);
        assert_eq!(share.file_count(), 2);
        assert_eq!(share.size(), 7);
        assert!(share.list_path().exists());

        let list = share.list_snapshot();
        let sub = &list.root.children.as_ref().unwrap()["sub"];
        assert_eq!(sub.file_count, 1);
        assert!(sub.children.as_ref().unwrap()["b.txt"].hash.is_some());
    }

    #[test]
    fn unchanged_refresh_keeps_revision() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("a.txt"), b"aaa");
        let share = Share::load("stuff", root, dir.path()).unwrap();
        assert!(walk(&share));
        let hash_before = share.list_snapshot().root.children.as_ref().unwrap()["a.txt"].hash;
        assert_eq!(share.revision(), 1);
        assert!(walk(&share));
        assert_eq!(share.revision(), 1, "no change, no revision bump");
        let hash_after = share.list_snapshot().root.children.as_ref().unwrap()["a.txt"].hash;
        assert_eq!(hash_before, hash_after, "unchanged files keep their hash");
    }

    #[test]
    fn changes_bump_revision_and_rehash() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        let file = root.join("a.txt");
        write_file(&file, b"aaa");
        let share = Share::load("stuff", root.clone(), dir.path()).unwrap();
        assert!(walk(&share));
        let first = share.list_snapshot().root.children.as_ref().unwrap()["a.txt"].hash;

        write_file(&file, b"aaaa");
        write_file(&root.join("new.txt"), b"n");
        assert!(walk(&share));
        assert_eq!(share.revision(), 2);
        let snap = share.list_snapshot();
        let children = snap.root.children.as_ref().unwrap();
        assert_ne!(children["a.txt"].hash, first, "changed size rehashes");
        assert!(children.contains_key("new.txt"));
        assert_eq!(snap.root.file_count, 2);
    }

    #[test]
    fn vanished_files_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("keep.txt"), b"k");
        write_file(&root.join("gone.txt"), b"g");
        let share = Share::load("stuff", root.clone(), dir.path()).unwrap();
        assert!(walk(&share));
        assert_eq!(share.file_count(), 2);

        fs::remove_file(root.join("gone.txt")).unwrap();
        assert!(walk(&share));
        assert_eq!(share.revision(), 2);
        assert_eq!(share.file_count(), 1);
        assert!(share
            .list_snapshot()
            .root
            .children
            .as_ref()
            .unwrap()
            .contains_key("keep.txt"));
    }

    #[test]
    fn incomplete_and_hidden_files_are_not_exported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("good.txt"), b"g");
        write_file(&root.join("partial.ogg.incomplete"), b"p");
        write_file(&root.join(".hidden"), b"h");
        let share = Share::load("stuff", root, dir.path()).unwrap();
        assert!(walk(&share));
        let snap = share.list_snapshot();
        let children = snap.root.children.as_ref().unwrap();
        assert_eq!(children.len(), 1);
        assert!(children.contains_key("good.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn escaping_symlinks_are_not_exported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        let outside = dir.path().join("outside.txt");
        write_file(&outside, b"secret");
        write_file(&root.join("inside.txt"), b"fine");
        std::os::unix::fs::symlink(&outside, root.join("leak.txt")).unwrap();
        // A symlink inside the root to a sibling file is fine.
        std::os::unix::fs::symlink(root.join("inside.txt"), root.join("alias.txt")).unwrap();

        let share = Share::load("stuff", root, dir.path()).unwrap();
        assert!(walk(&share));
        let snap = share.list_snapshot();
        let children = snap.root.children.as_ref().unwrap();
        assert!(!children.contains_key("leak.txt"));
        assert!(children.contains_key("alias.txt"));
        assert!(children.contains_key("inside.txt"));
    }

    #[test]
    fn saved_list_reloads_and_heals_name() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("a.txt"), b"a");
        {
            let share = Share::load("original", root.clone(), dir.path()).unwrap();
            assert!(walk(&share));
        }
        // Rename on disk: same list file loaded under a new share name.
        let old = dir.path().join(format!("original{}", FILELIST_EXTENSION));
        let renamed = dir.path().join(format!("renamed{}", FILELIST_EXTENSION));
        fs::rename(old, renamed).unwrap();

        let share = Share::load("renamed", root, dir.path()).unwrap();
        assert_eq!(share.list_snapshot().name(), "renamed");
        assert_eq!(share.revision(), 1, "revision survives reload");
        assert_eq!(share.status(), ShareStatus::Active);
    }

    #[test]
    fn missing_location_is_an_error_status() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("a.txt"), b"a");
        let share = Share::load("stuff", root.clone(), dir.path()).unwrap();
        assert!(walk(&share));

        fs::remove_dir_all(&root).unwrap();
        assert!(!walk(&share));
        assert_eq!(share.status(), ShareStatus::Error);
        assert_eq!(share.error_cause().unwrap().0, ErrorCause::NotFound);
    }

    #[test]
    fn shutdown_stops_walks_and_preserves_list() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("a.txt"), b"a");
        let share = Share::load("stuff", root, dir.path()).unwrap();
        assert!(walk(&share));
        share.shutdown();
        assert_eq!(share.status(), ShareStatus::Shutdown);
        assert!(!walk(&share), "shutdown shares never refresh");
        assert_eq!(share.revision(), 1);
    }

    #[tokio::test]
    async fn engine_add_remove_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("a.txt"), b"a");
        let engine = engine(dir.path());

        engine.add_share("stuff", root.clone()).unwrap();
        assert!(engine.add_share("stuff", root.clone()).is_err(), "dup name");
        assert!(engine.add_share("", root).is_err());

        // Wait for the background build.
        let mut built = false;
        for _ in 0..100 {
            if engine.share_named("stuff").unwrap().status() == ShareStatus::Active {
                built = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(built, "share never became active");

        let manifest = engine.manifest();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].name, "stuff");
        assert_eq!(manifest[0].revision, 1);
        assert_eq!(manifest[0].share_type, ShareType::FileList);

        assert!(engine.remove_share("stuff"));
        assert!(!engine.remove_share("stuff"));
        assert!(engine.manifest().is_empty());
    }

    #[tokio::test]
    async fn engine_fires_change_listener_after_build() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("exported");
        write_file(&root.join("a.txt"), b"a");
        let engine = engine(dir.path());
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        engine.set_change_listener(move || {
            flag.store(true, Ordering::SeqCst);
        });
        engine.add_share("stuff", root).unwrap();
        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("change listener never fired");
    }
}
