//! Atomic state persistence: sibling-rename writes and a debounced saver.
//!
//! Every persisted artifact (file lists, download queue, peer stats) is
//! written to `<name>.working` and renamed over the live file, so an
//! interrupted save leaves the previous state intact.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::protocol::constants::WORKING_SUFFIX;

/// Path of the working sibling for a target file.
pub fn working_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(WORKING_SUFFIX);
    target.with_file_name(name)
}

/// Write bytes to the working sibling, then move it over the target.
pub fn save_atomic(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let working = working_path(target);
    match fs::remove_file(&working) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    {
        let mut file = fs::File::create(&working)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    match fs::remove_file(target) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::rename(&working, target)
}

/// A debounced saver: callers signal dirtiness as often as they like and
/// the state is written at most once per interval, plus once at shutdown.
pub struct SafeSaver {
    dirty: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    notify: Arc<Notify>,
    save: Arc<dyn Fn() + Send + Sync>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SafeSaver {
    /// Spawn the saver loop. `save` runs on a blocking thread.
    pub fn new(min_interval: Duration, save: Arc<dyn Fn() + Send + Sync>) -> Arc<SafeSaver> {
        let saver = Arc::new(SafeSaver {
            dirty: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(true)),
            notify: Arc::new(Notify::new()),
            save,
            task: std::sync::Mutex::new(None),
        });

        let dirty = saver.dirty.clone();
        let running = saver.running.clone();
        let notify = saver.notify.clone();
        let save_fn = saver.save.clone();
        let task = tokio::spawn(async move {
            while running.load(Ordering::Acquire) {
                notify.notified().await;
                if !running.load(Ordering::Acquire) {
                    break;
                }
                // Let rapid-fire requests coalesce into one write.
                tokio::time::sleep(min_interval).await;
                if dirty.swap(false, Ordering::AcqRel) {
                    let save_fn = save_fn.clone();
                    if tokio::task::spawn_blocking(move || save_fn()).await.is_err() {
                        warn!("saver task panicked");
                    }
                }
            }
        });
        *saver.task.lock().unwrap() = Some(task);
        saver
    }

    /// Mark the state dirty; a save will happen within one interval.
    pub fn request_save(&self) {
        self.dirty.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Stop the loop and flush any pending state synchronously.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        self.notify.notify_one();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if self.dirty.swap(false, Ordering::AcqRel) {
            let save_fn = self.save.clone();
            let _ = tokio::task::spawn_blocking(move || save_fn()).await;
        }
    }
}
