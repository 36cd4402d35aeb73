//! Per-volume refresh permits.
//!
//! Share refreshes walk and hash whole directory trees; running two of
//! them against the same spinning disk thrashes it. Each filesystem
//! volume gets one permit, created on demand as shares on new mounts
//! appear, so refreshes serialise per disk while distinct disks proceed
//! in parallel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Default)]
pub struct VolumePools {
    pools: Mutex<HashMap<u64, Arc<Semaphore>>>,
}

impl VolumePools {
    pub fn new() -> Arc<VolumePools> {
        Arc::new(VolumePools::default())
    }

    /// Stable identifier for the volume holding `path`. Unknown paths
    /// share volume zero rather than failing.
    fn volume_id(path: &Path) -> u64 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            std::fs::metadata(path).map(|m| m.dev()).unwrap_or(0)
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            0
        }
    }

    /// Wait for this volume's permit.
    pub async fn acquire(&self, path: &Path) -> OwnedSemaphorePermit {
        let semaphore = {
            let mut pools = self.pools.lock().unwrap();
            pools
                .entry(Self::volume_id(path))
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed.
        semaphore.acquire_owned().await.expect("volume pool closed")
    }

    #[cfg(test)]
    fn tracked_volumes(&self) -> usize {
        self.pools.lock().unwrap().len()
    }
}
