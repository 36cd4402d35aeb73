//! The statistics page: expensive to build, so cached and regenerated
//! at most once per interval; a request during regeneration is served
//! the previous page.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use xml::writer::{EmitterConfig, EventWriter, XmlEvent};

use crate::http::parse::url_encode;

use super::filesystem::Filesystem;
use super::peers::PeerRegistry;

pub(crate) struct StatsCache {
    cache_for: Duration,
    cached: Mutex<String>,
    last_generated: Mutex<Option<Instant>>,
    generating: AtomicBool,
}

impl StatsCache {
    pub fn new(cache_for: Duration) -> Arc<StatsCache> {
        Arc::new(StatsCache {
            cache_for,
            cached: Mutex::new(String::new()),
            last_generated: Mutex::new(None),
            generating: AtomicBool::new(false),
        })
    }

    /// Return the cached page, kicking off a background regeneration if
    /// it has gone stale. A second request while one is running simply
    /// gets the old page.
    pub fn page(self: &Arc<Self>, generator: impl FnOnce() -> String + Send + 'static) -> String {
        let stale = self
            .last_generated
            .lock()
            .unwrap()
            .map_or(true, |at| at.elapsed() > self.cache_for);
        if stale && !self.generating.swap(true, Ordering::SeqCst) {
            let cache = self.clone();
            tokio::task::spawn_blocking(move || {
                let page = generator();
                *cache.cached.lock().unwrap() = page;
                *cache.last_generated.lock().unwrap() = Some(Instant::now());
                cache.generating.store(false, Ordering::SeqCst);
            });
        }
        self.cached.lock().unwrap().clone()
    }
}

/// Build the stats document from live counters.
pub(crate) fn build_stats_page(
    fs: &Filesystem,
    registry: &PeerRegistry,
    our_alias: &str,
    started_unix_ms: u64,
) -> String {
    let mut buf = Vec::new();
    {
        let mut w = EmitterConfig::new().perform_indent(true).create_writer(&mut buf);
        let _ = w.write(XmlEvent::start_element("fs2-stats").attr("indexnode", our_alias));

        let _ = w.write(XmlEvent::start_element("general"));
        stat(&mut w, "indexnode-started", started_unix_ms.to_string());
        stat(&mut w, "file-count", fs.count_files().to_string());
        stat(&mut w, "unique-file-count", fs.count_unique_files().to_string());
        stat(&mut w, "total-size", fs.total_size().to_string());
        stat(&mut w, "total-unique-size", fs.unique_size().to_string());
        stat(&mut w, "total-transfer", fs.estimated_transfer().to_string());
        stat(&mut w, "client-count", registry.peer_count().to_string());
        let _ = w.write(XmlEvent::end_element());

        // Clients by descending total share size.
        let mut clients = registry.client_summaries();
        clients.sort_by(|a, b| b.1.cmp(&a.1));
        let _ = w.write(XmlEvent::start_element("clients"));
        for (alias, size, avatar) in clients {
            let size = size.to_string();
            let mut element = XmlEvent::start_element("client")
                .attr("alias", &alias)
                .attr("size", &size);
            if !avatar.is_empty() {
                element = element.attr("fs2-avatarhash", &avatar);
            }
            let _ = w.write(element);
            let _ = w.write(XmlEvent::end_element());
        }
        let _ = w.write(XmlEvent::end_element());

        let _ = w.write(XmlEvent::start_element("popular-files"));
        for entry in fs.popular_files(100) {
            let size = entry.size.to_string();
            let hash = entry.hash.map(|h| h.to_hex()).unwrap_or_default();
            let href = format!("/download/{}", hash);
            let path: String = entry
                .path
                .split('/')
                .map(url_encode)
                .collect::<Vec<_>>()
                .join("/");
            let _ = w.write(
                XmlEvent::start_element("entry")
                    .attr("name", &entry.name)
                    .attr("fs2-size", &size)
                    .attr("fs2-hash", &hash)
                    .attr("fs2-path", &path)
                    .attr("href", &href),
            );
            let _ = w.write(XmlEvent::end_element());
        }
        let _ = w.write(XmlEvent::end_element());

        let _ = w.write(XmlEvent::end_element());
    }
    String::from_utf8(buf).unwrap_or_default()
}

fn stat(w: &mut EventWriter<&mut Vec<u8>>, id: &str, value: String) {
    let _ = w.write(XmlEvent::start_element("stat").attr("id", id).attr("value", &value));
    let _ = w.write(XmlEvent::end_element());
}
