//! Protocol constants shared by both roles.

/// Protocol version marker. Peers and adverts carrying a different marker
/// are ignored.
pub const FS2_PROTOCOL_VERSION: &str = "FS2_13";

/// Current file digest algorithm version (blake3 over head + tail + length).
pub const FILE_DIGEST_VERSION: u8 = 1;

/// Width of a file digest in bits.
pub const FILE_DIGEST_BITS: usize = 256;

/// Width of a file digest in bytes.
pub const FILE_DIGEST_BYTES: usize = FILE_DIGEST_BITS / 8;

/// How many bytes from each end of a file contribute to its digest.
pub const FILE_DIGEST_HEAD_FOOT_LENGTH: u64 = 64 * 1024;

/// Lowest port a client may register with.
pub const CLIENT_PORT_MIN: u16 = 1024;

/// Highest port a client may register with.
pub const CLIENT_PORT_MAX: u16 = 65534;

/// UDP port that indexnode adverts are broadcast to.
pub const ADVERTISEMENT_DATAGRAM_PORT: u16 = 42444;

/// Interval between advert datagrams.
pub const INDEXNODE_ADVERTISE_INTERVAL_MS: u64 = 5_000;

/// A capability record expires after five advertise intervals without a
/// refresh.
pub const CAPABILITY_TABLE_DECAY_MS: u64 = 5 * INDEXNODE_ADVERTISE_INTERVAL_MS;

/// How often an indexnode pings each registered peer.
pub const INDEXNODE_PING_INTERVAL_MS: u64 = 60_000;

/// Consecutive ping failures tolerated before a peer is evicted.
pub const MAX_FAILED_LIVENESSES: u32 = 2;

/// Cap on search results streamed out of the index.
pub const INDEXNODE_SEARCH_MAX_RESULTS: usize = 128;

/// The stats page is regenerated at most this often.
pub const INDEXNODE_STATS_CACHE_MS: u64 = 30_000;

/// How often an auto-indexnode client reconsiders whether it should be
/// hosting.
pub const INTERNAL_INDEXNODE_RECONSIDER_MS: u64 = 30_000;

/// Fixed chunk size for multi-source downloads.
pub const DOWNLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Debounce interval for download queue saves.
pub const QUEUE_SAVE_MIN_INTERVAL_MS: u64 = 5_000;

/// Debounce interval for peer stats saves.
pub const PEERSTATS_SAVE_MIN_INTERVAL_MS: u64 = 5_000;

/// How often the share engine looks for shares overdue for a refresh.
pub const SHARE_REFRESH_POLL_INTERVAL_MS: u64 = 60_000;

/// An unused upload slot reservation expires after this long.
pub const UPLOAD_SLOT_EXPIRY_MS: u64 = 30_000;

/// Extension used for saved file lists.
pub const FILELIST_EXTENSION: &str = ".FileList";

/// Suffix for in-progress downloads on disk. Files with this suffix are
/// never exported by the share walker.
pub const INCOMPLETE_SUFFIX: &str = ".incomplete";

/// Suffix for the sibling file used by atomic state saves.
pub const WORKING_SUFFIX: &str = ".working";

/// Capability values are rounded down to this granularity before noise is
/// added.
pub const CAPABILITY_GRANULARITY: u64 = 100_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_width_is_consistent() {
        assert_eq!(FILE_DIGEST_BYTES * 8, FILE_DIGEST_BITS);
        assert_eq!(FILE_DIGEST_BYTES, blake3::OUT_LEN);
    }

    #[test]
    fn port_range_is_sane() {
        assert!(CLIENT_PORT_MIN < CLIENT_PORT_MAX);
        assert!(CLIENT_PORT_MIN >= 1024);
    }

    #[test]
    fn capability_decay_spans_several_adverts() {
        assert_eq!(
            CAPABILITY_TABLE_DECAY_MS,
            5 * INDEXNODE_ADVERTISE_INTERVAL_MS
        );
    }
}
