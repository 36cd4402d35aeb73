//! Core value types: file digests and search keywords.

use crate::protocol::constants::FILE_DIGEST_BYTES;

/// A fixed-width content digest identifying "same content" across peers.
///
/// Directories carry no hash at all; a `FileHash` always belongs to a file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHash(pub [u8; FILE_DIGEST_BYTES]);

impl FileHash {
    /// Parse a digest from lowercase or uppercase hex. The length must
    /// match the protocol digest width exactly.
    pub fn from_hex(s: &str) -> Option<FileHash> {
        if s.len() != FILE_DIGEST_BYTES * 2 {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        let mut out = [0u8; FILE_DIGEST_BYTES];
        out.copy_from_slice(&bytes);
        Some(FileHash(out))
    }

    /// Parse a digest from raw bytes, rejecting any other length.
    pub fn from_bytes(b: &[u8]) -> Option<FileHash> {
        if b.len() != FILE_DIGEST_BYTES {
            return None;
        }
        let mut out = [0u8; FILE_DIGEST_BYTES];
        out.copy_from_slice(b);
        Some(FileHash(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FileHash({})", &self.to_hex()[..8])
    }
}

/// Type of a file list a peer exports for one of its shares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareType {
    /// Legacy XML rendering
    Xml,
    /// Compact binary rendering
    FileList,
}

impl ShareType {
    /// Extension for the wire path of this flavor.
    pub fn extension(&self) -> &'static str {
        match self {
            ShareType::Xml => ".xml",
            ShareType::FileList => crate::protocol::constants::FILELIST_EXTENSION,
        }
    }

    /// Parse the manifest `type` attribute. Unknown values fall back to XML,
    /// which every client can produce.
    pub fn from_manifest(s: &str) -> ShareType {
        if s.eq_ignore_ascii_case("filelist") {
            ShareType::FileList
        } else {
            ShareType::Xml
        }
    }
}

/// Split a name or query into search keywords: lower-case, then split on
/// anything that is not alphanumeric. Empty fragments are dropped.
///
/// This is the single keywording rule used by both the index and the
/// search surface, so a file is findable by exactly the words its name
/// produces here.
pub fn keywords(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_hex_round_trip() {
        let h = FileHash([0xabu8; FILE_DIGEST_BYTES]);
        let hex = h.to_hex();
        assert_eq!(hex.len(), FILE_DIGEST_BYTES * 2);
        assert_eq!(FileHash::from_hex(&hex), Some(h));
    }

    #[test]
    fn hash_rejects_wrong_length() {
        assert_eq!(FileHash::from_hex("abcd"), None);
        assert_eq!(FileHash::from_bytes(&[1, 2, 3]), None);
        // Right length but not hex.
        let junk = "zz".repeat(FILE_DIGEST_BYTES);
        assert_eq!(FileHash::from_hex(&junk), None);
    }

    #[test]
    fn keywords_lowercase_and_split() {
        assert_eq!(keywords("Foo Bar.txt"), vec!["foo", "bar", "txt"]);
        assert_eq!(keywords("a_b-c"), vec!["a", "b", "c"]);
        assert_eq!(keywords("...---..."), Vec::<String>::new());
    }

    #[test]
    fn keywords_keep_digits() {
        assert_eq!(keywords("track01 (remix)"), vec!["track01", "remix"]);
    }

    #[test]
    fn share_type_from_manifest() {
        assert_eq!(ShareType::from_manifest("FileList"), ShareType::FileList);
        assert_eq!(ShareType::from_manifest("filelist"), ShareType::FileList);
        assert_eq!(ShareType::from_manifest("xml"), ShareType::Xml);
        assert_eq!(ShareType::from_manifest("anything"), ShareType::Xml);
    }
}
