//! The file list: a share's tree of items, with a compact binary codec.
//!
//! Binary layout (`FS2L` version 1), all integers big-endian:
//!
//! ```text
//! magic "FS2L" | version u8 | revision u32 | last_refreshed u64 | root item
//!
//! item: name (u16 len + utf8) | size u64 | last_modified u64
//!     | hash_version u8 | hash_len u8 | hash bytes
//!     | file_count u64 | child_count u32 | children (sorted by name)
//! ```
//!
//! Directories carry `hash_len = 0` and their children; files carry a
//! digest and `child_count = 0`. Encoding is canonical (children in name
//! order), so `encode(decode(bytes)) == bytes` for any list this codec
//! produced.

use std::collections::BTreeMap;

use crate::protocol::constants::FILE_DIGEST_BYTES;
use crate::protocol::error::Fs2Error;
use crate::protocol::types::FileHash;

const MAGIC: &[u8; 4] = b"FS2L";
const FORMAT_VERSION: u8 = 1;

/// Hard cap on a single name, to bound decode allocations.
const MAX_NAME_LEN: usize = 4096;

/// One node in a share's tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub name: String,
    pub size: u64,
    pub last_modified: u64,
    pub hash_version: u8,
    /// Present iff this item is a file.
    pub hash: Option<FileHash>,
    /// Total files in this subtree; 1 for a file.
    pub file_count: u64,
    /// Present iff this item is a directory.
    pub children: Option<BTreeMap<String, Item>>,
}

impl Item {
    pub fn new_directory(name: impl Into<String>) -> Item {
        Item {
            name: name.into(),
            size: 0,
            last_modified: 0,
            hash_version: 0,
            hash: None,
            file_count: 0,
            children: Some(BTreeMap::new()),
        }
    }

    pub fn new_file(
        name: impl Into<String>,
        size: u64,
        last_modified: u64,
        hash_version: u8,
        hash: FileHash,
    ) -> Item {
        Item {
            name: name.into(),
            size,
            last_modified,
            hash_version,
            hash: Some(hash),
            file_count: 1,
            children: None,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.children.is_some()
    }

    /// Insert a child, replacing any existing child of the same name.
    /// Does not maintain aggregates; callers fix those up themselves.
    pub fn insert_child(&mut self, child: Item) {
        self.children
            .get_or_insert_with(BTreeMap::new)
            .insert(child.name.clone(), child);
    }

    /// Recompute `size` and `file_count` through the whole subtree.
    pub fn recompute_aggregates(&mut self) {
        if let Some(children) = &mut self.children {
            let mut size = 0u64;
            let mut files = 0u64;
            for child in children.values_mut() {
                child.recompute_aggregates();
                size += child.size;
                files += child.file_count;
            }
            self.size = size;
            self.file_count = files;
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        let name = self.name.as_bytes();
        out.extend_from_slice(&(name.len() as u16).to_be_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&self.size.to_be_bytes());
        out.extend_from_slice(&self.last_modified.to_be_bytes());
        out.push(self.hash_version);
        match &self.hash {
            Some(h) => {
                out.push(FILE_DIGEST_BYTES as u8);
                out.extend_from_slice(h.as_bytes());
            }
            None => out.push(0),
        }
        out.extend_from_slice(&self.file_count.to_be_bytes());
        match &self.children {
            Some(children) => {
                out.extend_from_slice(&(children.len() as u32).to_be_bytes());
                for child in children.values() {
                    child.encode_into(out);
                }
            }
            None => out.extend_from_slice(&0u32.to_be_bytes()),
        }
    }

    fn decode_from(cur: &mut Cursor<'_>) -> Result<Item, Fs2Error> {
        let name_len = cur.read_u16()? as usize;
        if name_len > MAX_NAME_LEN {
            return Err(Fs2Error::Parse("item name too long".to_string()));
        }
        let name = String::from_utf8(cur.read_bytes(name_len)?.to_vec())
            .map_err(|_| Fs2Error::Parse("item name is not utf8".to_string()))?;
        let size = cur.read_u64()?;
        let last_modified = cur.read_u64()?;
        let hash_version = cur.read_u8()?;
        let hash_len = cur.read_u8()? as usize;
        let hash = if hash_len == 0 {
            None
        } else {
            let bytes = cur.read_bytes(hash_len)?;
            Some(
                FileHash::from_bytes(bytes)
                    .ok_or_else(|| Fs2Error::Parse("bad digest length".to_string()))?,
            )
        };
        let file_count = cur.read_u64()?;
        let child_count = cur.read_u32()? as usize;

        if hash.is_some() && child_count > 0 {
            return Err(Fs2Error::Parse("file item with children".to_string()));
        }

        let children = if hash.is_none() {
            let mut map = BTreeMap::new();
            for _ in 0..child_count {
                let child = Item::decode_from(cur)?;
                map.insert(child.name.clone(), child);
            }
            Some(map)
        } else {
            None
        };

        Ok(Item {
            name,
            size,
            last_modified,
            hash_version,
            hash,
            file_count,
            children,
        })
    }
}

/// A share's file list: its tree plus the revision stamp the indexnode
/// reconciles against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileList {
    pub revision: u32,
    /// Unix millis of the last successful refresh.
    pub last_refreshed: u64,
    pub root: Item,
}

impl FileList {
    /// A fresh, never-refreshed list. Revision zero marks a share that
    /// still needs its first build.
    pub fn new(share_name: impl Into<String>) -> FileList {
        FileList {
            revision: 0,
            last_refreshed: 0,
            root: Item::new_directory(share_name),
        }
    }

    /// The share name is the root item's name.
    pub fn name(&self) -> &str {
        &self.root.name
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&self.revision.to_be_bytes());
        out.extend_from_slice(&self.last_refreshed.to_be_bytes());
        self.root.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<FileList, Fs2Error> {
        let mut cur = Cursor::new(bytes);
        let magic = cur.read_bytes(4)?;
        if magic != MAGIC {
            return Err(Fs2Error::Parse("bad file list magic".to_string()));
        }
        let version = cur.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(Fs2Error::Parse(format!(
                "unsupported file list version {}",
                version
            )));
        }
        let revision = cur.read_u32()?;
        let last_refreshed = cur.read_u64()?;
        let root = Item::decode_from(&mut cur)?;
        if !cur.is_empty() {
            return Err(Fs2Error::Parse("trailing bytes after file list".to_string()));
        }
        Ok(FileList {
            revision,
            last_refreshed,
            root,
        })
    }
}

/// Byte cursor for decoding.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Cursor<'a> {
        Cursor { bytes, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], Fs2Error> {
        if self.bytes.len() - self.pos < n {
            return Err(Fs2Error::Parse("file list truncated".to_string()));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, Fs2Error> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, Fs2Error> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, Fs2Error> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, Fs2Error> {
        let b = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }
}
