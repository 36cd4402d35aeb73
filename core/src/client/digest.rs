//! The FS2 file digest: hash of the file's head and tail plus its
//! decimal length.
//!
//! Hashing every byte of large shares is prohibitive, so the digest
//! covers `file[0..C] ‖ file[len-C..len] ‖ decimal-ascii(len)`; a file
//! shorter than `2C` contributes its whole content instead of head and
//! tail. The digest depends only on content and length, never on
//! filesystem metadata.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::protocol::constants::FILE_DIGEST_HEAD_FOOT_LENGTH;
use crate::protocol::types::FileHash;
use crate::resilience::bandwidth::TokenBucket;

/// Digest a file, draining the hashing bucket for every byte read.
/// Blocking; called from walker threads.
pub fn digest_file(path: &Path, bucket: &TokenBucket) -> std::io::Result<FileHash> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let crop = FILE_DIGEST_HEAD_FOOT_LENGTH;

    let mut hasher = blake3::Hasher::new();
    if len < crop * 2 {
        hash_span(&mut file, &mut hasher, len, bucket)?;
    } else {
        hash_span(&mut file, &mut hasher, crop, bucket)?;
        file.seek(SeekFrom::Start(len - crop))?;
        hash_span(&mut file, &mut hasher, crop, bucket)?;
    }
    hasher.update(len.to_string().as_bytes());

    Ok(FileHash(*hasher.finalize().as_bytes()))
}

fn hash_span(
    file: &mut File,
    hasher: &mut blake3::Hasher,
    mut remaining: u64,
    bucket: &TokenBucket,
) -> std::io::Result<()> {
    let mut buf = [0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let got = file.read(&mut buf[..want])?;
        if got == 0 {
            break;
        }
        bucket.acquire_blocking(got as u64);
        hasher.update(&buf[..got]);
        remaining -= got as u64;
    }
    Ok(())
}
