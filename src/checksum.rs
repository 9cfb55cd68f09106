//! Content digests for transfer integrity checks
//!
//! MD5 is used as a content fingerprint only, never as a credential.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Digest of an in-memory buffer as lowercase hex
pub fn digest_bytes(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Digest everything a reader yields, 64KB at a time
pub fn digest_reader<R: Read>(mut reader: R) -> Result<String> {
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Digest a file on disk
pub fn digest_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {} for checksum", path.display()))?;
    digest_reader(file).with_context(|| format!("checksum {}", path.display()))
}

/// Same as [`digest_file`] but off the async runtime's worker threads
pub async fn digest_file_async(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || digest_file(&path))
        .await
        .context("checksum task panicked")?
}

/// Plain string comparison of two digests
pub fn verify(expected: &str, actual: &str) -> bool {
    expected == actual
}
