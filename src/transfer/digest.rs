//! Content digests in the backend's format: base64 of the raw MD5

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;
use tokio::io::AsyncReadExt;

use super::error::{Result, TransferError};
use super::progress::Progress;
use crate::run_state::RunStateWatcher;

/// Incremental digest fed one chunk at a time
pub struct ContentDigest(md5::Context);

impl ContentDigest {
    pub fn new() -> Self {
        Self(md5::Context::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.consume(data);
    }

    pub fn finish(self) -> String {
        STANDARD.encode(self.0.compute().0)
    }
}

impl Default for ContentDigest {
    fn default() -> Self {
        Self::new()
    }
}

pub fn digest_bytes(data: &[u8]) -> String {
    STANDARD.encode(md5::compute(data).0)
}

/// Digest of a local file, read in `chunk_size` pieces
///
/// Bytes hashed so far are published to `progress`; the run-state is checked
/// before every read.
pub async fn hash_file(
    path: &Path,
    chunk_size: usize,
    progress: &Progress,
    run_state: &RunStateWatcher,
) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;

    let mut digest = ContentDigest::new();
    let mut buffer = vec![0u8; chunk_size.max(1)];
    let mut hashed = 0u64;

    loop {
        run_state.ensure_running()?;
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        if read == 0 {
            break;
        }
        digest.update(&buffer[..read]);
        hashed += read as u64;
        progress.set(hashed);
    }

    Ok(digest.finish())
}
