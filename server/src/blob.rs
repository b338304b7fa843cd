//! Content-addressed blob pool.
//!
//! Large ciphertext objects (file and thumbnail bodies) are stored by the
//! hex SHA-256 of their content under `blobs/<2 hex>/<digest>`. Identical
//! content dedups to one file. Reference counts live in an encrypted record
//! of the object store (`blobs/refcount.dat`) and are adjusted inside the
//! same transaction that adds or removes the referencing file entries; the
//! blob file itself is unlinked only after that transaction commits.

use crate::error::{ApiError, ApiResult};
use log::warn;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Name of the refcount record in the object store.
pub const REFCOUNT_FILE: &str = "blobs/refcount.dat";

const PUT_CHUNK: usize = 64 * 1024;

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct RefCounts {
    pub counts: BTreeMap<String, i64>,
}

impl RefCounts {
    pub fn get(&self, blob_id: &str) -> i64 {
        self.counts.get(blob_id).copied().unwrap_or(0)
    }

    /// Adjust a blob's count by `delta` (may be negative) and return the new
    /// count. A count of zero drops the entry; the caller unlinks the blob
    /// after its transaction commits.
    pub fn bump(&mut self, blob_id: &str, delta: i64) -> i64 {
        let count = self.get(blob_id) + delta;
        if count <= 0 {
            if count < 0 {
                warn!("refcount for blob {} fell to {}", blob_id, count);
            }
            self.counts.remove(blob_id);
            return 0;
        }
        self.counts.insert(blob_id.to_string(), count);
        count
    }
}

pub struct BlobPool {
    root: PathBuf,
}

impl BlobPool {
    pub fn open<P: Into<PathBuf>>(root: P) -> ApiResult<BlobPool> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(BlobPool { root })
    }

    /// Stream `reader` into the pool and return the content digest. The data
    /// goes to a temp file first, so a crash never leaves a partial blob
    /// under its final name; duplicates of existing content are discarded.
    pub fn put<R: Read>(&self, reader: &mut R) -> ApiResult<String> {
        let nonce: [u8; 8] = thread_rng().gen();
        let temp = self.root.join(format!("put-{}.tmp", hex::encode(nonce)));

        let mut hasher = Sha256::new();
        let mut out = File::create(&temp)?;
        let mut chunk = vec![0u8; PUT_CHUNK];
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(error) => {
                    let _ = fs::remove_file(&temp);
                    return Err(error.into());
                }
            };
            hasher.update(&chunk[..n]);
            if let Err(error) = out.write_all(&chunk[..n]) {
                let _ = fs::remove_file(&temp);
                return Err(error.into());
            }
        }
        out.sync_all()?;
        drop(out);

        let blob_id = hex::encode(hasher.finalize());
        let path = self.blob_path(&blob_id)?;
        if path.exists() {
            fs::remove_file(&temp)?;
            return Ok(blob_id);
        }

        let parent = path.parent().expect("blob path has a shard dir");
        fs::create_dir_all(parent)?;
        fs::rename(&temp, &path)?;
        if let Ok(handle) = File::open(parent) {
            let _ = handle.sync_all();
        }
        Ok(blob_id)
    }

    pub fn open_blob(&self, blob_id: &str) -> ApiResult<File> {
        match File::open(self.blob_path(blob_id)?) {
            Ok(file) => Ok(file),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Err(ApiError::NotFound),
            Err(error) => Err(error.into()),
        }
    }

    pub fn contains(&self, blob_id: &str) -> bool {
        self.blob_path(blob_id)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    /// Unlink a blob whose refcount reached zero.
    pub fn remove(&self, blob_id: &str) -> ApiResult<()> {
        match fs::remove_file(self.blob_path(blob_id)?) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn blob_path(&self, blob_id: &str) -> ApiResult<PathBuf> {
        if blob_id.len() < 3 || !blob_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ApiError::BadRequest("malformed blob id"));
        }
        Ok(self.root.join(&blob_id[..2]).join(blob_id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
