//! Database root: the encrypted object store plus the blob pool, and the
//! on-disk name layout every layer above shares.
//!
//! Layout under the configured root:
//!
//! ```text
//! master.key                        wrapped master key
//! users.dat                         user directory (userID, email)
//! home/<userID>/user.dat            account record
//! home/<userID>/album-manifest.dat  owned and joined albums
//! home/<userID>/contact-list.dat    contacts, reverse markers, gravestones
//! home/<userID>/gallery.dat         primary file set
//! home/<userID>/trash.dat           soft-deleted file set
//! home/<userID>/album/<albumID>.dat per-album file set (under the owner)
//! blobs/<2 hex>/<blobID>            content-addressed ciphertext
//! blobs/refcount.dat                blob reference counts
//! ```

use crate::blob::{BlobPool, RefCounts, REFCOUNT_FILE};
use crate::crypto::MasterKey;
use crate::error::{ApiError, ApiResult};
use crate::store::{Store, Tx};
use crate::user::UserList;
use chrono::Utc;
use log::warn;
use rand::{thread_rng, Rng};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub const MASTER_KEY_FILE: &str = "master.key";
pub const USERS_FILE: &str = "users.dat";

const ALBUM_ID_BYTES: usize = 32;

/// Attempts for transactions whose lock set depends on a pre-read record
/// (holders, members, visible albums) before giving up with `Conflict`.
pub(crate) const TX_ATTEMPTS: usize = 8;

pub(crate) fn home_dir(user_id: i32) -> String {
    format!("home/{}", user_id)
}

pub(crate) fn user_file(user_id: i32) -> String {
    format!("home/{}/user.dat", user_id)
}

pub(crate) fn manifest_file(user_id: i32) -> String {
    format!("home/{}/album-manifest.dat", user_id)
}

pub(crate) fn contacts_file(user_id: i32) -> String {
    format!("home/{}/contact-list.dat", user_id)
}

pub(crate) fn gallery_file(user_id: i32) -> String {
    format!("home/{}/gallery.dat", user_id)
}

pub(crate) fn trash_file(user_id: i32) -> String {
    format!("home/{}/trash.dat", user_id)
}

pub(crate) fn album_file(owner_id: i32, album_id: &str) -> String {
    format!("home/{}/album/{}.dat", owner_id, album_id)
}

/// Random URL-safe base64 identifier over `size` bytes.
pub fn new_id(size: usize) -> String {
    let bytes: Vec<u8> = (0..size).map(|_| thread_rng().gen()).collect();
    base64::encode_config(&bytes, base64::URL_SAFE_NO_PAD)
}

pub fn new_album_id() -> String {
    new_id(ALBUM_ID_BYTES)
}

pub(crate) fn valid_album_id(album_id: &str) -> bool {
    !album_id.is_empty()
        && album_id.len() <= 64
        && album_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

pub(crate) fn valid_file_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 255 && !name.contains('/') && !name.contains('\0')
}

enum Clock {
    System,
    Fixed(Arc<AtomicI64>),
}

pub struct Db {
    pub(crate) store: Store,
    pub(crate) blobs: BlobPool,
    pub(crate) argon: argon2::Config<'static>,
    clock: Clock,
}

impl Db {
    /// Initialize a new database root: generate the master key, wrap it
    /// under `passphrase`, and create the empty top-level records.
    pub fn create<P: AsRef<Path>>(root: P, passphrase: &str) -> ApiResult<Db> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;

        let key_path = root.join(MASTER_KEY_FILE);
        if key_path.exists() {
            return Err(ApiError::Exists);
        }
        let key = MasterKey::create();
        key.save(passphrase, &key_path)?;

        Db::with_key(root, key)
    }

    /// Open an existing root. A missing master key is fatal: the process
    /// must not serve requests without one.
    pub fn open<P: AsRef<Path>>(root: P, passphrase: &str) -> ApiResult<Db> {
        let root = root.as_ref();
        let key_path = root.join(MASTER_KEY_FILE);
        if !key_path.exists() {
            return Err(ApiError::NoKey);
        }
        let key = MasterKey::read(passphrase, &key_path)?;

        Db::with_key(root, key)
    }

    fn with_key(root: &Path, key: MasterKey) -> ApiResult<Db> {
        let store = Store::open(root, key)?;
        let blobs = BlobPool::open(root.join("blobs"))?;

        if !store.exists(USERS_FILE) {
            match store.create_empty(USERS_FILE, &UserList::default()) {
                Ok(()) | Err(ApiError::Exists) => {}
                Err(error) => return Err(error),
            }
        }
        if !store.exists(REFCOUNT_FILE) {
            match store.create_empty(REFCOUNT_FILE, &RefCounts::default()) {
                Ok(()) | Err(ApiError::Exists) => {}
                Err(error) => return Err(error),
            }
        }

        Ok(Db {
            store,
            blobs,
            argon: argon2::Config::default(),
            clock: Clock::System,
        })
    }

    pub fn master_key(&self) -> &MasterKey {
        self.store.master_key()
    }

    /// Milliseconds since epoch.
    pub fn now(&self) -> i64 {
        match &self.clock {
            Clock::System => Utc::now().timestamp_millis(),
            Clock::Fixed(time) => time.load(Ordering::SeqCst),
        }
    }

    #[cfg(test)]
    pub(crate) fn fix_clock(&mut self) -> Arc<AtomicI64> {
        let handle = Arc::new(AtomicI64::new(1));
        self.clock = Clock::Fixed(Arc::clone(&handle));
        handle
    }

    /// Stage an uploaded ciphertext into the pool, outside of any record
    /// lock. The caller references it in a transaction afterwards, or calls
    /// `discard_blob` if that transaction fails.
    pub fn put_blob<R: Read>(&self, reader: &mut R) -> ApiResult<String> {
        self.blobs.put(reader)
    }

    pub fn open_blob(&self, blob_id: &str) -> ApiResult<File> {
        self.blobs.open_blob(blob_id)
    }

    /// Drop a staged blob that never gained a reference.
    pub fn discard_blob(&self, blob_id: &str) -> ApiResult<()> {
        let tx = self.store.update(REFCOUNT_FILE)?;
        let counts: RefCounts = tx.read(REFCOUNT_FILE)?;
        if counts.get(blob_id) == 0 {
            self.blobs.remove(blob_id)?;
        }
        Ok(())
    }

    /// Unlink blobs whose refcount reached zero in a committed transaction.
    pub(crate) fn unlink_blobs(&self, blob_ids: &[String]) {
        for blob_id in blob_ids {
            if let Err(error) = self.blobs.remove(blob_id) {
                warn!("failed to unlink blob {}: {}", blob_id, error);
            }
        }
    }

    pub fn root(&self) -> &Path {
        self.store.root()
    }

    pub(crate) fn remove_home_dir(&self, user_id: i32) {
        let path: PathBuf = self.store.root().join(home_dir(user_id));
        let _ = std::fs::remove_dir_all(path);
    }
}

/// Apply aggregated per-blob refcount deltas inside `tx`. Returns the blobs
/// that reached zero; the caller unlinks them after commit.
pub(crate) fn apply_ref_deltas(
    tx: &mut Tx,
    deltas: &BTreeMap<String, i64>,
) -> ApiResult<Vec<String>> {
    if deltas.values().all(|delta| *delta == 0) {
        return Ok(vec![]);
    }

    let mut counts: RefCounts = tx.read(REFCOUNT_FILE)?;
    let mut zeroed = vec![];
    for (blob_id, delta) in deltas {
        if *delta == 0 {
            continue;
        }
        if counts.bump(blob_id, *delta) == 0 {
            zeroed.push(blob_id.clone());
        }
    }
    tx.put(REFCOUNT_FILE, &counts)?;
    Ok(zeroed)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) struct TestDb {
        #[allow(dead_code)]
        pub dir: tempfile::TempDir,
        pub db: Db,
        clock: Arc<AtomicI64>,
    }

    impl TestDb {
        pub fn set_time(&self, millis: i64) {
            self.clock.store(millis, Ordering::SeqCst);
        }
    }

    /// A fresh database under a temp root, with a controllable clock and the
    /// fast developer key wrap.
    pub(crate) fn test_db() -> TestDb {
        let _ = env_logger::builder().is_test(true).try_init();

        let dir = tempfile::tempdir().unwrap();
        let mut db = Db::create(dir.path(), "").unwrap();
        let clock = db.fix_clock();
        TestDb { dir, db, clock }
    }
}
