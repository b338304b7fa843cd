//! Encrypted object store.
//!
//! Records are named by their path relative to the store root
//! (`users.dat`, `home/1000001/gallery.dat`, ...). Every value is serialized
//! with bincode and encrypted with the master key before it touches disk.
//!
//! Mutations run inside a `Tx`, which holds an exclusive per-name lock for
//! every record it covers. Locks are always acquired in lexicographic name
//! order, so two transactions over overlapping sets order themselves and
//! cannot deadlock. Commit is two-phase: each new value is written and
//! fsynced to a sibling `<name>.tmp`, then the temps are renamed into place
//! in the same canonical order and the parent directories are fsynced. A
//! crash before the renames leaves every live record untouched; a crash in
//! the middle advances a prefix, and the startup sweep removes whatever
//! temps remain. Renames are assumed atomic (POSIX).
//!
//! Opening the same name twice from one transaction, or nesting transactions
//! over a shared name on one thread, is a caller bug and will deadlock.

use crate::crypto::MasterKey;
use crate::error::{ApiError, ApiResult};
use log::info;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const LOCK_RETRY: Duration = Duration::from_millis(10);
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Store {
    root: PathBuf,
    key: MasterKey,
    locks: LockTable,
}

/// In-process exclusive locks, keyed by record name. The on-disk `.lock`
/// files guard against a second process on the same root.
struct LockTable {
    busy: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockTable {
    fn new() -> LockTable {
        LockTable {
            busy: Mutex::new(HashSet::new()),
            released: Condvar::new(),
        }
    }

    fn acquire(&self, name: &str) -> ApiResult<()> {
        let mut busy = self.busy.lock();
        while busy.contains(name) {
            if self.released.wait_for(&mut busy, LOCK_TIMEOUT).timed_out() {
                return Err(ApiError::Conflict);
            }
        }
        busy.insert(name.to_string());
        Ok(())
    }

    fn release(&self, name: &str) {
        self.busy.lock().remove(name);
        self.released.notify_all();
    }
}

impl Store {
    /// Open the store rooted at `root`, sweeping half-committed temp files
    /// and stale locks left by a previous process.
    pub fn open<P: Into<PathBuf>>(root: P, key: MasterKey) -> ApiResult<Store> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let removed = sweep(&root)?;
        if removed > 0 {
            info!("swept {} stale temp and lock files", removed);
        }

        Ok(Store {
            root,
            key,
            locks: LockTable::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn master_key(&self) -> &MasterKey {
        &self.key
    }

    fn file_path(&self, name: &str) -> PathBuf {
        debug_assert!(!name.contains(".."), "record name escapes the root");
        self.root.join(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    /// Load, verify, decrypt and deserialize a record.
    pub fn read<T: DeserializeOwned>(&self, name: &str) -> ApiResult<T> {
        let mut sealed = vec![];
        let mut file = match File::open(self.file_path(name)) {
            Ok(file) => file,
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                return Err(ApiError::NotFound)
            }
            Err(error) => return Err(error.into()),
        };
        file.read_to_end(&mut sealed)?;

        let plain = self.key.decrypt(&sealed)?;
        bincode::deserialize(&plain).map_err(|_| ApiError::Corrupt("deserialize"))
    }

    /// Replace a record in a single-name transaction.
    pub fn write<T: Serialize>(&self, name: &str, value: &T) -> ApiResult<()> {
        let mut tx = self.update(name)?;
        tx.put(name, value)?;
        tx.commit()
    }

    /// Create a record that must not exist yet.
    pub fn create_empty<T: Serialize>(&self, name: &str, value: &T) -> ApiResult<()> {
        let mut tx = self.update(name)?;
        if tx.exists(name) {
            return Err(ApiError::Exists);
        }
        tx.put(name, value)?;
        tx.commit()
    }

    /// Open a single record for exclusive update.
    pub fn update(&self, name: &str) -> ApiResult<Tx> {
        self.update_many(&[name])
    }

    /// Open a set of records for exclusive update. Locks are taken in
    /// lexicographic order of name; commit rewrites every staged record or
    /// none.
    pub fn update_many(&self, names: &[&str]) -> ApiResult<Tx> {
        let mut sorted: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        sorted.sort();
        sorted.dedup();

        let mut held = 0;
        let mut locked = 0;
        let mut failure = None;
        for name in &sorted {
            if let Err(error) = self.locks.acquire(name) {
                failure = Some(error);
                break;
            }
            held += 1;
            if let Err(error) = lock_file(&sibling(&self.file_path(name), ".lock")) {
                failure = Some(error);
                break;
            }
            locked += 1;
        }

        if let Some(failure) = failure {
            for name in &sorted[..locked] {
                let _ = fs::remove_file(sibling(&self.file_path(name), ".lock"));
            }
            for name in &sorted[..held] {
                self.locks.release(name);
            }
            return Err(failure);
        }

        Ok(Tx {
            store: self,
            names: sorted,
            staged: BTreeMap::new(),
        })
    }
}

enum Staged {
    Put(Vec<u8>),
    Delete,
}

/// An open transaction. Dropping it without `commit` releases every lock and
/// discards all staged writes.
pub struct Tx<'a> {
    store: &'a Store,
    names: Vec<String>,
    staged: BTreeMap<String, Staged>,
}

impl<'a> Tx<'a> {
    fn held(&self, name: &str) {
        assert!(
            self.names.iter().any(|held| held == name),
            "record {} is not covered by this transaction",
            name
        );
    }

    pub fn exists(&self, name: &str) -> bool {
        self.held(name);
        match self.staged.get(name) {
            Some(Staged::Put(_)) => true,
            Some(Staged::Delete) => false,
            None => self.store.exists(name),
        }
    }

    /// Read a covered record, observing staged writes.
    pub fn read<T: DeserializeOwned>(&self, name: &str) -> ApiResult<T> {
        self.held(name);
        match self.staged.get(name) {
            Some(Staged::Put(plain)) => {
                bincode::deserialize(plain).map_err(|_| ApiError::Corrupt("deserialize"))
            }
            Some(Staged::Delete) => Err(ApiError::NotFound),
            None => self.store.read(name),
        }
    }

    /// Stage a new value for a covered record.
    pub fn put<T: Serialize>(&mut self, name: &str, value: &T) -> ApiResult<()> {
        self.held(name);
        let plain = bincode::serialize(value)?;
        self.staged.insert(name.to_string(), Staged::Put(plain));
        Ok(())
    }

    /// Stage removal of a covered record.
    pub fn delete(&mut self, name: &str) {
        self.held(name);
        self.staged.insert(name.to_string(), Staged::Delete);
    }

    /// Apply every staged change. Prepare writes each value to a fsynced
    /// sibling temp file; only then are the temps renamed into place.
    pub fn commit(mut self) -> ApiResult<()> {
        let mut prepared = vec![];
        for (name, staged) in &self.staged {
            if let Staged::Put(plain) = staged {
                let path = self.store.file_path(name);
                let temp = sibling(&path, ".tmp");
                if let Err(error) = stage_file(&self.store.key, plain, &path, &temp) {
                    for temp in &prepared {
                        let _ = fs::remove_file(temp);
                    }
                    return Err(error);
                }
                prepared.push(temp);
            }
        }

        let mut dirs = BTreeSet::new();
        for (name, staged) in &self.staged {
            let path = self.store.file_path(name);
            match staged {
                Staged::Put(_) => fs::rename(sibling(&path, ".tmp"), &path)?,
                Staged::Delete => match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                    Err(error) => return Err(error.into()),
                },
            }
            if let Some(parent) = path.parent() {
                dirs.insert(parent.to_path_buf());
            }
        }

        for dir in dirs {
            if let Ok(handle) = File::open(&dir) {
                let _ = handle.sync_all();
            }
        }

        self.staged.clear();
        Ok(())
    }
}

impl<'a> Drop for Tx<'a> {
    fn drop(&mut self) {
        for name in &self.names {
            let _ = fs::remove_file(sibling(&self.store.file_path(name), ".lock"));
            self.store.locks.release(name);
        }
    }
}

/// `path` with `suffix` appended to its final component.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn stage_file(key: &MasterKey, plain: &[u8], path: &Path, temp: &Path) -> ApiResult<()> {
    let sealed = key.encrypt(plain)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(temp)?;
    file.write_all(&sealed)?;
    file.sync_all()?;
    Ok(())
}

/// Advisory cross-process lock: an exclusively created `.lock` file.
fn lock_file(path: &Path) -> ApiResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let started = Instant::now();
    loop {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => return Ok(()),
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {
                if started.elapsed() >= LOCK_TIMEOUT {
                    return Err(ApiError::Conflict);
                }
                std::thread::sleep(LOCK_RETRY);
            }
            Err(error) => return Err(error.into()),
        }
    }
}

fn sweep(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            removed += sweep(&path)?;
        } else if let Some(extension) = path.extension() {
            if extension == "tmp" || extension == "lock" {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), MasterKey::create()).unwrap();
        (dir, store)
    }

    #[test]
    fn write_then_read() {
        let (_dir, store) = temp_store();

        store.write("a.dat", &vec![1u32, 2, 3]).unwrap();
        let value: Vec<u32> = store.read("a.dat").unwrap();
        assert_eq!(value, vec![1, 2, 3]);

        assert!(matches!(
            store.read::<Vec<u32>>("missing.dat"),
            Err(ApiError::NotFound)
        ));
    }

    #[test]
    fn values_are_encrypted_and_authenticated() {
        let (dir, store) = temp_store();

        store.write("a.dat", &String::from("plain text value")).unwrap();

        let path = dir.path().join("a.dat");
        let sealed = fs::read(&path).unwrap();
        assert!(!sealed
            .windows(5)
            .any(|window| window == b"plain"));

        let mut tampered = sealed;
        tampered[20] ^= 1;
        fs::write(&path, &tampered).unwrap();
        assert!(matches!(
            store.read::<String>("a.dat"),
            Err(ApiError::BadMac)
        ));
    }

    #[test]
    fn create_empty_refuses_existing() {
        let (_dir, store) = temp_store();

        store.create_empty("a.dat", &0u64).unwrap();
        assert!(matches!(
            store.create_empty("a.dat", &0u64),
            Err(ApiError::Exists)
        ));
    }

    #[test]
    fn drop_discards_staged_writes() {
        let (_dir, store) = temp_store();
        store.write("a.dat", &1u64).unwrap();

        {
            let mut tx = store.update("a.dat").unwrap();
            tx.put("a.dat", &2u64).unwrap();
            // dropped without commit
        }

        assert_eq!(store.read::<u64>("a.dat").unwrap(), 1);
    }

    #[test]
    fn delete_inside_transaction() {
        let (_dir, store) = temp_store();
        store.write("a.dat", &1u64).unwrap();
        store.write("b.dat", &2u64).unwrap();

        let mut tx = store.update_many(&["a.dat", "b.dat"]).unwrap();
        tx.delete("a.dat");
        tx.put("b.dat", &20u64).unwrap();
        assert!(matches!(tx.read::<u64>("a.dat"), Err(ApiError::NotFound)));
        tx.commit().unwrap();

        assert!(!store.exists("a.dat"));
        assert_eq!(store.read::<u64>("b.dat").unwrap(), 20);
    }

    #[test]
    fn overlapping_transactions_serialize() {
        let (_dir, store) = temp_store();
        let store = Arc::new(store);
        store.write("x.dat", &0u64).unwrap();
        store.write("y.dat", &0u64).unwrap();

        let mut handles = vec![];
        for worker in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                // Half the workers name the records in reverse order; the
                // store sorts, so this must not deadlock.
                let names: [&str; 2] = if worker % 2 == 0 {
                    ["x.dat", "y.dat"]
                } else {
                    ["y.dat", "x.dat"]
                };

                for _ in 0..25 {
                    let mut tx = store.update_many(&names).unwrap();
                    let x: u64 = tx.read("x.dat").unwrap();
                    let y: u64 = tx.read("y.dat").unwrap();
                    tx.put("x.dat", &(x + 1)).unwrap();
                    tx.put("y.dat", &(y + 1)).unwrap();
                    tx.commit().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.read::<u64>("x.dat").unwrap(), 100);
        assert_eq!(store.read::<u64>("y.dat").unwrap(), 100);
    }

    #[test]
    fn startup_sweep_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let key = MasterKey::create();

        {
            let store = Store::open(dir.path(), key.clone()).unwrap();
            store.write("home/1/a.dat", &7u64).unwrap();
        }

        // Simulate a crash mid-commit: a stale temp and a stale lock.
        fs::write(dir.path().join("home/1/a.dat.tmp"), b"half written").unwrap();
        fs::write(dir.path().join("home/1/a.dat.lock"), b"").unwrap();

        let store = Store::open(dir.path(), key).unwrap();
        assert_eq!(store.read::<u64>("home/1/a.dat").unwrap(), 7);
        assert!(!dir.path().join("home/1/a.dat.tmp").exists());
        assert!(!dir.path().join("home/1/a.dat.lock").exists());

        // And the record is reachable for update again.
        let mut tx = store.update("home/1/a.dat").unwrap();
        tx.put("home/1/a.dat", &8u64).unwrap();
        tx.commit().unwrap();
        assert_eq!(store.read::<u64>("home/1/a.dat").unwrap(), 8);
    }
}
