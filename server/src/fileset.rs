//! File sets and the move/copy machinery.
//!
//! A file set is the mapping from filename to file record for one of a
//! user's fixed sets (Gallery, Trash) or for an album. Album sets live under
//! the album owner's home directory and are shared by every member.

use crate::album::Album;
use crate::blob::REFCOUNT_FILE;
use crate::db::{self, Db};
use crate::error::{ApiError, ApiResult};
use crate::sync::{DeleteEvent, DeleteKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A file's location: one of the two fixed per-user sets, or an album.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetRef {
    Gallery,
    Trash,
    Album(String),
}

impl SetRef {
    pub fn album_id(&self) -> Option<&str> {
        match self {
            SetRef::Album(album_id) => Some(album_id),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FsFile {
    pub file: String,
    pub version: String,
    /// Client-encrypted header blob; carries the embedded filename and the
    /// per-file key, wrapped for the set the file lives in.
    pub headers: String,
    pub date_created: i64,
    pub date_modified: i64,
    pub album_id: Option<String>,
    /// Content blob id.
    pub store_file: String,
    /// Thumbnail blob id.
    pub store_thumb: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct FileSet {
    pub files: BTreeMap<String, FsFile>,
    pub deletes: Vec<DeleteEvent>,
}

/// The inputs of a move or copy between two sets.
#[derive(Clone, Debug)]
pub struct MoveRequest {
    pub from: SetRef,
    pub to: SetRef,
    pub items: Vec<MoveItem>,
    /// Only valid with exactly one item.
    pub new_name: Option<String>,
    /// `true` removes the source entries; `false` copies.
    pub moving: bool,
}

#[derive(Clone, Debug)]
pub struct MoveItem {
    pub file: String,
    /// Replacement header bytes, re-encrypted by the client whenever the
    /// source or destination is an album and the key changes.
    pub headers: Option<String>,
}

struct ResolvedSet {
    name: String,
    album: Option<Album>,
    owned: bool,
}

/// The gravestone a move leaves in its source set. A file leaving an album
/// for another album is `AlbumFrom`; leaving an album for a fixed set is
/// `AlbumFile`. Both prune the albumFiles stream client-side.
fn source_gravestone(from: &SetRef, to: &SetRef, file: &str, now: i64) -> DeleteEvent {
    match from {
        SetRef::Gallery => DeleteEvent::file(DeleteKind::FileGallery, file, None, now),
        SetRef::Trash => DeleteEvent::file(DeleteKind::FileTrash, file, None, now),
        SetRef::Album(album_id) => {
            let kind = match to {
                SetRef::Album(_) => DeleteKind::AlbumFrom,
                _ => DeleteKind::AlbumFile,
            };
            DeleteEvent::file(kind, file, Some(album_id), now)
        }
    }
}

impl Db {
    fn resolve_set(&self, user_id: i32, set: &SetRef) -> ApiResult<ResolvedSet> {
        match set {
            SetRef::Gallery => Ok(ResolvedSet {
                name: db::gallery_file(user_id),
                album: None,
                owned: true,
            }),
            SetRef::Trash => Ok(ResolvedSet {
                name: db::trash_file(user_id),
                album: None,
                owned: true,
            }),
            SetRef::Album(album_id) => {
                if !db::valid_album_id(album_id) {
                    return Err(ApiError::BadRequest("invalid album id"));
                }
                let (album, owned) = self.resolve_album(user_id, album_id)?;
                Ok(ResolvedSet {
                    name: db::album_file(album.owner_id, album_id),
                    album: Some(album),
                    owned,
                })
            }
        }
    }

    /// Record an uploaded file in a set, bumping the refcount of its blobs.
    /// The blobs themselves are staged lock-free with `put_blob` before this
    /// runs; on error the caller discards them.
    pub fn add_file(&self, user_id: i32, set: &SetRef, mut file: FsFile) -> ApiResult<()> {
        if !db::valid_file_name(&file.file) {
            return Err(ApiError::BadRequest("invalid file name"));
        }

        let resolved = self.resolve_set(user_id, set)?;
        if let Some(album) = &resolved.album {
            if !resolved.owned && !album.permissions.allow_add() {
                return Err(ApiError::Forbidden);
            }
        }

        let mut tx = self
            .store
            .update_many(&[&resolved.name, REFCOUNT_FILE])?;
        let mut files: FileSet = tx.read(&resolved.name)?;
        if files.files.contains_key(&file.file) {
            return Err(ApiError::Exists);
        }

        file.album_id = set.album_id().map(str::to_string);

        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        *deltas.entry(file.store_file.clone()).or_insert(0) += 1;
        *deltas.entry(file.store_thumb.clone()).or_insert(0) += 1;
        db::apply_ref_deltas(&mut tx, &deltas)?;

        files.files.insert(file.file.clone(), file);
        tx.put(&resolved.name, &files)?;
        tx.commit()
    }

    /// Move or copy files between sets.
    ///
    /// Preconditions, in order: the source and destination differ unless a
    /// rename is requested; moving out of a non-owned album is denied, and
    /// copying out needs `allowCopy`; adding to a non-owned album needs
    /// `allowAdd`; a copy never starts or ends in the Trash.
    ///
    /// Each moved entry gets its header replaced when the client re-wrapped
    /// it for the destination key, the optional new name, a fresh
    /// `dateModified`, and a gravestone in the source set. An intra-user
    /// move never adjusts blob refcounts; a copy increments each referenced
    /// blob.
    pub fn move_files(&self, user_id: i32, request: MoveRequest) -> ApiResult<()> {
        if request.from == request.to && request.new_name.is_none() {
            return Err(ApiError::BadRequest("source and destination are the same"));
        }

        let from = self.resolve_set(user_id, &request.from)?;
        let to = self.resolve_set(user_id, &request.to)?;

        if let Some(album) = &from.album {
            if !from.owned {
                if request.moving {
                    return Err(ApiError::Forbidden);
                }
                if !album.permissions.allow_copy() {
                    return Err(ApiError::Forbidden);
                }
            }
        }
        if let Some(album) = &to.album {
            if !to.owned && !album.permissions.allow_add() {
                return Err(ApiError::Forbidden);
            }
        }
        if !request.moving {
            if request.to == SetRef::Trash {
                return Err(ApiError::BadRequest("cannot copy into the trash"));
            }
            if request.from == SetRef::Trash {
                return Err(ApiError::BadRequest("cannot copy out of the trash"));
            }
        }
        if let Some(new_name) = &request.new_name {
            if request.items.len() != 1 {
                return Err(ApiError::BadRequest("rename requires a single file"));
            }
            if !db::valid_file_name(new_name) {
                return Err(ApiError::BadRequest("invalid file name"));
            }
        }

        let same_set = from.name == to.name;
        let copying = !request.moving;

        let mut names = vec![from.name.as_str(), to.name.as_str()];
        if copying {
            names.push(REFCOUNT_FILE);
        }
        let mut tx = self.store.update_many(&names)?;

        let mut source: FileSet = tx.read(&from.name)?;
        let mut dest: FileSet = if same_set {
            FileSet::default()
        } else {
            tx.read(&to.name)?
        };

        let now = self.now();
        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        let album_involved = from.album.is_some() || to.album.is_some();

        for item in &request.items {
            let entry = source
                .files
                .get(&item.file)
                .ok_or(ApiError::NotFound)?
                .clone();

            let mut moved = entry;
            if album_involved {
                if let Some(headers) = &item.headers {
                    moved.headers = headers.clone();
                }
            }
            if let Some(new_name) = &request.new_name {
                moved.file = new_name.clone();
            }
            moved.album_id = request.to.album_id().map(str::to_string);
            moved.date_modified = now;

            if same_set && moved.file == item.file {
                continue;
            }

            if request.moving {
                source.files.remove(&item.file);
                source
                    .deletes
                    .push(source_gravestone(&request.from, &request.to, &item.file, now));
            } else {
                *deltas.entry(moved.store_file.clone()).or_insert(0) += 1;
                *deltas.entry(moved.store_thumb.clone()).or_insert(0) += 1;
            }

            let target = if same_set { &mut source } else { &mut dest };
            if target.files.contains_key(&moved.file) {
                return Err(ApiError::Exists);
            }
            target.files.insert(moved.file.clone(), moved);
        }

        if copying {
            db::apply_ref_deltas(&mut tx, &deltas)?;
        }
        tx.put(&from.name, &source)?;
        if !same_set {
            tx.put(&to.name, &dest)?;
        }
        tx.commit()
    }

    /// Permanently delete named files from the Trash, releasing their blob
    /// references. Unknown names are skipped.
    pub fn delete_files(&self, user_id: i32, files: &[String]) -> ApiResult<()> {
        let trash_name = db::trash_file(user_id);
        let mut tx = self.store.update_many(&[&trash_name, REFCOUNT_FILE])?;

        let mut trash: FileSet = tx.read(&trash_name)?;
        let now = self.now();
        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        for name in files {
            if let Some(file) = trash.files.remove(name) {
                *deltas.entry(file.store_file).or_insert(0) -= 1;
                *deltas.entry(file.store_thumb).or_insert(0) -= 1;
                trash
                    .deletes
                    .push(DeleteEvent::file(DeleteKind::FileTrash, name, None, now));
            }
        }

        let zeroed = db::apply_ref_deltas(&mut tx, &deltas)?;
        tx.put(&trash_name, &trash)?;
        tx.commit()?;

        self.unlink_blobs(&zeroed);
        Ok(())
    }

    /// Drop every Trash entry created at or before `cutoff`.
    pub fn empty_trash(&self, user_id: i32, cutoff: i64) -> ApiResult<()> {
        let trash_name = db::trash_file(user_id);
        let mut tx = self.store.update_many(&[&trash_name, REFCOUNT_FILE])?;

        let mut trash: FileSet = tx.read(&trash_name)?;
        let doomed: Vec<String> = trash
            .files
            .values()
            .filter(|file| file.date_created <= cutoff)
            .map(|file| file.file.clone())
            .collect();

        let now = self.now();
        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        for name in &doomed {
            if let Some(file) = trash.files.remove(name) {
                *deltas.entry(file.store_file).or_insert(0) -= 1;
                *deltas.entry(file.store_thumb).or_insert(0) -= 1;
                trash
                    .deletes
                    .push(DeleteEvent::file(DeleteKind::FileTrash, name, None, now));
            }
        }

        let zeroed = db::apply_ref_deltas(&mut tx, &deltas)?;
        tx.put(&trash_name, &trash)?;
        tx.commit()?;

        self.unlink_blobs(&zeroed);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::album::{NewAlbum, Permissions, ShareList};
    use crate::blob::RefCounts;
    use crate::db::testing::{test_db, TestDb};
    use crate::user::test::new_user;
    use crate::user::User;

    fn upload(db: &Db, user_id: i32, set: &SetRef, name: &str) -> FsFile {
        let body = format!("body of {}", name);
        let thumb = format!("thumb of {}", name);
        let store_file = db.put_blob(&mut body.as_bytes()).unwrap();
        let store_thumb = db.put_blob(&mut thumb.as_bytes()).unwrap();

        let file = FsFile {
            file: name.to_string(),
            version: "1".to_string(),
            headers: "wrapped header".to_string(),
            date_created: db.now(),
            date_modified: db.now(),
            album_id: None,
            store_file,
            store_thumb,
        };
        db.add_file(user_id, set, file.clone()).unwrap();
        file
    }

    fn gallery(db: &Db, user_id: i32) -> FileSet {
        db.store.read(&db::gallery_file(user_id)).unwrap()
    }

    fn trash(db: &Db, user_id: i32) -> FileSet {
        db.store.read(&db::trash_file(user_id)).unwrap()
    }

    fn refcounts(db: &Db) -> RefCounts {
        db.store.read(REFCOUNT_FILE).unwrap()
    }

    fn shared_album(fixture: &TestDb, permissions: &str) -> (User, User) {
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();
        let bob = db.add_user(new_user("bob@example.com")).unwrap();

        db.add_album(
            alice.user_id,
            NewAlbum {
                album_id: "album".to_string(),
                enc_private_key: "owner key".to_string(),
                public_key: "album pk".to_string(),
                metadata: "metadata".to_string(),
            },
        )
        .unwrap();

        let mut share = ShareList::default();
        share.members = vec![bob.user_id];
        share
            .sharing_keys
            .insert(bob.user_id, "bob key".to_string());
        share.permissions = Some(Permissions::parse(permissions).unwrap());
        db.share_album(alice.user_id, "album", share).unwrap();

        (alice, bob)
    }

    #[test]
    fn move_and_empty_trash() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();

        let files: Vec<FsFile> = (0..10)
            .map(|i| upload(db, alice.user_id, &SetRef::Gallery, &format!("file{}", i)))
            .collect();
        assert_eq!(gallery(db, alice.user_id).files.len(), 10);
        assert_eq!(trash(db, alice.user_id).files.len(), 0);

        fixture.set_time(2_000);
        db.move_files(
            alice.user_id,
            MoveRequest {
                from: SetRef::Gallery,
                to: SetRef::Trash,
                items: (0..4)
                    .map(|i| MoveItem {
                        file: format!("file{}", i),
                        headers: None,
                    })
                    .collect(),
                new_name: None,
                moving: true,
            },
        )
        .unwrap();
        assert_eq!(gallery(db, alice.user_id).files.len(), 6);
        assert_eq!(trash(db, alice.user_id).files.len(), 4);

        // Moves never touch refcounts.
        let counts = refcounts(db);
        for file in &files {
            assert_eq!(counts.get(&file.store_file), 1);
            assert_eq!(counts.get(&file.store_thumb), 1);
        }
        let gravestones = gallery(db, alice.user_id).deletes;
        assert_eq!(gravestones.len(), 4);
        assert!(gravestones
            .iter()
            .all(|event| event.kind == DeleteKind::FileGallery && event.date == 2_000));

        db.delete_files(
            alice.user_id,
            &["file0".to_string(), "file1".to_string()],
        )
        .unwrap();
        assert_eq!(gallery(db, alice.user_id).files.len(), 6);
        assert_eq!(trash(db, alice.user_id).files.len(), 2);

        fixture.set_time(3_000);
        db.empty_trash(alice.user_id, 3_000).unwrap();
        assert_eq!(gallery(db, alice.user_id).files.len(), 6);
        assert_eq!(trash(db, alice.user_id).files.len(), 0);

        // The emptied files' blobs are gone, the gallery's remain.
        let counts = refcounts(db);
        for file in &files[..4] {
            assert_eq!(counts.get(&file.store_file), 0);
            assert!(!db.blobs.contains(&file.store_file));
            assert!(!db.blobs.contains(&file.store_thumb));
        }
        for file in &files[4..] {
            assert_eq!(counts.get(&file.store_file), 1);
            assert!(db.blobs.contains(&file.store_file));
        }

        let trash_events = trash(db, alice.user_id).deletes;
        assert_eq!(trash_events.len(), 4);
        assert!(trash_events
            .iter()
            .all(|event| event.kind == DeleteKind::FileTrash));
    }

    #[test]
    fn copy_increments_refcounts() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();
        db.add_album(
            alice.user_id,
            NewAlbum {
                album_id: "a1".to_string(),
                enc_private_key: "k".to_string(),
                public_key: "pk".to_string(),
                metadata: "m".to_string(),
            },
        )
        .unwrap();

        let file = upload(db, alice.user_id, &SetRef::Gallery, "photo");
        db.move_files(
            alice.user_id,
            MoveRequest {
                from: SetRef::Gallery,
                to: SetRef::Album("a1".to_string()),
                items: vec![MoveItem {
                    file: "photo".to_string(),
                    headers: Some("rewrapped header".to_string()),
                }],
                new_name: None,
                moving: false,
            },
        )
        .unwrap();

        assert_eq!(refcounts(db).get(&file.store_file), 2);
        assert_eq!(gallery(db, alice.user_id).files.len(), 1);

        let album_set: FileSet = db
            .store
            .read(&db::album_file(alice.user_id, "a1"))
            .unwrap();
        let copy = &album_set.files["photo"];
        assert_eq!(copy.headers, "rewrapped header");
        assert_eq!(copy.album_id.as_deref(), Some("a1"));

        // Deleting the album releases only the copy's reference.
        db.delete_album(alice.user_id, "a1").unwrap();
        assert_eq!(refcounts(db).get(&file.store_file), 1);
        assert!(db.blobs.contains(&file.store_file));
    }

    #[test]
    fn move_preconditions() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();
        upload(db, alice.user_id, &SetRef::Gallery, "photo");

        let request = |from: SetRef, to: SetRef, moving: bool| MoveRequest {
            from,
            to,
            items: vec![MoveItem {
                file: "photo".to_string(),
                headers: None,
            }],
            new_name: None,
            moving,
        };

        assert!(matches!(
            db.move_files(alice.user_id, request(SetRef::Gallery, SetRef::Gallery, true)),
            Err(ApiError::BadRequest("source and destination are the same"))
        ));
        assert!(matches!(
            db.move_files(alice.user_id, request(SetRef::Gallery, SetRef::Trash, false)),
            Err(ApiError::BadRequest("cannot copy into the trash"))
        ));
        assert!(matches!(
            db.move_files(alice.user_id, request(SetRef::Trash, SetRef::Gallery, false)),
            Err(ApiError::BadRequest("cannot copy out of the trash"))
        ));

        let mut two = request(SetRef::Gallery, SetRef::Trash, true);
        two.items.push(MoveItem {
            file: "other".to_string(),
            headers: None,
        });
        two.new_name = Some("renamed".to_string());
        assert!(matches!(
            db.move_files(alice.user_id, two),
            Err(ApiError::BadRequest("rename requires a single file"))
        ));
    }

    #[test]
    fn rename_within_a_set() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();
        upload(db, alice.user_id, &SetRef::Gallery, "old name");

        fixture.set_time(7_000);
        db.move_files(
            alice.user_id,
            MoveRequest {
                from: SetRef::Gallery,
                to: SetRef::Gallery,
                items: vec![MoveItem {
                    file: "old name".to_string(),
                    headers: None,
                }],
                new_name: Some("new name".to_string()),
                moving: true,
            },
        )
        .unwrap();

        let set = gallery(db, alice.user_id);
        assert!(!set.files.contains_key("old name"));
        let renamed = &set.files["new name"];
        assert_eq!(renamed.file, "new name");
        assert_eq!(renamed.date_modified, 7_000);

        let event = set.deletes.last().unwrap();
        assert_eq!(event.kind, DeleteKind::FileGallery);
        assert_eq!(event.file, "old name");
    }

    #[test]
    fn permission_bits_gate_non_owners() {
        let fixture = test_db();
        let db = &fixture.db;
        // allowOriginal only: no add, no share, no copy.
        let (alice, bob) = shared_album(&fixture, "0001");

        let body = b"bob upload";
        let store_file = db.put_blob(&mut &body[..]).unwrap();
        let store_thumb = db.put_blob(&mut &b"bob thumb"[..]).unwrap();
        let attempt = db.add_file(
            bob.user_id,
            &SetRef::Album("album".to_string()),
            FsFile {
                file: "bobs.jpg".to_string(),
                version: "1".to_string(),
                headers: "h".to_string(),
                date_created: db.now(),
                date_modified: db.now(),
                album_id: None,
                store_file: store_file.clone(),
                store_thumb,
            },
        );
        assert!(matches!(attempt, Err(ApiError::Forbidden)));
        db.discard_blob(&store_file).unwrap();
        assert!(!db.blobs.contains(&store_file));

        // Alice puts a file in; bob may neither copy nor move it out.
        upload(db, alice.user_id, &SetRef::Album("album".to_string()), "hers");
        let out = |moving| MoveRequest {
            from: SetRef::Album("album".to_string()),
            to: SetRef::Gallery,
            items: vec![MoveItem {
                file: "hers".to_string(),
                headers: Some("rewrapped".to_string()),
            }],
            new_name: None,
            moving,
        };
        assert!(matches!(
            db.move_files(bob.user_id, out(false)),
            Err(ApiError::Forbidden)
        ));
        assert!(matches!(
            db.move_files(bob.user_id, out(true)),
            Err(ApiError::Forbidden)
        ));

        // Viewing and leaving stay possible.
        assert!(db.resolve_album(bob.user_id, "album").is_ok());
        db.leave_album(bob.user_id, "album").unwrap();
    }

    #[test]
    fn allowed_member_adds_into_shared_album() {
        let fixture = test_db();
        let db = &fixture.db;
        let (alice, bob) = shared_album(&fixture, "1111");

        upload(db, bob.user_id, &SetRef::Album("album".to_string()), "bobs");

        let set: FileSet = db
            .store
            .read(&db::album_file(alice.user_id, "album"))
            .unwrap();
        assert!(set.files.contains_key("bobs"));

        // And with allowCopy set, bob may copy it back out.
        db.move_files(
            bob.user_id,
            MoveRequest {
                from: SetRef::Album("album".to_string()),
                to: SetRef::Gallery,
                items: vec![MoveItem {
                    file: "bobs".to_string(),
                    headers: Some("mine again".to_string()),
                }],
                new_name: None,
                moving: false,
            },
        )
        .unwrap();
        assert!(gallery(db, bob.user_id).files.contains_key("bobs"));
    }
}
