//! Sync delta engine: everything a client needs since its last poll.
//!
//! Clients drive incremental sync with six millisecond cursors, one per
//! stream. `get_updates` answers from a consistent snapshot: it locks the
//! caller's manifest, contact list and fixed sets plus every visible album
//! set, re-validating the visible-album list after the locks are held.

use crate::album::{Album, AlbumManifest};
use crate::db::{self, Db, TX_ATTEMPTS};
use crate::error::{ApiError, ApiResult};
use crate::fileset::{FileSet, FsFile};
use crate::user::{Contact, ContactList};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;

/// Gravestone categories. The numeric codes cross the wire and tell the
/// client which list to prune.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeleteKind {
    /// A file left the gallery.
    FileGallery,
    /// A file left the trash (moved away or permanently deleted).
    FileTrash,
    /// A file left an album for a fixed set, or was destroyed with it.
    AlbumFile,
    /// An album disappeared from this user's view.
    Album,
    /// A contact was removed.
    Contact,
    /// A file moved from one album straight into another.
    AlbumFrom,
}

impl DeleteKind {
    pub fn code(self) -> u8 {
        match self {
            DeleteKind::FileGallery => 1,
            DeleteKind::FileTrash => 2,
            DeleteKind::AlbumFile => 3,
            DeleteKind::Album => 4,
            DeleteKind::Contact => 5,
            DeleteKind::AlbumFrom => 6,
        }
    }
}

/// A dated gravestone, appended when a syncable object disappears from a
/// user's view. Append-only and monotone per record.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeleteEvent {
    pub file: String,
    pub album_id: Option<String>,
    pub date: i64,
    pub kind: DeleteKind,
}

impl DeleteEvent {
    pub(crate) fn contact(user_id: i32, date: i64) -> DeleteEvent {
        DeleteEvent {
            file: user_id.to_string(),
            album_id: None,
            date,
            kind: DeleteKind::Contact,
        }
    }

    pub(crate) fn album(album_id: &str, date: i64) -> DeleteEvent {
        DeleteEvent {
            file: String::new(),
            album_id: Some(album_id.to_string()),
            date,
            kind: DeleteKind::Album,
        }
    }

    pub(crate) fn file(
        kind: DeleteKind,
        file: &str,
        album_id: Option<&str>,
        date: i64,
    ) -> DeleteEvent {
        DeleteEvent {
            file: file.to_string(),
            album_id: album_id.map(str::to_string),
            date,
            kind,
        }
    }

    pub fn to_wire(&self) -> wire::DeleteRecord<'static> {
        wire::DeleteRecord {
            file: Cow::Owned(self.file.clone()),
            album_id: Cow::Owned(self.album_id.clone().unwrap_or_default()),
            date: Cow::Owned(self.date.to_string()),
            kind: Cow::Owned(self.kind.code().to_string()),
        }
    }
}

/// Per-stream "last seen" cursors, milliseconds since epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cursors {
    pub files: i64,
    pub trash: i64,
    pub albums: i64,
    pub album_files: i64,
    pub contacts: i64,
    pub deletes: i64,
}

impl From<[i64; 6]> for Cursors {
    fn from(stamps: [i64; 6]) -> Cursors {
        Cursors {
            files: stamps[0],
            trash: stamps[1],
            albums: stamps[2],
            album_files: stamps[3],
            contacts: stamps[4],
            deletes: stamps[5],
        }
    }
}

/// An album as one user sees it.
#[derive(Clone, Debug)]
pub struct AlbumView {
    pub album: Album,
    pub is_owner: bool,
}

impl AlbumView {
    pub fn to_wire(&self) -> wire::AlbumRecord<'static> {
        let album = &self.album;
        wire::AlbumRecord {
            album_id: Cow::Owned(album.album_id.clone()),
            enc_private_key: Cow::Owned(album.enc_private_key.clone()),
            metadata: Cow::Owned(album.metadata.clone()),
            public_key: Cow::Owned(album.public_key.clone()),
            date_created: Cow::Owned(album.date_created.to_string()),
            date_modified: Cow::Owned(album.date_modified.to_string()),
            is_owner: Cow::Owned(flag(self.is_owner)),
            is_shared: Cow::Owned(flag(album.is_shared)),
            is_hidden: Cow::Owned(flag(album.is_hidden)),
            is_locked: Cow::Owned(flag(album.is_locked)),
            permissions: Cow::Owned(album.permissions.as_str().to_string()),
            members: Cow::Owned(album.members_string()),
            cover: Cow::Owned(album.cover.clone()),
        }
    }
}

/// The six delta streams of one `get_updates` call, oldest first within
/// each stream.
#[derive(Clone, Debug, Default)]
pub struct Updates {
    pub files: Vec<FsFile>,
    pub trash: Vec<FsFile>,
    pub albums: Vec<AlbumView>,
    pub album_files: Vec<FsFile>,
    pub contacts: Vec<Contact>,
    pub deletes: Vec<DeleteEvent>,
}

impl Updates {
    pub fn to_wire(&self) -> wire::UpdateSet<'static> {
        wire::UpdateSet {
            albums: self.albums.iter().map(AlbumView::to_wire).collect(),
            files: self.files.iter().map(file_to_wire).collect(),
            trash: self.trash.iter().map(file_to_wire).collect(),
            album_files: self.album_files.iter().map(file_to_wire).collect(),
            contacts: self.contacts.iter().map(contact_to_wire).collect(),
            deletes: self.deletes.iter().map(DeleteEvent::to_wire).collect(),
        }
    }

    /// The cursor tuple that makes an immediate re-poll return nothing new,
    /// derived from the maxima of the returned streams.
    pub fn next_cursors(&self, previous: &Cursors) -> Cursors {
        fn max_stamp(current: i64, stamps: impl Iterator<Item = i64>) -> i64 {
            stamps.fold(current, i64::max)
        }

        Cursors {
            files: max_stamp(previous.files, self.files.iter().map(|f| f.date_modified)),
            trash: max_stamp(previous.trash, self.trash.iter().map(|f| f.date_modified)),
            albums: max_stamp(previous.albums, self.albums.iter().map(|a| a.album.date_modified)),
            album_files: max_stamp(
                previous.album_files,
                self.album_files.iter().map(|f| f.date_modified),
            ),
            contacts: max_stamp(
                previous.contacts,
                self.contacts.iter().map(|c| c.date_modified),
            ),
            deletes: max_stamp(previous.deletes, self.deletes.iter().map(|d| d.date)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.trash.is_empty()
            && self.albums.is_empty()
            && self.album_files.is_empty()
            && self.contacts.is_empty()
            && self.deletes.is_empty()
    }
}

fn flag(on: bool) -> String {
    if on { "1" } else { "0" }.to_string()
}

fn file_to_wire(file: &FsFile) -> wire::FileRecord<'static> {
    wire::FileRecord {
        file: Cow::Owned(file.file.clone()),
        version: Cow::Owned(file.version.clone()),
        headers: Cow::Owned(file.headers.clone()),
        date_created: Cow::Owned(file.date_created.to_string()),
        date_modified: Cow::Owned(file.date_modified.to_string()),
        album_id: file.album_id.clone().map(Cow::Owned),
    }
}

fn contact_to_wire(contact: &Contact) -> wire::ContactRecord<'static> {
    wire::ContactRecord {
        user_id: Cow::Owned(contact.user_id.to_string()),
        email: Cow::Owned(contact.email.clone()),
        public_key: Cow::Owned(contact.public_key.clone()),
        date_modified: Cow::Owned(contact.date_modified.to_string()),
    }
}

fn changed_files(set: &FileSet, cursor: i64) -> Vec<FsFile> {
    let mut files: Vec<FsFile> = set
        .files
        .values()
        .filter(|file| file.date_modified > cursor)
        .cloned()
        .collect();
    files.sort_by(|a, b| (a.date_modified, &a.file).cmp(&(b.date_modified, &b.file)));
    files
}

impl Db {
    /// Everything that changed for `user_id` since `cursors`, one list per
    /// stream, each ordered by modification time with a stable tie-break.
    pub fn get_updates(&self, user_id: i32, cursors: &Cursors) -> ApiResult<Updates> {
        let manifest_name = db::manifest_file(user_id);
        let contacts_name = db::contacts_file(user_id);
        let gallery_name = db::gallery_file(user_id);
        let trash_name = db::trash_file(user_id);

        for _ in 0..TX_ATTEMPTS {
            let snapshot: AlbumManifest = self.store.read(&manifest_name)?;
            let visible: Vec<(String, String)> = snapshot
                .albums
                .iter()
                .chain(snapshot.remote_albums.iter())
                .map(|(album_id, album)| {
                    (album_id.clone(), db::album_file(album.owner_id, album_id))
                })
                .collect();

            let mut names = vec![
                manifest_name.clone(),
                contacts_name.clone(),
                gallery_name.clone(),
                trash_name.clone(),
            ];
            names.extend(visible.iter().map(|(_, name)| name.clone()));
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let tx = self.store.update_many(&refs)?;

            let manifest: AlbumManifest = tx.read(&manifest_name)?;
            let current: BTreeSet<&String> = manifest
                .albums
                .keys()
                .chain(manifest.remote_albums.keys())
                .collect();
            let expected: BTreeSet<&String> =
                visible.iter().map(|(album_id, _)| album_id).collect();
            if current != expected {
                continue;
            }

            let contacts_list: ContactList = tx.read(&contacts_name)?;
            let gallery: FileSet = tx.read(&gallery_name)?;
            let trash: FileSet = tx.read(&trash_name)?;

            let mut updates = Updates::default();
            updates.files = changed_files(&gallery, cursors.files);
            updates.trash = changed_files(&trash, cursors.trash);

            for (album, is_owner) in manifest
                .albums
                .values()
                .map(|album| (album, true))
                .chain(manifest.remote_albums.values().map(|album| (album, false)))
            {
                if album.date_modified > cursors.albums {
                    updates.albums.push(AlbumView {
                        album: album.clone(),
                        is_owner,
                    });
                }
            }
            updates.albums.sort_by(|a, b| {
                (a.album.date_modified, &a.album.album_id)
                    .cmp(&(b.album.date_modified, &b.album.album_id))
            });

            let mut deletes: Vec<DeleteEvent> = vec![];
            deletes.extend(manifest.deletes.iter().cloned());
            deletes.extend(contacts_list.deletes.iter().cloned());
            deletes.extend(gallery.deletes.iter().cloned());
            deletes.extend(trash.deletes.iter().cloned());

            for (album_id, set_name) in &visible {
                let set: FileSet = tx.read(set_name)?;
                for file in set.files.values() {
                    if file.date_modified > cursors.album_files {
                        let mut file = file.clone();
                        file.album_id = Some(album_id.clone());
                        updates.album_files.push(file);
                    }
                }
                deletes.extend(set.deletes.iter().cloned());
            }
            updates.album_files.sort_by(|a, b| {
                (a.date_modified, &a.file, &a.album_id).cmp(&(b.date_modified, &b.file, &b.album_id))
            });

            updates.contacts = contacts_list
                .contacts
                .values()
                .filter(|contact| contact.date_modified > cursors.contacts)
                .cloned()
                .collect();
            updates
                .contacts
                .sort_by(|a, b| (a.date_modified, &a.email).cmp(&(b.date_modified, &b.email)));

            deletes.retain(|event| event.date > cursors.deletes);
            deletes.sort_by(|a, b| {
                (a.date, &a.file, &a.album_id).cmp(&(b.date, &b.file, &b.album_id))
            });
            updates.deletes = deletes;

            return Ok(updates);
        }

        Err(ApiError::Conflict)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::album::{NewAlbum, Permissions, ShareList};
    use crate::db::testing::test_db;
    use crate::fileset::{MoveItem, MoveRequest, SetRef};
    use crate::user::test::new_user;

    fn album_params(album_id: &str) -> NewAlbum {
        NewAlbum {
            album_id: album_id.to_string(),
            enc_private_key: "key".to_string(),
            public_key: "pk".to_string(),
            metadata: "meta".to_string(),
        }
    }

    fn upload(db: &Db, user_id: i32, set: &SetRef, name: &str) {
        let store_file = db.put_blob(&mut format!("b {}", name).as_bytes()).unwrap();
        let store_thumb = db.put_blob(&mut format!("t {}", name).as_bytes()).unwrap();
        db.add_file(
            user_id,
            set,
            crate::fileset::FsFile {
                file: name.to_string(),
                version: "1".to_string(),
                headers: "h".to_string(),
                date_created: db.now(),
                date_modified: db.now(),
                album_id: None,
                store_file,
                store_thumb,
            },
        )
        .unwrap();
    }

    #[test]
    fn album_create_then_delete() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();

        fixture.set_time(1_000);
        db.add_album(alice.user_id, album_params("a1")).unwrap();

        let updates = db.get_updates(alice.user_id, &Cursors::default()).unwrap();
        assert_eq!(updates.albums.len(), 1);
        let record = updates.albums[0].to_wire();
        assert_eq!(&record.album_id, "a1");
        assert_eq!(&record.date_modified, "1000");
        assert_eq!(&record.is_owner, "1");
        assert_eq!(&record.is_shared, "0");

        fixture.set_time(2_000);
        db.delete_album(alice.user_id, "a1").unwrap();

        let updates = db.get_updates(alice.user_id, &Cursors::default()).unwrap();
        assert!(updates.albums.is_empty());
        assert_eq!(updates.deletes.len(), 1);
        let gravestone = updates.deletes[0].to_wire();
        assert_eq!(&gravestone.album_id, "a1");
        assert_eq!(&gravestone.date, "2000");
        assert_eq!(&gravestone.kind, "4");
    }

    #[test]
    fn cursors_partition_the_streams() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();

        fixture.set_time(1_000);
        upload(db, alice.user_id, &SetRef::Gallery, "one");
        fixture.set_time(2_000);
        upload(db, alice.user_id, &SetRef::Gallery, "two");

        let all = db.get_updates(alice.user_id, &Cursors::default()).unwrap();
        assert_eq!(all.files.len(), 2);
        assert_eq!(all.files[0].file, "one");
        assert_eq!(all.files[1].file, "two");

        let mut after_first = Cursors::default();
        after_first.files = 1_000;
        let newer = db.get_updates(alice.user_id, &after_first).unwrap();
        assert_eq!(newer.files.len(), 1);
        assert_eq!(newer.files[0].file, "two");
    }

    #[test]
    fn repolling_with_returned_cursors_converges() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();
        let bob = db.add_user(new_user("bob@example.com")).unwrap();

        fixture.set_time(1_000);
        db.add_album(alice.user_id, album_params("a1")).unwrap();
        upload(db, alice.user_id, &SetRef::Gallery, "pic");

        fixture.set_time(2_000);
        let mut share = ShareList::default();
        share.members = vec![bob.user_id];
        share.sharing_keys.insert(bob.user_id, "bk".to_string());
        share.permissions = Some(Permissions::parse("1111").unwrap());
        db.share_album(alice.user_id, "a1", share).unwrap();

        fixture.set_time(3_000);
        db.move_files(
            alice.user_id,
            MoveRequest {
                from: SetRef::Gallery,
                to: SetRef::Album("a1".to_string()),
                items: vec![MoveItem {
                    file: "pic".to_string(),
                    headers: Some("rewrapped".to_string()),
                }],
                new_name: None,
                moving: true,
            },
        )
        .unwrap();

        for user in &[alice.user_id, bob.user_id] {
            let first = db.get_updates(*user, &Cursors::default()).unwrap();
            assert!(!first.is_empty());

            let cursors = first.next_cursors(&Cursors::default());
            let second = db.get_updates(*user, &cursors).unwrap();
            assert!(
                second.is_empty(),
                "stale updates for {}: {:?}",
                user,
                second
            );
        }

        // Bob sees the shared album and its file.
        let bob_view = db.get_updates(bob.user_id, &Cursors::default()).unwrap();
        assert_eq!(bob_view.albums.len(), 1);
        assert_eq!(&bob_view.albums[0].to_wire().is_owner, "0");
        assert_eq!(bob_view.album_files.len(), 1);
        assert_eq!(
            bob_view.album_files[0].album_id.as_deref(),
            Some("a1")
        );
        assert_eq!(bob_view.contacts.len(), 1);
        assert_eq!(bob_view.contacts[0].user_id, alice.user_id);

        // Alice's move left a gallery gravestone.
        let alice_view = db.get_updates(alice.user_id, &Cursors::default()).unwrap();
        assert!(alice_view
            .deletes
            .iter()
            .any(|event| event.kind == DeleteKind::FileGallery && event.file == "pic"));
    }
}
