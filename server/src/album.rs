//! Album manifests, ownership and sharing.
//!
//! Every user has one manifest: the albums they own in `albums`, and a
//! projection of every album they joined in `remote_albums`. A member's
//! projection carries their own wrapped album key as `enc_private_key` and
//! never the per-member key map; the owner's copy is authoritative for
//! membership and permissions.

use crate::db::{self, Db, TX_ATTEMPTS};
use crate::error::{ApiError, ApiResult};
use crate::fileset::FileSet;
use crate::store::Tx;
use crate::sync::DeleteEvent;
use crate::user::{Contact, ContactList, User};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Four-character bitmask: allowAdd, allowShare, allowCopy, allowOriginal.
/// `allowOriginal` is advisory for clients; the server never checks it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Permissions(String);

impl Permissions {
    pub fn parse(text: &str) -> ApiResult<Permissions> {
        if text.len() != 4 || !text.bytes().all(|b| b == b'0' || b == b'1') {
            return Err(ApiError::BadRequest("malformed permissions"));
        }
        Ok(Permissions(text.to_string()))
    }

    fn bit(&self, index: usize) -> bool {
        self.0.as_bytes()[index] == b'1'
    }

    /// Gates inserts into a non-owned album.
    pub fn allow_add(&self) -> bool {
        self.bit(0)
    }

    /// Gates cascading share by a non-owner.
    pub fn allow_share(&self) -> bool {
        self.bit(1)
    }

    /// Gates copying out of a non-owned album.
    pub fn allow_copy(&self) -> bool {
        self.bit(2)
    }

    pub fn allow_original(&self) -> bool {
        self.bit(3)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions("0000".to_string())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Album {
    pub album_id: String,
    pub owner_id: i32,
    pub date_created: i64,
    pub date_modified: i64,
    /// Album private key wrapped for the record holder, client-encrypted.
    pub enc_private_key: String,
    pub public_key: String,
    /// Client-encrypted album metadata.
    pub metadata: String,
    pub is_shared: bool,
    pub is_hidden: bool,
    pub is_locked: bool,
    /// All member ids, owner included while shared.
    pub members: BTreeSet<i32>,
    pub permissions: Permissions,
    /// Per-member wrapped album keys, kept only in the owner's copy.
    pub sharing_keys: BTreeMap<i32, String>,
    pub cover: String,
}

impl Album {
    /// The copy written into `member`'s manifest: their sharing key becomes
    /// the private key, and the per-member key map stays with the owner.
    fn project_for(&self, member: i32) -> Album {
        let mut projection = self.clone();
        projection.enc_private_key = self
            .sharing_keys
            .get(&member)
            .cloned()
            .unwrap_or_default();
        projection.sharing_keys = BTreeMap::new();
        projection
    }

    /// Comma-joined member ids in ascending order, the wire encoding.
    pub fn members_string(&self) -> String {
        let ids: Vec<String> = self.members.iter().map(|id| id.to_string()).collect();
        ids.join(",")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AlbumManifest {
    pub albums: BTreeMap<String, Album>,
    pub remote_albums: BTreeMap<String, Album>,
    pub deletes: Vec<DeleteEvent>,
}

/// Parameters of `addAlbum`; the id and key material come from the client.
#[derive(Clone, Debug)]
pub struct NewAlbum {
    pub album_id: String,
    pub enc_private_key: String,
    pub public_key: String,
    pub metadata: String,
}

/// Parameters of `share`: the members to add and their wrapped keys.
#[derive(Clone, Debug, Default)]
pub struct ShareList {
    pub members: Vec<i32>,
    pub sharing_keys: BTreeMap<i32, String>,
    /// Applied only when the owner shares; a re-sharing member never
    /// modifies the permission field.
    pub permissions: Option<Permissions>,
}

impl Db {
    /// The authoritative album record as seen by `user_id`, plus whether
    /// they own it. For a joined album the owner's copy is consulted.
    pub(crate) fn resolve_album(&self, user_id: i32, album_id: &str) -> ApiResult<(Album, bool)> {
        let manifest: AlbumManifest = self.store.read(&db::manifest_file(user_id))?;
        if let Some(album) = manifest.albums.get(album_id) {
            return Ok((album.clone(), true));
        }
        if let Some(projection) = manifest.remote_albums.get(album_id) {
            let owner: AlbumManifest = self.store.read(&db::manifest_file(projection.owner_id))?;
            let album = owner.albums.get(album_id).ok_or(ApiError::NotFound)?;
            return Ok((album.clone(), false));
        }
        Err(ApiError::NotFound)
    }

    /// Create an empty album owned by `owner_id`.
    pub fn add_album(&self, owner_id: i32, new: NewAlbum) -> ApiResult<Album> {
        if !db::valid_album_id(&new.album_id) {
            return Err(ApiError::BadRequest("invalid album id"));
        }

        let manifest_name = db::manifest_file(owner_id);
        let set_name = db::album_file(owner_id, &new.album_id);
        let mut tx = self.store.update_many(&[&manifest_name, &set_name])?;

        let mut manifest: AlbumManifest = tx.read(&manifest_name)?;
        if manifest.albums.contains_key(&new.album_id)
            || manifest.remote_albums.contains_key(&new.album_id)
            || tx.exists(&set_name)
        {
            return Err(ApiError::Exists);
        }

        let now = self.now();
        let album = Album {
            album_id: new.album_id.clone(),
            owner_id,
            date_created: now,
            date_modified: now,
            enc_private_key: new.enc_private_key,
            public_key: new.public_key,
            metadata: new.metadata,
            is_shared: false,
            is_hidden: false,
            is_locked: false,
            members: BTreeSet::new(),
            permissions: Permissions::default(),
            sharing_keys: BTreeMap::new(),
            cover: String::new(),
        };

        manifest.albums.insert(new.album_id.clone(), album.clone());
        tx.put(&manifest_name, &manifest)?;
        tx.put(&set_name, &FileSet::default())?;
        tx.commit()?;
        Ok(album)
    }

    /// Destroy an owned album. Members are detached with a gravestone, any
    /// remaining files release their blob references, and the owner gets a
    /// gravestone of their own.
    pub fn delete_album(&self, owner_id: i32, album_id: &str) -> ApiResult<()> {
        let manifest_name = db::manifest_file(owner_id);
        let set_name = db::album_file(owner_id, album_id);

        for _ in 0..TX_ATTEMPTS {
            let snapshot: AlbumManifest = self.store.read(&manifest_name)?;
            let album = match snapshot.albums.get(album_id) {
                Some(album) => album,
                None if snapshot.remote_albums.contains_key(album_id) => {
                    return Err(ApiError::Forbidden)
                }
                None => return Err(ApiError::NotFound),
            };
            let members: BTreeSet<i32> = album
                .members
                .iter()
                .copied()
                .filter(|member| *member != owner_id)
                .collect();

            let mut names = vec![
                manifest_name.clone(),
                set_name.clone(),
                crate::blob::REFCOUNT_FILE.to_string(),
            ];
            names.extend(members.iter().map(|member| db::manifest_file(*member)));
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tx = self.store.update_many(&refs)?;

            let mut manifest: AlbumManifest = tx.read(&manifest_name)?;
            let album = match manifest.albums.get(album_id) {
                Some(album) => album.clone(),
                None => return Err(ApiError::NotFound),
            };
            let current: BTreeSet<i32> = album
                .members
                .iter()
                .copied()
                .filter(|member| *member != owner_id)
                .collect();
            if current != members {
                continue;
            }

            let now = self.now();
            let set: FileSet = tx.read(&set_name)?;
            let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
            for file in set.files.values() {
                *deltas.entry(file.store_file.clone()).or_insert(0) -= 1;
                *deltas.entry(file.store_thumb.clone()).or_insert(0) -= 1;
            }
            let zeroed = db::apply_ref_deltas(&mut tx, &deltas)?;

            for member in &members {
                let name = db::manifest_file(*member);
                let mut theirs: AlbumManifest = tx.read(&name)?;
                if theirs.remote_albums.remove(album_id).is_some() {
                    theirs.deletes.push(DeleteEvent::album(album_id, now));
                }
                tx.put(&name, &theirs)?;
            }

            manifest.albums.remove(album_id);
            manifest.deletes.push(DeleteEvent::album(album_id, now));
            tx.put(&manifest_name, &manifest)?;
            tx.delete(&set_name);
            tx.commit()?;

            self.unlink_blobs(&zeroed);
            return Ok(());
        }

        Err(ApiError::Conflict)
    }

    /// Owner-only edit of the album record, propagated into every member's
    /// projection.
    fn edit_album<F>(&self, owner_id: i32, album_id: &str, edit: F) -> ApiResult<Album>
    where
        F: Fn(&mut Album),
    {
        let manifest_name = db::manifest_file(owner_id);

        for _ in 0..TX_ATTEMPTS {
            let snapshot: AlbumManifest = self.store.read(&manifest_name)?;
            let album = match snapshot.albums.get(album_id) {
                Some(album) => album,
                None if snapshot.remote_albums.contains_key(album_id) => {
                    return Err(ApiError::Forbidden)
                }
                None => return Err(ApiError::NotFound),
            };
            let members: BTreeSet<i32> = album
                .members
                .iter()
                .copied()
                .filter(|member| *member != owner_id)
                .collect();

            let mut names = vec![manifest_name.clone()];
            names.extend(members.iter().map(|member| db::manifest_file(*member)));
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tx = self.store.update_many(&refs)?;

            let mut manifest: AlbumManifest = tx.read(&manifest_name)?;
            let mut album = match manifest.albums.get(album_id) {
                Some(album) => album.clone(),
                None => return Err(ApiError::NotFound),
            };
            let current: BTreeSet<i32> = album
                .members
                .iter()
                .copied()
                .filter(|member| *member != owner_id)
                .collect();
            if current != members {
                continue;
            }

            edit(&mut album);
            album.album_id = album_id.to_string();
            album.owner_id = owner_id;
            album.date_modified = self.now();

            for member in &members {
                let name = db::manifest_file(*member);
                let mut theirs: AlbumManifest = tx.read(&name)?;
                theirs
                    .remote_albums
                    .insert(album_id.to_string(), album.project_for(*member));
                tx.put(&name, &theirs)?;
            }

            manifest.albums.insert(album_id.to_string(), album.clone());
            tx.put(&manifest_name, &manifest)?;
            tx.commit()?;
            return Ok(album);
        }

        Err(ApiError::Conflict)
    }

    pub fn change_album_metadata(
        &self,
        owner_id: i32,
        album_id: &str,
        metadata: &str,
    ) -> ApiResult<Album> {
        self.edit_album(owner_id, album_id, |album| {
            album.metadata = metadata.to_string();
        })
    }

    pub fn change_album_cover(
        &self,
        owner_id: i32,
        album_id: &str,
        cover: &str,
    ) -> ApiResult<Album> {
        self.edit_album(owner_id, album_id, |album| {
            album.cover = cover.to_string();
        })
    }

    /// Share an album with new members. The owner's record absorbs the new
    /// members and their sharing keys; each new member gets a projection in
    /// their manifest and contact edges with both the sharer and the owner.
    /// A non-owner needs `allowShare` and cannot change permissions.
    pub fn share_album(&self, caller: i32, album_id: &str, share: ShareList) -> ApiResult<Album> {
        for _ in 0..TX_ATTEMPTS {
            let (album, owned) = self.resolve_album(caller, album_id)?;
            let owner_id = album.owner_id;

            if !owned {
                if !album.members.contains(&caller) {
                    return Err(ApiError::Forbidden);
                }
                if !album.permissions.allow_share() {
                    return Err(ApiError::Forbidden);
                }
            }

            let new_members: Vec<i32> = share
                .members
                .iter()
                .copied()
                .filter(|member| *member != owner_id && !album.members.contains(member))
                .collect();
            for member in &new_members {
                if !share.sharing_keys.contains_key(member) {
                    return Err(ApiError::BadRequest("missing sharing key"));
                }
            }

            // User records for the contact edges; plain reads, the contact
            // lists themselves are locked below.
            let caller_user = self.user_by_id(caller)?;
            let owner_user = self.user_by_id(owner_id)?;
            let mut member_users = vec![];
            for member in &new_members {
                member_users.push(self.user_by_id(*member)?);
            }

            let manifest_name = db::manifest_file(owner_id);
            let mut names = vec![
                manifest_name.clone(),
                db::contacts_file(caller),
                db::contacts_file(owner_id),
            ];
            for member in &new_members {
                names.push(db::manifest_file(*member));
                names.push(db::contacts_file(*member));
            }
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tx = self.store.update_many(&refs)?;

            let mut manifest: AlbumManifest = tx.read(&manifest_name)?;
            let mut current = match manifest.albums.get(album_id) {
                Some(album) => album.clone(),
                None => return Err(ApiError::NotFound),
            };
            if current.members != album.members {
                continue;
            }

            let now = self.now();
            current.is_shared = true;
            current.members.insert(owner_id);
            for member in &new_members {
                current.members.insert(*member);
                current
                    .sharing_keys
                    .insert(*member, share.sharing_keys[member].clone());
            }
            if owned {
                if let Some(permissions) = &share.permissions {
                    current.permissions = permissions.clone();
                }
            }
            current.date_modified = now;

            for (member, member_user) in new_members.iter().zip(&member_users) {
                let name = db::manifest_file(*member);
                let mut theirs: AlbumManifest = tx.read(&name)?;
                let mut projection = current.project_for(*member);
                projection.date_modified = now;
                theirs.remote_albums.insert(album_id.to_string(), projection);
                tx.put(&name, &theirs)?;

                self.link_contacts(&mut tx, member_user, &caller_user, now)?;
                self.link_contacts(&mut tx, member_user, &owner_user, now)?;
            }

            manifest.albums.insert(album_id.to_string(), current.clone());
            tx.put(&manifest_name, &manifest)?;
            tx.commit()?;

            info!(
                "album {} shared with {} new members",
                album_id,
                new_members.len()
            );
            return Ok(current);
        }

        Err(ApiError::Conflict)
    }

    /// Symmetric contact edge between two users, inside an open transaction
    /// that covers both contact lists. Existing entries are left untouched.
    fn link_contacts(&self, tx: &mut Tx, a: &User, b: &User, now: i64) -> ApiResult<()> {
        if a.user_id == b.user_id {
            return Ok(());
        }
        for (from, to) in &[(a, b), (b, a)] {
            let name = db::contacts_file(from.user_id);
            let mut list: ContactList = tx.read(&name)?;
            list.contacts.entry(to.user_id).or_insert(Contact {
                user_id: to.user_id,
                email: to.email.clone(),
                public_key: to.public_key.clone(),
                date_modified: now,
            });
            list.held_by.insert(to.user_id);
            tx.put(&name, &list)?;
        }
        Ok(())
    }

    /// Owner-only: stop sharing entirely. Every member loses the album and
    /// gets a gravestone; the owner's copy returns to private.
    pub fn unshare_album(&self, owner_id: i32, album_id: &str) -> ApiResult<Album> {
        let manifest_name = db::manifest_file(owner_id);

        for _ in 0..TX_ATTEMPTS {
            let snapshot: AlbumManifest = self.store.read(&manifest_name)?;
            let album = match snapshot.albums.get(album_id) {
                Some(album) => album,
                None if snapshot.remote_albums.contains_key(album_id) => {
                    return Err(ApiError::Forbidden)
                }
                None => return Err(ApiError::NotFound),
            };
            let members: BTreeSet<i32> = album
                .members
                .iter()
                .copied()
                .filter(|member| *member != owner_id)
                .collect();

            let mut names = vec![manifest_name.clone()];
            names.extend(members.iter().map(|member| db::manifest_file(*member)));
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tx = self.store.update_many(&refs)?;

            let mut manifest: AlbumManifest = tx.read(&manifest_name)?;
            let mut album = match manifest.albums.get(album_id) {
                Some(album) => album.clone(),
                None => return Err(ApiError::NotFound),
            };
            let current: BTreeSet<i32> = album
                .members
                .iter()
                .copied()
                .filter(|member| *member != owner_id)
                .collect();
            if current != members {
                continue;
            }

            let now = self.now();
            for member in &members {
                let name = db::manifest_file(*member);
                let mut theirs: AlbumManifest = tx.read(&name)?;
                if theirs.remote_albums.remove(album_id).is_some() {
                    theirs.deletes.push(DeleteEvent::album(album_id, now));
                }
                tx.put(&name, &theirs)?;
            }

            album.is_shared = false;
            album.members.clear();
            album.sharing_keys.clear();
            album.date_modified = now;
            manifest.albums.insert(album_id.to_string(), album.clone());
            tx.put(&manifest_name, &manifest)?;
            tx.commit()?;
            return Ok(album);
        }

        Err(ApiError::Conflict)
    }

    /// Member-initiated departure from a joined album.
    pub fn leave_album(&self, member: i32, album_id: &str) -> ApiResult<()> {
        let manifest: AlbumManifest = self.store.read(&db::manifest_file(member))?;
        let projection = manifest
            .remote_albums
            .get(album_id)
            .ok_or(ApiError::NotFound)?;
        self.detach_member(projection.owner_id, album_id, member)
    }

    /// Owner-initiated removal of a member.
    pub fn remove_album_member(
        &self,
        owner_id: i32,
        album_id: &str,
        member: i32,
    ) -> ApiResult<()> {
        if member == owner_id {
            return Err(ApiError::BadRequest("cannot remove the owner"));
        }
        let manifest: AlbumManifest = self.store.read(&db::manifest_file(owner_id))?;
        if !manifest.albums.contains_key(album_id) {
            return Err(if manifest.remote_albums.contains_key(album_id) {
                ApiError::Forbidden
            } else {
                ApiError::NotFound
            });
        }
        self.detach_member(owner_id, album_id, member)
    }

    fn detach_member(&self, owner_id: i32, album_id: &str, member: i32) -> ApiResult<()> {
        let owner_name = db::manifest_file(owner_id);
        let member_name = db::manifest_file(member);
        let mut tx = self.store.update_many(&[&owner_name, &member_name])?;

        let now = self.now();

        let mut owner_manifest: AlbumManifest = tx.read(&owner_name)?;
        let album = owner_manifest
            .albums
            .get_mut(album_id)
            .ok_or(ApiError::NotFound)?;
        album.members.remove(&member);
        album.sharing_keys.remove(&member);
        album.date_modified = now;
        tx.put(&owner_name, &owner_manifest)?;

        let mut member_manifest: AlbumManifest = tx.read(&member_name)?;
        if member_manifest.remote_albums.remove(album_id).is_some() {
            member_manifest.deletes.push(DeleteEvent::album(album_id, now));
        }
        tx.put(&member_name, &member_manifest)?;

        tx.commit()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::db::testing::test_db;
    use crate::sync::DeleteKind;
    use crate::user::test::new_user;

    fn album_params(album_id: &str) -> NewAlbum {
        NewAlbum {
            album_id: album_id.to_string(),
            enc_private_key: "owner key".to_string(),
            public_key: "album pk".to_string(),
            metadata: "encrypted metadata".to_string(),
        }
    }

    #[test]
    fn create_then_delete_leaves_gravestone() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();

        fixture.set_time(1_000);
        let album = db.add_album(alice.user_id, album_params("a1")).unwrap();
        assert_eq!(album.date_modified, 1_000);
        assert!(!album.is_shared);
        assert!(matches!(
            db.add_album(alice.user_id, album_params("a1")),
            Err(ApiError::Exists)
        ));

        fixture.set_time(2_000);
        db.delete_album(alice.user_id, "a1").unwrap();

        let manifest: AlbumManifest = db.store.read(&db::manifest_file(alice.user_id)).unwrap();
        assert!(manifest.albums.is_empty());
        assert_eq!(manifest.deletes.len(), 1);
        assert_eq!(manifest.deletes[0].kind, DeleteKind::Album);
        assert_eq!(manifest.deletes[0].album_id.as_deref(), Some("a1"));
        assert_eq!(manifest.deletes[0].date, 2_000);

        assert!(!db
            .store
            .exists(&db::album_file(alice.user_id, "a1")));
    }

    #[test]
    fn share_re_share_unshare() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();
        let bob = db.add_user(new_user("bob@example.com")).unwrap();
        let carol = db.add_user(new_user("carol@example.com")).unwrap();

        fixture.set_time(1_000);
        db.add_album(alice.user_id, album_params("album")).unwrap();

        fixture.set_time(2_000);
        let mut share = ShareList::default();
        share.members = vec![bob.user_id];
        share
            .sharing_keys
            .insert(bob.user_id, "Bob's Sharing Key".to_string());
        share.permissions = Some(Permissions::parse("1111").unwrap());
        db.share_album(alice.user_id, "album", share).unwrap();

        let bob_manifest: AlbumManifest =
            db.store.read(&db::manifest_file(bob.user_id)).unwrap();
        let bob_copy = &bob_manifest.remote_albums["album"];
        assert_eq!(bob_copy.enc_private_key, "Bob's Sharing Key");
        assert_eq!(
            bob_copy.members,
            [alice.user_id, bob.user_id]
                .iter()
                .copied()
                .collect::<BTreeSet<i32>>()
        );
        assert!(bob_copy.sharing_keys.is_empty());

        let bob_contacts: ContactList =
            db.store.read(&db::contacts_file(bob.user_id)).unwrap();
        assert!(bob_contacts.contacts.contains_key(&alice.user_id));

        // Bob re-shares to carol; his permission change attempt is ignored.
        fixture.set_time(3_000);
        let mut reshare = ShareList::default();
        reshare.members = vec![carol.user_id];
        reshare
            .sharing_keys
            .insert(carol.user_id, "Carol's Sharing Key".to_string());
        reshare.permissions = Some(Permissions::parse("0000").unwrap());
        db.share_album(bob.user_id, "album", reshare).unwrap();

        let carol_manifest: AlbumManifest =
            db.store.read(&db::manifest_file(carol.user_id)).unwrap();
        let carol_copy = &carol_manifest.remote_albums["album"];
        assert_eq!(carol_copy.enc_private_key, "Carol's Sharing Key");
        assert_eq!(
            carol_copy.members,
            [alice.user_id, bob.user_id, carol.user_id]
                .iter()
                .copied()
                .collect::<BTreeSet<i32>>()
        );

        let carol_contacts: ContactList =
            db.store.read(&db::contacts_file(carol.user_id)).unwrap();
        assert!(carol_contacts.contacts.contains_key(&alice.user_id));
        assert!(carol_contacts.contacts.contains_key(&bob.user_id));

        let alice_manifest: AlbumManifest =
            db.store.read(&db::manifest_file(alice.user_id)).unwrap();
        let owned = &alice_manifest.albums["album"];
        assert_eq!(owned.permissions.as_str(), "1111");
        assert_eq!(owned.members.len(), 3);
        assert!(owned.is_shared);

        fixture.set_time(4_000);
        let album = db.unshare_album(alice.user_id, "album").unwrap();
        assert!(!album.is_shared);
        assert!(album.members.is_empty());
        assert_eq!(album.members_string(), "");

        for former in &[bob.user_id, carol.user_id] {
            let manifest: AlbumManifest =
                db.store.read(&db::manifest_file(*former)).unwrap();
            assert!(!manifest.remote_albums.contains_key("album"));
            let event = manifest.deletes.last().unwrap();
            assert_eq!(event.kind, DeleteKind::Album);
            assert_eq!(event.album_id.as_deref(), Some("album"));
            assert_eq!(event.date, 4_000);
        }
    }

    #[test]
    fn resharing_requires_permission() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();
        let bob = db.add_user(new_user("bob@example.com")).unwrap();
        let carol = db.add_user(new_user("carol@example.com")).unwrap();

        db.add_album(alice.user_id, album_params("album")).unwrap();

        let mut share = ShareList::default();
        share.members = vec![bob.user_id];
        share
            .sharing_keys
            .insert(bob.user_id, "bob key".to_string());
        share.permissions = Some(Permissions::parse("1011").unwrap());
        db.share_album(alice.user_id, "album", share).unwrap();

        let mut reshare = ShareList::default();
        reshare.members = vec![carol.user_id];
        reshare
            .sharing_keys
            .insert(carol.user_id, "carol key".to_string());
        assert!(matches!(
            db.share_album(bob.user_id, "album", reshare),
            Err(ApiError::Forbidden)
        ));
    }

    #[test]
    fn leave_and_remove_member() {
        let fixture = test_db();
        let db = &fixture.db;
        let alice = db.add_user(new_user("alice@example.com")).unwrap();
        let bob = db.add_user(new_user("bob@example.com")).unwrap();
        let carol = db.add_user(new_user("carol@example.com")).unwrap();

        db.add_album(alice.user_id, album_params("album")).unwrap();
        let mut share = ShareList::default();
        share.members = vec![bob.user_id, carol.user_id];
        share
            .sharing_keys
            .insert(bob.user_id, "bob key".to_string());
        share
            .sharing_keys
            .insert(carol.user_id, "carol key".to_string());
        db.share_album(alice.user_id, "album", share).unwrap();

        fixture.set_time(9_000);
        db.leave_album(bob.user_id, "album").unwrap();
        let bob_manifest: AlbumManifest =
            db.store.read(&db::manifest_file(bob.user_id)).unwrap();
        assert!(!bob_manifest.remote_albums.contains_key("album"));
        assert_eq!(bob_manifest.deletes.last().unwrap().kind, DeleteKind::Album);

        db.remove_album_member(alice.user_id, "album", carol.user_id)
            .unwrap();
        let carol_manifest: AlbumManifest =
            db.store.read(&db::manifest_file(carol.user_id)).unwrap();
        assert!(!carol_manifest.remote_albums.contains_key("album"));

        let alice_manifest: AlbumManifest =
            db.store.read(&db::manifest_file(alice.user_id)).unwrap();
        let album = &alice_manifest.albums["album"];
        assert_eq!(
            album.members,
            [alice.user_id].iter().copied().collect::<BTreeSet<i32>>()
        );

        assert!(matches!(
            db.remove_album_member(bob.user_id, "album", carol.user_id),
            Err(ApiError::NotFound)
        ));
    }
}
