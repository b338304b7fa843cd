//! Users, the user directory, session-token state and contact lists.

use crate::album::AlbumManifest;
use crate::db::{self, Db, TX_ATTEMPTS, USERS_FILE};
use crate::error::{ApiError, ApiResult};
use crate::fileset::FileSet;
use crate::sync::DeleteEvent;
use log::info;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Allocated user ids start here; everything below is reserved.
pub const MIN_USER_ID: i32 = 1_000_000;

const ID_ATTEMPTS: usize = 32;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct User {
    pub user_id: i32,
    pub email: String,
    pub hashed_password: String,
    /// Client-side KDF salt, opaque to the server.
    pub salt: String,
    /// Encrypted client key material, opaque.
    pub key_bundle: String,
    /// Client-owned flag; the server stores it verbatim.
    pub is_backup: String,
    pub public_key: String,
    /// Per-user server secret key, wrapped under the master key.
    pub server_key: Vec<u8>,
    /// Per-user token MAC key, wrapped under the master key.
    pub token_key: Vec<u8>,
    /// Hashes of the currently valid session tokens.
    pub valid_tokens: BTreeSet<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UserEntry {
    pub user_id: i32,
    pub email: String,
}

/// The encrypted user directory (`users.dat`).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UserList {
    pub users: Vec<UserEntry>,
}

impl UserList {
    fn by_email(&self, email: &str) -> Option<&UserEntry> {
        self.users.iter().find(|entry| entry.email == email)
    }

    fn contains_id(&self, user_id: i32) -> bool {
        self.users.iter().any(|entry| entry.user_id == user_id)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Contact {
    pub user_id: i32,
    pub email: String,
    pub public_key: String,
    pub date_modified: i64,
}

/// Per-user contact state. `held_by` is the reverse index: the users whose
/// `contacts` map includes this user. Both sides of an entry are created and
/// removed in one transaction, so `A.contacts[B]` exists iff `B.held_by[A]`.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ContactList {
    pub contacts: BTreeMap<i32, Contact>,
    pub held_by: BTreeSet<i32>,
    pub deletes: Vec<DeleteEvent>,
}

/// Registration parameters, decoded by the adapter.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub email: String,
    pub password: String,
    pub salt: String,
    pub key_bundle: String,
    pub public_key: String,
    pub is_backup: String,
}

fn hash_password(password: &[u8], config: &argon2::Config) -> ApiResult<String> {
    let salt: [u8; 32] = thread_rng().gen();
    let hash = argon2::hash_encoded(password, &salt, config)?;
    Ok(hash)
}

fn verify_password(hash: &str, password: &str) -> ApiResult<()> {
    if !argon2::verify_encoded(hash, password.as_bytes())? {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

impl Db {
    /// Register a user: allocate a random id at or above `MIN_USER_ID`,
    /// wrap fresh server and token keys, and create the home records. The
    /// id and email checks run inside the directory transaction so two
    /// registrations cannot collide.
    pub fn add_user(&self, new: NewUser) -> ApiResult<User> {
        if new.email.is_empty() || !new.email.contains('@') {
            return Err(ApiError::BadRequest("invalid email"));
        }
        let hashed_password = hash_password(new.password.as_bytes(), &self.argon)?;

        for _ in 0..ID_ATTEMPTS {
            let candidate = MIN_USER_ID + thread_rng().gen_range(0..i32::MAX - MIN_USER_ID);

            let names = [
                USERS_FILE.to_string(),
                db::user_file(candidate),
                db::manifest_file(candidate),
                db::contacts_file(candidate),
                db::gallery_file(candidate),
                db::trash_file(candidate),
            ];
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tx = self.store.update_many(&refs)?;

            let mut directory: UserList = tx.read(USERS_FILE)?;
            if directory.by_email(&new.email).is_some() {
                return Err(ApiError::EmailTaken);
            }
            if directory.contains_id(candidate) {
                continue;
            }

            let user = User {
                user_id: candidate,
                email: new.email.clone(),
                hashed_password: hashed_password.clone(),
                salt: new.salt.clone(),
                key_bundle: new.key_bundle.clone(),
                is_backup: new.is_backup.clone(),
                public_key: new.public_key.clone(),
                server_key: self.master_key().new_encrypted_key()?,
                token_key: self.master_key().new_encrypted_key()?,
                valid_tokens: BTreeSet::new(),
            };

            directory.users.push(UserEntry {
                user_id: candidate,
                email: new.email.clone(),
            });

            tx.put(USERS_FILE, &directory)?;
            tx.put(&names[1], &user)?;
            tx.put(&names[2], &AlbumManifest::default())?;
            tx.put(&names[3], &ContactList::default())?;
            tx.put(&names[4], &FileSet::default())?;
            tx.put(&names[5], &FileSet::default())?;
            tx.commit()?;

            info!("registered user {}", candidate);
            return Ok(user);
        }

        Err(ApiError::Conflict)
    }

    pub fn user_by_id(&self, user_id: i32) -> ApiResult<User> {
        self.store.read(&db::user_file(user_id))
    }

    pub fn user_by_email(&self, email: &str) -> ApiResult<User> {
        let directory: UserList = self.store.read(USERS_FILE)?;
        let entry = directory.by_email(email).ok_or(ApiError::NotFound)?;
        self.user_by_id(entry.user_id)
    }

    /// Password check behind the login endpoint.
    pub fn authenticate(&self, email: &str, password: &str) -> ApiResult<User> {
        let user = match self.user_by_email(email) {
            Ok(user) => user,
            Err(ApiError::NotFound) => return Err(ApiError::Unauthorized),
            Err(error) => return Err(error),
        };
        verify_password(&user.hashed_password, password)?;
        Ok(user)
    }

    /// Mutate a user record under its lock. An email change is propagated to
    /// the directory and to the contact entry of every holder.
    pub fn update_user<F>(&self, user_id: i32, apply: F) -> ApiResult<User>
    where
        F: Fn(&mut User),
    {
        for _ in 0..TX_ATTEMPTS {
            let snapshot: ContactList = self.store.read(&db::contacts_file(user_id))?;

            let mut names = vec![
                USERS_FILE.to_string(),
                db::user_file(user_id),
                db::contacts_file(user_id),
            ];
            names.extend(snapshot.held_by.iter().map(|id| db::contacts_file(*id)));
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tx = self.store.update_many(&refs)?;

            let current: ContactList = tx.read(&db::contacts_file(user_id))?;
            if current.held_by != snapshot.held_by {
                continue;
            }

            let mut user: User = tx.read(&db::user_file(user_id))?;
            let previous_email = user.email.clone();
            apply(&mut user);
            user.user_id = user_id;

            if user.email != previous_email {
                if user.email.is_empty() || !user.email.contains('@') {
                    return Err(ApiError::BadRequest("invalid email"));
                }
                let mut directory: UserList = tx.read(USERS_FILE)?;
                if directory.by_email(&user.email).is_some() {
                    return Err(ApiError::EmailTaken);
                }
                for entry in &mut directory.users {
                    if entry.user_id == user_id {
                        entry.email = user.email.clone();
                    }
                }
                tx.put(USERS_FILE, &directory)?;

                let now = self.now();
                for holder in &current.held_by {
                    let name = db::contacts_file(*holder);
                    let mut list: ContactList = tx.read(&name)?;
                    if let Some(contact) = list.contacts.get_mut(&user_id) {
                        contact.email = user.email.clone();
                        contact.date_modified = now;
                    }
                    tx.put(&name, &list)?;
                }
            }

            tx.put(&db::user_file(user_id), &user)?;
            tx.commit()?;
            return Ok(user);
        }

        Err(ApiError::Conflict)
    }

    /// Unwrap the per-user token MAC key.
    pub fn token_key_for(&self, user_id: i32) -> ApiResult<[u8; 32]> {
        let user = self.user_by_id(user_id)?;
        self.master_key().decrypt_key(&user.token_key)
    }

    /// Unwrap the per-user server secret key (the adapter opens the request
    /// envelope with it).
    pub fn server_key_for(&self, user_id: i32) -> ApiResult<[u8; 32]> {
        let user = self.user_by_id(user_id)?;
        self.master_key().decrypt_key(&user.server_key)
    }

    pub fn add_token(&self, user_id: i32, token: &str) -> ApiResult<()> {
        self.mutate_tokens(user_id, token, |tokens, digest| {
            tokens.insert(digest);
        })
    }

    pub fn remove_token(&self, user_id: i32, token: &str) -> ApiResult<()> {
        self.mutate_tokens(user_id, token, |tokens, digest| {
            tokens.remove(&digest);
        })
    }

    pub fn clear_tokens(&self, user_id: i32) -> ApiResult<()> {
        let name = db::user_file(user_id);
        let mut tx = self.store.update(&name)?;
        let mut user: User = tx.read(&name)?;
        user.valid_tokens.clear();
        tx.put(&name, &user)?;
        tx.commit()
    }

    pub fn is_valid_token(&self, user_id: i32, token: &str) -> ApiResult<bool> {
        let user = self.user_by_id(user_id)?;
        let digest = hex::encode(self.master_key().hash(token.as_bytes()));
        Ok(user.valid_tokens.contains(&digest))
    }

    /// Only the keyed hash of a token is ever persisted.
    fn mutate_tokens<F>(&self, user_id: i32, token: &str, apply: F) -> ApiResult<()>
    where
        F: FnOnce(&mut BTreeSet<String>, String),
    {
        let name = db::user_file(user_id);
        let mut tx = self.store.update(&name)?;
        let mut user: User = tx.read(&name)?;
        let digest = hex::encode(self.master_key().hash(token.as_bytes()));
        apply(&mut user.valid_tokens, digest);
        tx.put(&name, &user)?;
        tx.commit()
    }

    /// Add the user behind `email` to `user_id`'s contacts. Both lists are
    /// opened in one transaction and both directions are recorded, so the
    /// contact graph stays symmetric.
    pub fn add_contact(&self, user_id: i32, email: &str) -> ApiResult<Contact> {
        let target = self.user_by_email(email)?;
        if target.user_id == user_id {
            return Err(ApiError::BadRequest("cannot add self as contact"));
        }
        let caller = self.user_by_id(user_id)?;

        let caller_name = db::contacts_file(user_id);
        let target_name = db::contacts_file(target.user_id);
        let mut tx = self.store.update_many(&[&caller_name, &target_name])?;

        let mut caller_list: ContactList = tx.read(&caller_name)?;
        let mut target_list: ContactList = tx.read(&target_name)?;

        let now = self.now();
        let added = Contact {
            user_id: target.user_id,
            email: target.email.clone(),
            public_key: target.public_key.clone(),
            date_modified: now,
        };

        caller_list.contacts.insert(target.user_id, added.clone());
        caller_list.held_by.insert(target.user_id);
        target_list.contacts.insert(
            user_id,
            Contact {
                user_id,
                email: caller.email.clone(),
                public_key: caller.public_key.clone(),
                date_modified: now,
            },
        );
        target_list.held_by.insert(user_id);

        tx.put(&caller_name, &caller_list)?;
        tx.put(&target_name, &target_list)?;
        tx.commit()?;
        Ok(added)
    }

    /// Contacts changed since `since`, oldest first.
    pub fn contact_updates(&self, user_id: i32, since: i64) -> ApiResult<Vec<Contact>> {
        let list: ContactList = self.store.read(&db::contacts_file(user_id))?;
        let mut changed: Vec<Contact> = list
            .contacts
            .values()
            .filter(|contact| contact.date_modified > since)
            .cloned()
            .collect();
        changed.sort_by(|a, b| (a.date_modified, &a.email).cmp(&(b.date_modified, &b.email)));
        Ok(changed)
    }

    /// Drop every contact edge touching `user_id`, appending a gravestone of
    /// type `contact` on both sides of each removed entry. The user-deletion
    /// cascade runs through here before the user's own records go away.
    pub fn remove_all_contacts(&self, user_id: i32) -> ApiResult<()> {
        let own_name = db::contacts_file(user_id);

        for _ in 0..TX_ATTEMPTS {
            let snapshot: ContactList = self.store.read(&own_name)?;
            let peers: BTreeSet<i32> = snapshot
                .contacts
                .keys()
                .copied()
                .chain(snapshot.held_by.iter().copied())
                .collect();

            let mut names = vec![own_name.clone()];
            names.extend(peers.iter().map(|id| db::contacts_file(*id)));
            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            let mut tx = self.store.update_many(&refs)?;

            let mut own: ContactList = tx.read(&own_name)?;
            let current: BTreeSet<i32> = own
                .contacts
                .keys()
                .copied()
                .chain(own.held_by.iter().copied())
                .collect();
            if current != peers {
                continue;
            }

            let now = self.now();
            for peer in &peers {
                let name = db::contacts_file(*peer);
                let mut list: ContactList = tx.read(&name)?;
                if list.contacts.remove(&user_id).is_some() {
                    list.deletes.push(DeleteEvent::contact(user_id, now));
                }
                list.held_by.remove(&user_id);
                tx.put(&name, &list)?;

                if own.contacts.remove(peer).is_some() {
                    own.deletes.push(DeleteEvent::contact(*peer, now));
                }
                own.held_by.remove(peer);
            }

            tx.put(&own_name, &own)?;
            tx.commit()?;
            return Ok(());
        }

        Err(ApiError::Conflict)
    }

    /// Destroy an account. Owned albums are deleted (unsharing them first),
    /// joined albums are left, all contact edges are dropped, every blob the
    /// user's file sets reference is decremented, and the home records are
    /// removed from the directory and from disk.
    pub fn delete_user(&self, user_id: i32) -> ApiResult<()> {
        self.user_by_id(user_id)?;

        let manifest: AlbumManifest = self.store.read(&db::manifest_file(user_id))?;
        let owned: Vec<String> = manifest.albums.keys().cloned().collect();
        let joined: Vec<String> = manifest.remote_albums.keys().cloned().collect();
        for album_id in owned {
            self.delete_album(user_id, &album_id)?;
        }
        for album_id in joined {
            self.leave_album(user_id, &album_id)?;
        }

        self.remove_all_contacts(user_id)?;

        let names = [
            USERS_FILE.to_string(),
            db::user_file(user_id),
            db::manifest_file(user_id),
            db::contacts_file(user_id),
            db::gallery_file(user_id),
            db::trash_file(user_id),
            crate::blob::REFCOUNT_FILE.to_string(),
        ];
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut tx = self.store.update_many(&refs)?;

        let mut deltas: BTreeMap<String, i64> = BTreeMap::new();
        for set_name in &[&names[4], &names[5]] {
            let set: FileSet = tx.read(set_name)?;
            for file in set.files.values() {
                *deltas.entry(file.store_file.clone()).or_insert(0) -= 1;
                *deltas.entry(file.store_thumb.clone()).or_insert(0) -= 1;
            }
        }
        let zeroed = db::apply_ref_deltas(&mut tx, &deltas)?;

        let mut directory: UserList = tx.read(USERS_FILE)?;
        directory.users.retain(|entry| entry.user_id != user_id);
        tx.put(USERS_FILE, &directory)?;

        for name in &names[1..6] {
            tx.delete(name);
        }
        tx.commit()?;

        self.unlink_blobs(&zeroed);
        self.remove_home_dir(user_id);
        info!("deleted user {}", user_id);
        Ok(())
    }
}
