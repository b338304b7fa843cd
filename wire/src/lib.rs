//! Protocol types shared between the server core and its clients.
//!
//! Every numeric field crosses the wire as a string, and the key names are
//! fixed by the deployed client; renaming a field here is a protocol break.

use serde::{Deserialize, Serialize};
use std::borrow::Cow;

pub trait IntoOwned {
    type Owned;
    fn into_owned(self) -> Self::Owned;
}

pub const STATUS_OK: &str = "ok";
pub const STATUS_NOK: &str = "nok";

/// The envelope of every response. `parts` carries the endpoint-specific
/// payload; `infos` and `errors` are human-readable messages.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Envelope {
    pub status: String,
    pub parts: serde_json::Map<String, serde_json::Value>,
    pub infos: Vec<String>,
    pub errors: Vec<String>,
}

impl Envelope {
    pub fn ok() -> Envelope {
        Envelope {
            status: STATUS_OK.to_string(),
            parts: serde_json::Map::new(),
            infos: vec![],
            errors: vec![],
        }
    }

    pub fn nok() -> Envelope {
        Envelope {
            status: STATUS_NOK.to_string(),
            parts: serde_json::Map::new(),
            infos: vec![],
            errors: vec![],
        }
    }

    /// A NOK that instructs the client to drop its session.
    pub fn logout() -> Envelope {
        let mut envelope = Envelope::nok();
        envelope.parts.insert(
            "logout".to_string(),
            serde_json::Value::String("1".to_string()),
        );
        envelope
    }

    pub fn part<T: Serialize>(mut self, name: &str, value: &T) -> serde_json::Result<Envelope> {
        let value = serde_json::to_value(value)?;
        self.parts.insert(name.to_string(), value);
        Ok(self)
    }

    pub fn error(mut self, message: &str) -> Envelope {
        self.errors.push(message.to_string());
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// The six per-stream cursors of a `getUpdates` request, as they arrive in
/// the params bag.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CursorSet<'a> {
    #[serde(rename = "filesST", borrow)]
    pub files_st: Cow<'a, str>,
    #[serde(rename = "trashST", borrow)]
    pub trash_st: Cow<'a, str>,
    #[serde(rename = "albumsST", borrow)]
    pub albums_st: Cow<'a, str>,
    #[serde(rename = "albumFilesST", borrow)]
    pub album_files_st: Cow<'a, str>,
    #[serde(rename = "cntST", borrow)]
    pub contacts_st: Cow<'a, str>,
    #[serde(rename = "delST", borrow)]
    pub deletes_st: Cow<'a, str>,
}

impl<'a> CursorSet<'a> {
    /// Millisecond timestamps, in stream order. `None` if any cursor is not
    /// an integer.
    pub fn parse(&self) -> Option<[i64; 6]> {
        Some([
            self.files_st.parse().ok()?,
            self.trash_st.parse().ok()?,
            self.albums_st.parse().ok()?,
            self.album_files_st.parse().ok()?,
            self.contacts_st.parse().ok()?,
            self.deletes_st.parse().ok()?,
        ])
    }
}

impl<'a> IntoOwned for CursorSet<'a> {
    type Owned = CursorSet<'static>;

    fn into_owned(self) -> Self::Owned {
        CursorSet {
            files_st: Cow::Owned(self.files_st.into_owned()),
            trash_st: Cow::Owned(self.trash_st.into_owned()),
            albums_st: Cow::Owned(self.albums_st.into_owned()),
            album_files_st: Cow::Owned(self.album_files_st.into_owned()),
            contacts_st: Cow::Owned(self.contacts_st.into_owned()),
            deletes_st: Cow::Owned(self.deletes_st.into_owned()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AlbumRecord<'a> {
    #[serde(rename = "albumId", borrow)]
    pub album_id: Cow<'a, str>,
    #[serde(rename = "encPrivateKey", borrow)]
    pub enc_private_key: Cow<'a, str>,
    #[serde(borrow)]
    pub metadata: Cow<'a, str>,
    #[serde(rename = "publicKey", borrow)]
    pub public_key: Cow<'a, str>,
    #[serde(rename = "dateCreated", borrow)]
    pub date_created: Cow<'a, str>,
    #[serde(rename = "dateModified", borrow)]
    pub date_modified: Cow<'a, str>,
    #[serde(rename = "isOwner", borrow)]
    pub is_owner: Cow<'a, str>,
    #[serde(rename = "isShared", borrow)]
    pub is_shared: Cow<'a, str>,
    #[serde(rename = "isHidden", borrow)]
    pub is_hidden: Cow<'a, str>,
    #[serde(rename = "isLocked", borrow)]
    pub is_locked: Cow<'a, str>,
    #[serde(borrow)]
    pub permissions: Cow<'a, str>,
    #[serde(borrow)]
    pub members: Cow<'a, str>,
    #[serde(borrow)]
    pub cover: Cow<'a, str>,
}

impl<'a> IntoOwned for AlbumRecord<'a> {
    type Owned = AlbumRecord<'static>;

    fn into_owned(self) -> Self::Owned {
        AlbumRecord {
            album_id: Cow::Owned(self.album_id.into_owned()),
            enc_private_key: Cow::Owned(self.enc_private_key.into_owned()),
            metadata: Cow::Owned(self.metadata.into_owned()),
            public_key: Cow::Owned(self.public_key.into_owned()),
            date_created: Cow::Owned(self.date_created.into_owned()),
            date_modified: Cow::Owned(self.date_modified.into_owned()),
            is_owner: Cow::Owned(self.is_owner.into_owned()),
            is_shared: Cow::Owned(self.is_shared.into_owned()),
            is_hidden: Cow::Owned(self.is_hidden.into_owned()),
            is_locked: Cow::Owned(self.is_locked.into_owned()),
            permissions: Cow::Owned(self.permissions.into_owned()),
            members: Cow::Owned(self.members.into_owned()),
            cover: Cow::Owned(self.cover.into_owned()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FileRecord<'a> {
    #[serde(borrow)]
    pub file: Cow<'a, str>,
    #[serde(borrow)]
    pub version: Cow<'a, str>,
    #[serde(borrow)]
    pub headers: Cow<'a, str>,
    #[serde(rename = "dateCreated", borrow)]
    pub date_created: Cow<'a, str>,
    #[serde(rename = "dateModified", borrow)]
    pub date_modified: Cow<'a, str>,
    #[serde(
        rename = "albumId",
        borrow,
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub album_id: Option<Cow<'a, str>>,
}

impl<'a> IntoOwned for FileRecord<'a> {
    type Owned = FileRecord<'static>;

    fn into_owned(self) -> Self::Owned {
        FileRecord {
            file: Cow::Owned(self.file.into_owned()),
            version: Cow::Owned(self.version.into_owned()),
            headers: Cow::Owned(self.headers.into_owned()),
            date_created: Cow::Owned(self.date_created.into_owned()),
            date_modified: Cow::Owned(self.date_modified.into_owned()),
            album_id: self.album_id.map(|id| Cow::Owned(id.into_owned())),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContactRecord<'a> {
    #[serde(rename = "userId", borrow)]
    pub user_id: Cow<'a, str>,
    #[serde(borrow)]
    pub email: Cow<'a, str>,
    #[serde(rename = "publicKey", borrow)]
    pub public_key: Cow<'a, str>,
    #[serde(rename = "dateModified", borrow)]
    pub date_modified: Cow<'a, str>,
}

impl<'a> IntoOwned for ContactRecord<'a> {
    type Owned = ContactRecord<'static>;

    fn into_owned(self) -> Self::Owned {
        ContactRecord {
            user_id: Cow::Owned(self.user_id.into_owned()),
            email: Cow::Owned(self.email.into_owned()),
            public_key: Cow::Owned(self.public_key.into_owned()),
            date_modified: Cow::Owned(self.date_modified.into_owned()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeleteRecord<'a> {
    #[serde(borrow)]
    pub file: Cow<'a, str>,
    #[serde(rename = "albumId", borrow)]
    pub album_id: Cow<'a, str>,
    #[serde(borrow)]
    pub date: Cow<'a, str>,
    #[serde(rename = "type", borrow)]
    pub kind: Cow<'a, str>,
}

impl<'a> IntoOwned for DeleteRecord<'a> {
    type Owned = DeleteRecord<'static>;

    fn into_owned(self) -> Self::Owned {
        DeleteRecord {
            file: Cow::Owned(self.file.into_owned()),
            album_id: Cow::Owned(self.album_id.into_owned()),
            date: Cow::Owned(self.date.into_owned()),
            kind: Cow::Owned(self.kind.into_owned()),
        }
    }
}

/// The payload of a `getUpdates` response, one list per stream.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct UpdateSet<'a> {
    #[serde(borrow)]
    pub albums: Vec<AlbumRecord<'a>>,
    #[serde(borrow)]
    pub files: Vec<FileRecord<'a>>,
    #[serde(borrow)]
    pub trash: Vec<FileRecord<'a>>,
    #[serde(rename = "albumFiles", borrow)]
    pub album_files: Vec<FileRecord<'a>>,
    #[serde(borrow)]
    pub contacts: Vec<ContactRecord<'a>>,
    #[serde(borrow)]
    pub deletes: Vec<DeleteRecord<'a>>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let envelope = Envelope::ok().part("token", &"abc").unwrap();

        let json = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();

        assert!(back.is_ok());
        assert_eq!(back.parts["token"], "abc");
    }

    #[test]
    fn logout_marker() {
        let envelope = Envelope::logout();
        assert_eq!(envelope.status, STATUS_NOK);
        assert_eq!(envelope.parts["logout"], "1");
    }

    #[test]
    fn cursors_parse() {
        let json = concat!(
            r#"{"filesST":"0","trashST":"10","albumsST":"20","#,
            r#""albumFilesST":"30","cntST":"40","delST":"50"}"#,
        );
        let cursors: CursorSet = serde_json::from_str(json).unwrap();
        assert_eq!(cursors.parse(), Some([0, 10, 20, 30, 40, 50]));

        let owned = cursors.into_owned();
        assert_eq!(&owned.deletes_st, "50");
    }

    #[test]
    fn delete_record_keys() {
        let record = DeleteRecord {
            file: Cow::from("photo.jpg"),
            album_id: Cow::from("a1"),
            date: Cow::from("2000"),
            kind: Cow::from("4"),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(
            json,
            r#"{"file":"photo.jpg","albumId":"a1","date":"2000","type":"4"}"#
        );
    }
}
