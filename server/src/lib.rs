//! Server core of an end-to-end-encrypted photo and album sharing service.
//!
//! Clients hold the only copies of user secret keys; this crate stores
//! opaque ciphertext and the sharing state around it. The HTTP adapter is a
//! thin external collaborator: it authenticates a request, decodes the
//! params bag, and issues exactly one logical operation against [`Db`].
//!
//! Layering, bottom up: [`crypto`] (master-key vault), [`store`] (encrypted
//! transactional object store), [`blob`] (content-addressed blob pool),
//! then [`user`], [`album`] and [`fileset`] for the data model, with
//! [`sync`] computing the incremental `getUpdates` response on top.

pub mod album;
pub mod blob;
pub mod crypto;
pub mod db;
pub mod error;
pub mod fileset;
pub mod store;
pub mod sync;
pub mod user;

pub use crate::db::Db;
pub use crate::error::{ApiError, ApiResult};
