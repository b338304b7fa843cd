//! Master-key vault.
//!
//! One 32-byte symmetric key encrypts every persistent record and wraps the
//! per-user leaf keys. On disk the master key itself is wrapped under a
//! passphrase-derived key:
//!
//! `version(1) | salt(16) | iterations(u32 le) | nonce(12) | AES-256-GCM(key)`
//!
//! Records are encrypted as `iv(16) | AES-256-CBC(pad || plain || tail) |
//! HMAC-SHA-256(iv || ciphertext)`. The pad byte N in 1..=16 brings the total
//! to a multiple of the block size and the N trailing bytes are random, so
//! very short values cannot be fingerprinted by length. The GCM wrap and the
//! CBC+HMAC record scheme deliberately never share a key domain.

use crate::error::{ApiError, ApiResult};
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, Rng};
use sha2::Sha256;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_SIZE: usize = 32;
/// Length of `new_encrypted_key` output: iv + three blocks + mac.
pub const ENCRYPTED_KEY_SIZE: usize = 96;

const WRAP_VERSION: u8 = 1;
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const GCM_TAG_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const BLOCK_SIZE: usize = 16;

const PBKDF2_ITERATIONS: u32 = 200_000;
/// Developer mode: an empty passphrase is not worth stretching.
const PBKDF2_ITERATIONS_DEV: u32 = 10;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn create() -> MasterKey {
        MasterKey {
            bytes: thread_rng().gen(),
        }
    }

    /// Wrap the key under `passphrase` and write it to `path`.
    pub fn save(&self, passphrase: &str, path: &Path) -> ApiResult<()> {
        let salt: [u8; SALT_SIZE] = thread_rng().gen();
        let iterations = iteration_count(passphrase);
        let mut kek = derive_key(passphrase, &salt, iterations);
        let nonce: [u8; NONCE_SIZE] = thread_rng().gen();
        let sealed = seal(&kek, &nonce, &self.bytes)?;
        kek.zeroize();

        let mut out = Vec::with_capacity(1 + SALT_SIZE + 4 + NONCE_SIZE + sealed.len());
        out.push(WRAP_VERSION);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&iterations.to_le_bytes());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);

        let mut file = File::create(path)?;
        file.write_all(&out)?;
        file.sync_all()?;
        Ok(())
    }

    /// Load and unwrap the key from `path`. A wrong passphrase fails with
    /// `BadMac`.
    pub fn read(passphrase: &str, path: &Path) -> ApiResult<MasterKey> {
        let mut data = vec![];
        File::open(path)?.read_to_end(&mut data)?;

        let header = 1 + SALT_SIZE + 4 + NONCE_SIZE;
        if data.len() != header + KEY_SIZE + GCM_TAG_SIZE {
            return Err(ApiError::Corrupt("master key file length"));
        }
        if data[0] != WRAP_VERSION {
            return Err(ApiError::Corrupt("master key version"));
        }

        let salt = &data[1..1 + SALT_SIZE];
        let mut iterations = [0u8; 4];
        iterations.copy_from_slice(&data[1 + SALT_SIZE..1 + SALT_SIZE + 4]);
        let iterations = u32::from_le_bytes(iterations);
        let nonce = &data[1 + SALT_SIZE + 4..header];
        let sealed = &data[header..];

        let mut kek = derive_key(passphrase, salt, iterations);
        let plain = open_sealed(&kek, nonce, sealed)?;
        kek.zeroize();

        if plain.len() != KEY_SIZE {
            return Err(ApiError::Corrupt("master key length"));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&plain);
        Ok(MasterKey { bytes })
    }

    /// Encrypt-then-MAC a record payload.
    pub fn encrypt(&self, plain: &[u8]) -> ApiResult<Vec<u8>> {
        let pad = BLOCK_SIZE - (plain.len() + 1) % BLOCK_SIZE;

        let mut padded = Vec::with_capacity(plain.len() + 1 + pad);
        padded.push(pad as u8);
        padded.extend_from_slice(plain);
        let tail = padded.len();
        padded.resize(tail + pad, 0);
        thread_rng().fill(&mut padded[tail..]);

        let iv: [u8; IV_SIZE] = thread_rng().gen();
        let cipher = Aes256CbcEnc::new_from_slices(&self.bytes, &iv).expect("key and iv sizes");
        let ciphertext = cipher.encrypt_padded_vec_mut::<NoPadding>(&padded);
        padded.zeroize();

        let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len() + MAC_SIZE);
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        let mac = self.hash(&out);
        out.extend_from_slice(&mac);
        Ok(out)
    }

    /// Verify and decrypt a record payload. Never returns partially verified
    /// bytes: the MAC check runs over the whole encrypted prefix first.
    pub fn decrypt(&self, data: &[u8]) -> ApiResult<Vec<u8>> {
        if data.len() < IV_SIZE + BLOCK_SIZE + MAC_SIZE {
            return Err(ApiError::ShortCiphertext);
        }

        let (body, tag) = data.split_at(data.len() - MAC_SIZE);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.bytes).expect("hmac key size");
        mac.update(body);
        if mac.verify_slice(tag).is_err() {
            return Err(ApiError::BadMac);
        }

        let (iv, ciphertext) = body.split_at(IV_SIZE);
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(ApiError::Corrupt("ciphertext length"));
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.bytes, iv).expect("key and iv sizes");
        let padded = cipher
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| ApiError::Corrupt("block decrypt"))?;

        let pad = padded[0] as usize;
        if pad < 1 || pad > BLOCK_SIZE || pad + 1 > padded.len() {
            return Err(ApiError::Corrupt("padding"));
        }
        Ok(padded[1..padded.len() - pad].to_vec())
    }

    /// Keyed hash, used for token digests. Same key domain as the record
    /// MAC, matching the on-disk format.
    pub fn hash(&self, data: &[u8]) -> [u8; MAC_SIZE] {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.bytes).expect("hmac key size");
        mac.update(data);
        mac.finalize().into_bytes().into()
    }

    /// Generate a fresh 32-byte leaf key and return it encrypted under the
    /// master key. The result is always `ENCRYPTED_KEY_SIZE` bytes.
    pub fn new_encrypted_key(&self) -> ApiResult<Vec<u8>> {
        let mut fresh: [u8; KEY_SIZE] = thread_rng().gen();
        let sealed = self.encrypt(&fresh)?;
        fresh.zeroize();
        debug_assert_eq!(sealed.len(), ENCRYPTED_KEY_SIZE);
        Ok(sealed)
    }

    /// Unwrap a leaf key produced by `new_encrypted_key`.
    pub fn decrypt_key(&self, data: &[u8]) -> ApiResult<[u8; KEY_SIZE]> {
        if data.len() != ENCRYPTED_KEY_SIZE {
            return Err(ApiError::Corrupt("encrypted key size"));
        }
        let mut plain = self.decrypt(data)?;
        if plain.len() != KEY_SIZE {
            return Err(ApiError::Corrupt("leaf key size"));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&plain);
        plain.zeroize();
        Ok(key)
    }
}

fn iteration_count(passphrase: &str) -> u32 {
    if passphrase.is_empty() {
        PBKDF2_ITERATIONS_DEV
    } else {
        PBKDF2_ITERATIONS
    }
}

fn derive_key(passphrase: &str, salt: &[u8], iterations: u32) -> [u8; KEY_SIZE] {
    let mut kek = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, &mut kek);
    kek
}

fn seal(kek: &[u8; KEY_SIZE], nonce: &[u8], plain: &[u8]) -> ApiResult<Vec<u8>> {
    use aes_gcm::aead::Aead;
    use aes_gcm::{Aes256Gcm, KeyInit, Nonce};

    let cipher = Aes256Gcm::new_from_slice(kek).expect("kek size");
    cipher
        .encrypt(Nonce::from_slice(nonce), plain)
        .map_err(|_| ApiError::Corrupt("seal"))
}

fn open_sealed(kek: &[u8; KEY_SIZE], nonce: &[u8], sealed: &[u8]) -> ApiResult<Vec<u8>> {
    use aes_gcm::aead::Aead;
    use aes_gcm::{Aes256Gcm, KeyInit, Nonce};

    let cipher = Aes256Gcm::new_from_slice(kek).expect("kek size");
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| ApiError::BadMac)
}
