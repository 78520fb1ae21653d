//! Encrypted at-rest storage for the console session cookies.
//!
//! Layout on disk: `salt (16 bytes) || nonce (24 bytes) || ciphertext`.
//! The key is derived from the concatenated password and TOTP secret with
//! Argon2id, so the file is unreadable without the exact credential pair that
//! wrote it. There is no version marker: changing the derivation parameters
//! simply makes old files fail decryption.

use std::io::Write;
use std::path::{Path, PathBuf};

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

use super::jar::StoredCookie;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cookie file cannot be decrypted with the given credentials")]
    Decryption,

    #[error("Cookie encryption failed")]
    Encryption,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(argon2::Error),

    #[error("Cookie file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cookie data is not valid: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One encrypted cookie file, bound to a path.
pub struct CookieFile {
    path: PathBuf,
}

impl CookieFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and decrypt the cookie file. A missing file is not an error; a
    /// file that does not verify against the given credentials is.
    pub fn load(
        &self,
        password: &str,
        totp_secret: &str,
    ) -> Result<Option<Vec<StoredCookie>>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let blob = std::fs::read(&self.path)?;
        if blob.len() < SALT_LEN + NONCE_LEN {
            return Err(StoreError::Decryption);
        }

        let (salt, rest) = blob.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let key = derive_key(password, totp_secret, salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&*key));
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Decryption)?;

        let cookies: Vec<StoredCookie> = serde_json::from_slice(&plaintext)?;
        debug!(path = %self.path.display(), count = cookies.len(), "loaded cookies");
        Ok(Some(cookies))
    }

    /// Encrypt the cookies under a fresh salt and nonce and atomically replace
    /// the file so a crash mid-write never leaves a truncated file behind.
    pub fn save(
        &self,
        password: &str,
        totp_secret: &str,
        cookies: &[StoredCookie],
    ) -> Result<(), StoreError> {
        let plaintext = serde_json::to_vec(cookies)?;

        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let key = derive_key(password, totp_secret, &salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&*key));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| StoreError::Encryption)?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = match dir {
            Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
            None => tempfile::NamedTempFile::new_in(".")?,
        };
        tmp.write_all(&blob)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!(path = %self.path.display(), count = cookies.len(), "saved cookies");
        Ok(())
    }
}

/// Derive the symmetric key from the credential pair and salt. Deterministic
/// for a given (password, totp_secret, salt) triple.
fn derive_key(
    password: &str,
    totp_secret: &str,
    salt: &[u8],
) -> Result<Zeroizing<[u8; KEY_LEN]>, StoreError> {
    let mut input = Zeroizing::new(Vec::with_capacity(
        password.len() + totp_secret.len(),
    ));
    input.extend_from_slice(password.as_bytes());
    input.extend_from_slice(totp_secret.as_bytes());

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    Argon2::default()
        .hash_password_into(&input, salt, &mut *key)
        .map_err(StoreError::KeyDerivation)?;
    Ok(key)
}
