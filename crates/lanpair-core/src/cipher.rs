//! Group-code cipher.
//!
//! Certificates travel sealed under a key derived from the shared group code.
//! Sealed bytes are `nonce (24) || ciphertext+tag`; the text form used on the
//! wire is standard base64 of those bytes.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    #[error("sealed payload is too short")]
    Truncated,
    #[error("payload does not open with the current group code")]
    Mismatch,
    #[error("locked payload is not valid base64")]
    Encoding,
    #[error("payload could not be sealed")]
    Seal,
}

/// SHA-256 of the UTF-8 code.
pub fn derive_key(code: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let digest = Sha256::digest(code.as_bytes());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(&digest);
    key
}

pub fn seal(code: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    seal_with_key(&derive_key(code), plaintext)
}

pub fn open(code: &str, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
    open_with_key(&derive_key(code), sealed)
}

pub fn lock(code: &str, plaintext: &[u8]) -> Result<String, CipherError> {
    seal(code, plaintext).map(|sealed| STANDARD.encode(sealed))
}

/// Inverse of [`lock`]. Line breaks and other whitespace in `text` are ignored.
pub fn unlock(code: &str, text: &str) -> Result<Vec<u8>, CipherError> {
    open_with_key(&derive_key(code), &decode_text(text)?)
}

fn decode_text(text: &str) -> Result<Vec<u8>, CipherError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact).map_err(|_| CipherError::Encoding)
}

fn seal_with_key(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let aead = XChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let mut buf = plaintext.to_vec();
    aead.encrypt_in_place(&nonce, b"", &mut buf)
        .map_err(|_| CipherError::Seal)?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + buf.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&buf);
    Ok(sealed)
}

fn open_with_key(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CipherError::Truncated);
    }
    let aead = XChaCha20Poly1305::new(Key::from_slice(key));
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = XNonce::from_slice(nonce_bytes);

    let mut buf = ciphertext.to_vec();
    aead.decrypt_in_place(nonce, b"", &mut buf)
        .map_err(|_| CipherError::Mismatch)?;
    Ok(buf)
}

struct SecretState {
    code: String,
    key: Zeroizing<[u8; KEY_LEN]>,
}

/// Shared handle to the current group code and its derived key.
///
/// Clones see the same state, so a `set_code` is observed by every server and
/// exchange holding the handle. There is no grace period: payloads sealed under
/// the previous code stop opening immediately.
#[derive(Clone)]
pub struct GroupSecret {
    inner: Arc<RwLock<SecretState>>,
}

impl GroupSecret {
    pub fn new(code: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SecretState {
                code: code.to_string(),
                key: derive_key(code),
            })),
        }
    }

    pub fn code(&self) -> String {
        self.read(|state| state.code.clone())
    }

    /// Re-key. Returns false when the code is unchanged.
    pub fn set_code(&self, code: &str) -> bool {
        let mut state = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if state.code == code {
            return false;
        }
        state.code = code.to_string();
        state.key = derive_key(code);
        true
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.read(|state| seal_with_key(&state.key, plaintext))
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
        self.read(|state| open_with_key(&state.key, sealed))
    }

    pub fn lock(&self, plaintext: &[u8]) -> Result<String, CipherError> {
        self.seal(plaintext).map(|sealed| STANDARD.encode(sealed))
    }

    pub fn unlock(&self, text: &str) -> Result<Vec<u8>, CipherError> {
        let sealed = decode_text(text)?;
        self.open(&sealed)
    }

    fn read<R>(&self, f: impl FnOnce(&SecretState) -> R) -> R {
        let state = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }
}

impl std::fmt::Debug for GroupSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupSecret").finish_non_exhaustive()
    }
}
