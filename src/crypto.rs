//! Per-chunk hashing, key derivation and AEAD encryption (§4.1, §3 access list).
//!
//! Every chunk key is derived from the session key via HKDF-SHA256, keyed on
//! the chunk index, so no two chunks ever share key material even though they
//! share one session secret. Group wrapping uses the same derivation scheme
//! with a different salt/info pair (§3).

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};

pub const SESSION_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const GROUP_SECRET_LEN: usize = 32;

const CHUNK_KEY_SALT: &[u8] = b"witness-chunk";
const GROUP_WRAP_SALT: &[u8] = b"witness-protocol:group-key";
const GROUP_WRAP_INFO: &[u8] = b"AES-256-GCM-group-wrapping";

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

pub fn random_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

/// Derives the per-chunk AEAD key from the session key, as specified in §4.1:
/// `HKDF-SHA256(ikm=sessionKey, salt="witness-chunk", info=u32_be(chunkIndex), L=32)`.
pub fn derive_chunk_key(session_key: &[u8], chunk_index: u32) -> CoreResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(CHUNK_KEY_SALT), session_key);
    let mut out = [0u8; 32];
    hk.expand(&chunk_index.to_be_bytes(), &mut out)
        .map_err(|e| CoreError::CryptoFailure(format!("hkdf expand failed: {e}")))?;
    Ok(out)
}

/// Derives the key used to wrap/unwrap a session key for a given group's secret (§3).
pub fn derive_group_wrap_key(group_secret: &[u8]) -> CoreResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(Some(GROUP_WRAP_SALT), group_secret);
    let mut out = [0u8; 32];
    hk.expand(GROUP_WRAP_INFO, &mut out)
        .map_err(|e| CoreError::CryptoFailure(format!("hkdf expand failed: {e}")))?;
    Ok(out)
}

pub fn aes_gcm_encrypt(key: &[u8; 32], nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| CoreError::CryptoFailure(format!("AES-GCM encryption failed: {e}")))
}

pub fn aes_gcm_decrypt(key: &[u8; 32], nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> CoreResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| CoreError::CryptoFailure(format!("AES-GCM decryption failed: {e}")))
}

/// Wraps a 32-byte session key under a group's derived wrap key, returning
/// `(wrapped_key, wrap_iv)`.
pub fn wrap_session_key(session_key: &[u8; SESSION_KEY_LEN], group_secret: &[u8]) -> CoreResult<(Vec<u8>, [u8; NONCE_LEN])> {
    let wrap_key = derive_group_wrap_key(group_secret)?;
    let iv = random_nonce();
    let wrapped = aes_gcm_encrypt(&wrap_key, &iv, session_key)?;
    Ok((wrapped, iv))
}

/// Inverse of [`wrap_session_key`]; used during verification to recover the
/// session key from a matching group's secret.
pub fn unwrap_session_key(
    wrapped_key: &[u8],
    wrap_iv: &[u8; NONCE_LEN],
    group_secret: &[u8],
) -> CoreResult<[u8; SESSION_KEY_LEN]> {
    let wrap_key = derive_group_wrap_key(group_secret)?;
    let plaintext = aes_gcm_decrypt(&wrap_key, wrap_iv, wrapped_key)?;
    plaintext
        .try_into()
        .map_err(|_| CoreError::CryptoFailure("unwrapped session key has wrong length".into()))
}

pub fn hex_encode(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

pub fn hex_decode_32(s: &str) -> CoreResult<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| CoreError::CryptoFailure(format!("invalid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| CoreError::CryptoFailure("expected 32 bytes".into()))
}
