//! AES-256-GCM with the nonce stored in front of the ciphertext

use aws_lc_rs::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use ome_common::{Error, Result};

/// Length of an AES-256 key
pub const KEY_LEN: usize = 32;

fn crypto_error(msg: impl Into<String>) -> Error {
    Error::storage_permanent(msg)
}

fn key(key_bytes: &[u8]) -> Result<LessSafeKey> {
    if key_bytes.len() != KEY_LEN {
        return Err(crypto_error(format!(
            "expected a {KEY_LEN}-byte key, got {} bytes",
            key_bytes.len()
        )));
    }
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
        .map_err(|_| crypto_error("invalid AES-256-GCM key"))?;
    Ok(LessSafeKey::new(unbound))
}

/// Decrypt `nonce || ciphertext || tag`
pub fn open(key_bytes: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let key = key(key_bytes)?;
    if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(crypto_error("ciphertext is shorter than nonce and tag"));
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| crypto_error("invalid GCM nonce"))?;
    let mut buf = sealed.to_vec();
    let plain_len = key
        .open_in_place(nonce, Aad::empty(), &mut buf)
        .map_err(|_| crypto_error("GCM authentication failed"))?
        .len();
    buf.truncate(plain_len);
    Ok(buf)
}

/// Encrypt under a fresh random nonce, producing `nonce || ciphertext || tag`
pub fn seal(key_bytes: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = key(key_bytes)?;
    let mut nonce = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce)
        .map_err(|_| crypto_error("failed to generate nonce"))?;

    let mut buf = plaintext.to_vec();
    key.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buf)
        .map_err(|_| crypto_error("GCM encryption failed"))?;

    let mut out = Vec::with_capacity(NONCE_LEN + buf.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&buf);
    Ok(out)
}

/// Decode a base64 key and check its length
pub fn decode_key(encoded: &str) -> Result<Vec<u8>> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| crypto_error(format!("key is not valid base64: {e}")))?;
    if bytes.len() != KEY_LEN {
        return Err(crypto_error(format!(
            "expected a {KEY_LEN}-byte key, got {} bytes",
            bytes.len()
        )));
    }
    Ok(bytes)
}
