//! AES-256-GCM sealing of secret values.
//!
//! Stored layout: `[nonce: 12 bytes][ciphertext][tag: 16 bytes]`. Each value
//! gets a fresh random nonce, so a blob is decryptable on its own given the
//! installation key.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};

pub type Key = [u8; 32];

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

pub fn seal(key: &Key, plaintext: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Fails on a wrong key, a modified byte anywhere, or a truncated blob.
pub fn open(key: &Key, blob: &[u8]) -> Result<Vec<u8>, aes_gcm::Error> {
    if blob.len() < NONCE_LEN + TAG_LEN {
        return Err(aes_gcm::Error);
    }
    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(key.into());
    cipher.decrypt(Nonce::from_slice(nonce), ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: Key = [7u8; 32];

    #[test]
    fn opens_what_it_sealed() {
        for plain in ["", "hunter2", "a=b\nc='d'\0\u{1f511}"] {
            let blob = seal(&KEY, plain.as_bytes()).unwrap();
            assert_eq!(blob.len(), NONCE_LEN + plain.len() + TAG_LEN);
            assert_eq!(open(&KEY, &blob).unwrap(), plain.as_bytes());
        }
    }

    #[test]
    fn nonces_differ_between_seals() {
        let a = seal(&KEY, b"same").unwrap();
        let b = seal(&KEY, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn any_flipped_byte_is_rejected() {
        let blob = seal(&KEY, b"token-value").unwrap();
        for i in 0..blob.len() {
            let mut bad = blob.clone();
            bad[i] ^= 0x01;
            assert!(open(&KEY, &bad).is_err(), "byte {i} flip accepted");
        }
    }

    #[test]
    fn truncation_and_wrong_key_are_rejected() {
        let blob = seal(&KEY, b"token-value").unwrap();
        assert!(open(&KEY, &blob[..blob.len() - 1]).is_err());
        assert!(open(&KEY, &blob[..4]).is_err());
        assert!(open(&[8u8; 32], &blob).is_err());
    }
}
