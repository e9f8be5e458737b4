//! Symmetric cipher for connection secrets.
//!
//! Secrets are sealed with AES-256-GCM under a process-wide key. The stored
//! form is base64 of `nonce || ciphertext || tag`, so two encryptions of the
//! same secret never produce the same text.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

pub const KEY_LENGTH: usize = 32;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("invalid key: expected base64 of {KEY_LENGTH} bytes")]
    InvalidKey,

    #[error("invalid ciphertext")]
    InvalidCiphertext,
}

/// Stateless after construction; shared across tasks without locking.
pub struct CredentialCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    pub fn new(key: &[u8; KEY_LENGTH]) -> CryptoResult<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> CryptoResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| CryptoError::EncryptionFailed)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&in_out);
        Ok(BASE64.encode(&sealed))
    }

    pub fn decrypt(&self, ciphertext: &str) -> CryptoResult<String> {
        let data = BASE64
            .decode(ciphertext.trim())
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        if data.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CryptoError::InvalidCiphertext);
        }

        let (nonce_bytes, sealed) = data.split_at(NONCE_LEN);
        let nonce_array: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        let nonce = Nonce::assume_unique_for_key(nonce_array);

        let mut in_out = sealed.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| CryptoError::DecryptionFailed)
    }
}

pub fn generate_key() -> CryptoResult<[u8; KEY_LENGTH]> {
    let mut key = [0u8; KEY_LENGTH];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(key)
}

pub fn encode_key(key: &[u8; KEY_LENGTH]) -> String {
    BASE64.encode(key)
}

pub fn decode_key(encoded: &str) -> CryptoResult<[u8; KEY_LENGTH]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|_| CryptoError::InvalidKey)?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> CredentialCipher {
        CredentialCipher::new(&generate_key().expect("key")).expect("cipher")
    }

    #[test]
    fn ascii_secrets_roundtrip() {
        let cipher = cipher();
        for secret in ["", "p", "hunter2", "p@ss w0rd!~", &"x".repeat(512)] {
            let sealed = cipher.encrypt(secret).expect("encrypt");
            assert_ne!(sealed, secret);
            assert_eq!(cipher.decrypt(&sealed).expect("decrypt"), secret);
        }
    }

    #[test]
    fn same_secret_seals_differently() {
        let cipher = cipher();
        let a = cipher.encrypt("secret").expect("encrypt");
        let b = cipher.encrypt("secret").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn other_key_cannot_open() {
        let sealed = cipher().encrypt("secret").expect("encrypt");
        let result = cipher().decrypt(&sealed);
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let cipher = cipher();
        let sealed = cipher.encrypt("secret").expect("encrypt");
        let mut raw = BASE64.decode(&sealed).expect("base64");
        if let Some(last) = raw.last_mut() {
            *last ^= 0xFF;
        }
        let result = cipher.decrypt(&BASE64.encode(&raw));
        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn malformed_ciphertext_is_rejected() {
        let cipher = cipher();
        assert!(matches!(
            cipher.decrypt("not base64!!"),
            Err(CryptoError::InvalidCiphertext)
        ));
        assert!(matches!(
            cipher.decrypt(&BASE64.encode(b"short")),
            Err(CryptoError::InvalidCiphertext)
        ));
    }

    #[test]
    fn key_encoding_roundtrip_and_length_check() {
        let key = generate_key().expect("key");
        assert_eq!(decode_key(&encode_key(&key)).expect("decode"), key);
        assert!(matches!(
            decode_key(&BASE64.encode(b"too short")),
            Err(CryptoError::InvalidKey)
        ));
    }
}
