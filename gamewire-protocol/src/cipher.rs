//! Handshake challenge cipher.
//!
//! The challenge is a random `u64` sealed with ChaCha20-Poly1305 under a key
//! derived from the shared secret (SHA-256). The wire form is the 12-byte
//! nonce followed by the AEAD ciphertext.

use crate::error::ProtocolError;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_SIZE: usize = 12;

/// Seals and opens handshake challenges for one shared secret.
#[derive(Clone)]
pub struct ChallengeCipher {
    cipher: ChaCha20Poly1305,
    fingerprint: String,
}

impl ChallengeCipher {
    pub fn new(secret: &str) -> Self {
        let key = Sha256::digest(secret.as_bytes());
        let fingerprint = hex::encode(&Sha256::digest(key)[..4]);
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            fingerprint,
        }
    }

    /// Short hex tag identifying the key. Both ends of a connection show the
    /// same tag when their secrets agree.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Draws a fresh challenge value.
    pub fn random_challenge() -> u64 {
        rand::thread_rng().next_u64()
    }

    pub fn encrypt(&self, challenge: u64) -> Result<Vec<u8>, ProtocolError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, challenge.to_be_bytes().as_ref())
            .map_err(|e| ProtocolError::Cipher(format!("encryption failed: {}", e)))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<u64, ProtocolError> {
        if data.len() < NONCE_SIZE {
            return Err(ProtocolError::Cipher("challenge too short".to_string()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_SIZE);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| ProtocolError::Cipher(format!("decryption failed: {}", e)))?;

        let bytes: [u8; 8] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| ProtocolError::Cipher(format!("bad challenge length {}", plaintext.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

impl std::fmt::Debug for ChallengeCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeCipher")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = ChallengeCipher::new("s3cret");
        let value = ChallengeCipher::random_challenge();
        let sealed = cipher.encrypt(value).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 8 + 16);
        assert_eq!(cipher.decrypt(&sealed).unwrap(), value);
    }

    #[test]
    fn test_nonce_varies() {
        let cipher = ChallengeCipher::new("s3cret");
        assert_ne!(cipher.encrypt(7).unwrap(), cipher.encrypt(7).unwrap());
    }

    #[test]
    fn test_wrong_secret() {
        let sealed = ChallengeCipher::new("server").encrypt(99).unwrap();
        assert!(matches!(
            ChallengeCipher::new("client").decrypt(&sealed),
            Err(ProtocolError::Cipher(_))
        ));
    }

    #[test]
    fn test_tampered_and_short() {
        let cipher = ChallengeCipher::new("k");
        let mut sealed = cipher.encrypt(1).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(cipher.decrypt(&sealed).is_err());
        assert!(cipher.decrypt(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_fingerprint() {
        let a = ChallengeCipher::new("shared");
        assert_eq!(a.fingerprint().len(), 8);
        assert_eq!(a.fingerprint(), ChallengeCipher::new("shared").fingerprint());
        assert_ne!(a.fingerprint(), ChallengeCipher::new("other").fingerprint());
    }
}
