//! Secrets-at-rest encryption for small fields: the TOTP secret, the
//! recovery-code set, and linked provider tokens.
//!
//! Ciphertext layout is `nonce (12 bytes) || ciphertext`, with the AAD bound
//! to the owning account and field kind so a value copied between rows fails
//! to decrypt.

use anyhow::{Context, Result, anyhow};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use uuid::Uuid;

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Encrypt/decrypt small secrets at rest. The context string names the field
/// (e.g. `"totp-secret"`) and participates in the AAD.
pub trait SecretCrypter: Send + Sync {
    /// # Errors
    /// Returns an error if encryption fails.
    fn encrypt(&self, plaintext: &[u8], owner: Uuid, context: &str) -> Result<Vec<u8>>;

    /// # Errors
    /// Returns an error if the ciphertext is malformed, was tampered with,
    /// or belongs to a different owner/context.
    fn decrypt(&self, data: &[u8], owner: Uuid, context: &str) -> Result<Vec<u8>>;
}

/// ChaCha20-Poly1305 crypter over a single 32-byte key.
pub struct ChaChaSecretCrypter {
    key: [u8; KEY_LEN],
}

impl ChaChaSecretCrypter {
    /// # Errors
    /// Returns an error if the key is not exactly 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = key
            .try_into()
            .map_err(|_| anyhow!("secret key must be {KEY_LEN} bytes"))?;
        Ok(Self { key })
    }

    /// # Errors
    /// Returns an error if the input is not valid base64 or decodes to the
    /// wrong length.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("secret key is not valid base64")?;
        Self::new(&bytes)
    }
}

fn construct_aad(owner: Uuid, context: &str) -> Vec<u8> {
    // AAD = "custodia:v1|context|owner"
    format!("custodia:v1|{context}|{owner}").into_bytes()
}

impl SecretCrypter for ChaChaSecretCrypter {
    fn encrypt(&self, plaintext: &[u8], owner: Uuid, context: &str) -> Result<Vec<u8>> {
        let key = Key::from_slice(&self.key);
        let cipher = ChaCha20Poly1305::new(key);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = construct_aad(owner, context);
        let payload = Payload {
            msg: plaintext,
            aad: &aad,
        };

        let ciphertext = cipher
            .encrypt(nonce, payload)
            .map_err(|e| anyhow!("encryption failure: {e}"))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt(&self, data: &[u8], owner: Uuid, context: &str) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(anyhow!("invalid ciphertext length"));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let key = Key::from_slice(&self.key);
        let cipher = ChaCha20Poly1305::new(key);

        let aad = construct_aad(owner, context);
        let payload = Payload {
            msg: ciphertext,
            aad: &aad,
        };

        cipher
            .decrypt(nonce, payload)
            .map_err(|e| anyhow!("decryption failure: {e}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let crypter = ChaChaSecretCrypter::new(&[42u8; KEY_LEN]).unwrap();
        let owner = Uuid::new_v4();

        let encrypted = crypter.encrypt(b"JBSWY3DPEHPK3PXP", owner, "totp-secret").unwrap();
        assert_ne!(encrypted.as_slice(), b"JBSWY3DPEHPK3PXP".as_slice());

        let decrypted = crypter.decrypt(&encrypted, owner, "totp-secret").unwrap();
        assert_eq!(decrypted, b"JBSWY3DPEHPK3PXP");
    }

    #[test]
    fn decrypt_fails_for_wrong_owner() {
        let crypter = ChaChaSecretCrypter::new(&[42u8; KEY_LEN]).unwrap();
        let owner = Uuid::new_v4();

        let encrypted = crypter.encrypt(b"secret", owner, "totp-secret").unwrap();
        assert!(
            crypter
                .decrypt(&encrypted, Uuid::new_v4(), "totp-secret")
                .is_err()
        );
    }

    #[test]
    fn decrypt_fails_for_wrong_context() {
        let crypter = ChaChaSecretCrypter::new(&[42u8; KEY_LEN]).unwrap();
        let owner = Uuid::new_v4();

        let encrypted = crypter.encrypt(b"secret", owner, "totp-secret").unwrap();
        assert!(
            crypter
                .decrypt(&encrypted, owner, "recovery-codes")
                .is_err()
        );
    }

    #[test]
    fn decrypt_fails_for_tampered_ciphertext() {
        let crypter = ChaChaSecretCrypter::new(&[42u8; KEY_LEN]).unwrap();
        let owner = Uuid::new_v4();

        let mut encrypted = crypter.encrypt(b"secret", owner, "totp-secret").unwrap();
        let len = encrypted.len();
        if let Some(byte) = encrypted.get_mut(len - 1) {
            *byte ^= 0xFF;
        }
        assert!(crypter.decrypt(&encrypted, owner, "totp-secret").is_err());
    }

    #[test]
    fn rejects_short_key() {
        assert!(ChaChaSecretCrypter::new(&[1u8; 16]).is_err());
    }

    #[test]
    fn from_base64_roundtrip() {
        use base64::Engine;
        let encoded = base64::engine::general_purpose::STANDARD.encode([7u8; KEY_LEN]);
        assert!(ChaChaSecretCrypter::from_base64(&encoded).is_ok());
        assert!(ChaChaSecretCrypter::from_base64("not-base64!!").is_err());
    }
}
