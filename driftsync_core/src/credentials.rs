//! Encrypted credential handling.
//!
//! `CredentialVault` encrypts vendor credential JSON at rest using
//! AES-256-GCM with a random nonce prefixed to the ciphertext. The relational
//! storage of the ciphertext lives behind [`crate::store::OrganisationStore`].

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;

use crate::{Error, Result};

const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    /// Create a vault from a 32-byte master key.
    pub fn new(master_key: &[u8; 32]) -> Self {
        let cipher =
            Aes256Gcm::new_from_slice(master_key).expect("32-byte key is always valid for AES-256");
        Self { cipher }
    }

    /// Encrypt a credential value for persistence.
    pub fn encrypt(&self, credential: &serde_json::Value) -> Result<Vec<u8>> {
        let plaintext = serde_json::to_vec(credential)
            .map_err(|e| Error::backend("serialize credential", e))?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|e| Error::BackendMessage(format!("encrypt credential: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a persisted credential.
    pub fn decrypt(&self, data: &[u8]) -> Result<serde_json::Value> {
        if data.len() < NONCE_LEN {
            return Err(Error::BackendMessage(
                "ciphertext too short (missing nonce)".to_string(),
            ));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| Error::BackendMessage(format!("decrypt credential: {e}")))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::backend("deserialize credential", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let vault = CredentialVault::new(&[42u8; 32]);
        let cred = serde_json::json!({"access_token": "tok-1", "refresh_token": "ref-1"});
        let ciphertext = vault.encrypt(&cred).unwrap();
        assert_ne!(ciphertext, serde_json::to_vec(&cred).unwrap());
        assert_eq!(vault.decrypt(&ciphertext).unwrap(), cred);
    }

    #[test]
    fn distinct_nonces_per_encryption() {
        let vault = CredentialVault::new(&[7u8; 32]);
        let cred = serde_json::json!({"access_token": "tok"});
        let a = vault.encrypt(&cred).unwrap();
        let b = vault.encrypt(&cred).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let vault = CredentialVault::new(&[1u8; 32]);
        let mut ciphertext = vault
            .encrypt(&serde_json::json!({"access_token": "tok"}))
            .unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xff;
        assert!(vault.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let vault = CredentialVault::new(&[1u8; 32]);
        assert!(vault.decrypt(&[0u8; 4]).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let a = CredentialVault::new(&[1u8; 32]);
        let b = CredentialVault::new(&[2u8; 32]);
        let ciphertext = a.encrypt(&serde_json::json!({"k": "v"})).unwrap();
        assert!(b.decrypt(&ciphertext).is_err());
    }
}
