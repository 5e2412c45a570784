//! Secret value encryption.
//!
//! Ciphertext format: base64(nonce || AES-256-GCM ciphertext+tag), with a
//! fresh 96-bit random nonce per value.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

const NONCE_LEN: usize = 12;
pub const KEY_LEN: usize = 32;

/// Encrypts env var values at rest.
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Key must be exactly 32 bytes.
    pub fn from_key(key: &str) -> Result<Self> {
        let bytes = key.as_bytes();
        if bytes.len() != KEY_LEN {
            bail!(
                "Encryption key must be exactly {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            );
        }
        let key = Key::<Aes256Gcm>::from_slice(bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Random per-process key. Values encrypted with it are unreadable after
    /// a restart.
    pub fn ephemeral() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Configured key if valid, else an ephemeral one.
    pub fn from_config(key: Option<&str>) -> Self {
        match key.map(Self::from_key) {
            Some(Ok(cipher)) => cipher,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Invalid encryption key, using a per-process key");
                Self::ephemeral()
            }
            None => Self::ephemeral(),
        }
    }
}

impl SecretCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(out))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let raw = STANDARD
            .decode(ciphertext)
            .context("Ciphertext is not valid base64")?;
        if raw.len() <= NONCE_LEN {
            bail!("Ciphertext too short");
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| anyhow::anyhow!("Decryption failed (wrong key or corrupted value)"))?;
        String::from_utf8(plaintext).context("Decrypted value is not UTF-8")
    }
}
