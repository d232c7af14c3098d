//! Cryptogragic logics.

use aes_gcm::aead::{Aead, KeyInit, Nonce};
use aes_gcm::{Aes256Gcm, Key};
use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

const NONCE_SIZE: usize = 12;
pub const KEY_LENGTH: usize = 32;

type Result<T> = std::result::Result<T, CryptoError>;
type HmacSha256 = Hmac<Sha256>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("aead operation failed")]
    Aead,
    #[error("argon2 error: {0}")]
    Argon2(String),
    #[error("key length is {value} while {excepted} is excepted")]
    KeyLength { value: usize, excepted: usize },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// SymmetricKey holds a fixed-size key protected by Zeroizing.
#[derive(Clone)]
pub struct SymmetricKey(Zeroizing<[u8; KEY_LENGTH]>);

impl SymmetricKey {
    /// Create from raw bytes (must be 32 bytes).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::KeyLength {
                value: bytes.len(),
                excepted: KEY_LENGTH,
            })?;
        Ok(Self(Zeroizing::new(key)))
    }

    /// Derive key from a password + salt using Argon2id.
    pub fn derive_from_password(
        password: impl AsRef<[u8]>,
        salt: impl AsRef<[u8]>,
    ) -> Result<Self> {
        let params = Params::new(1024 * 64, 8, 2, Some(KEY_LENGTH))
            .map_err(|err| CryptoError::Argon2(err.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = Zeroizing::new([0u8; KEY_LENGTH]);
        argon2
            .hash_password_into(
                password.as_ref(),
                salt.as_ref(),
                key.as_mut_slice(),
            )
            .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        Ok(Self(key))
    }

    /// Derive a sub-key bound to `info` with HMAC-SHA256.
    pub fn derive(&self, info: &[u8]) -> Result<Self> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(self.as_slice())
            .map_err(|_| CryptoError::KeyLength {
                value: KEY_LENGTH,
                excepted: KEY_LENGTH,
            })?;
        mac.update(info);

        Self::from_bytes(&mac.finalize().into_bytes())
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }
}

/// SymmetricCipher provides encrypt/decrypt operations with AES-256-GCM.
pub struct SymmetricCipher {
    key: SymmetricKey,
}

impl SymmetricCipher {
    /// Create a new [`SymmetricCipher`].
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    /// Encrypts data returning raw bytes, nonce first.
    pub fn encrypt(&self, plaintext: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        // Generate random 96-bit nonce.
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::<Aes256Gcm>::from_slice(&nonce_bytes);

        let cipher_text = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| CryptoError::Aead)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + cipher_text.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&cipher_text);
        Ok(out)
    }

    /// Decrypt raw data.
    pub fn decrypt(&self, data: impl AsRef<[u8]>) -> Result<Vec<u8>> {
        let data = data.as_ref();
        if data.len() < NONCE_SIZE {
            return Err(CryptoError::KeyLength {
                value: data.len(),
                excepted: NONCE_SIZE,
            });
        }

        let (nonce_bytes, cipher_text) = data.split_at(NONCE_SIZE);
        let nonce = Nonce::<Aes256Gcm>::from_slice(nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(self.key.as_slice());
        let cipher = Aes256Gcm::new(key);

        cipher
            .decrypt(nonce, cipher_text)
            .map_err(|_| CryptoError::Aead)
    }
}
