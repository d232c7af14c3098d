//! Per-scope encryption wrappers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::crypto::{CryptoError, SymmetricCipher, SymmetricKey};

/// What a wrapper is allowed to seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    Oplog,
}

impl fmt::Display for KeyPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oplog => write!(f, "oplog"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    #[error("missing scope id")]
    MissingScope,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("key service unavailable: {0}")]
    Unavailable(String),
}

/// Encryption key bound to one scope and purpose.
pub struct Wrapper {
    key_id: String,
    cipher: SymmetricCipher,
}

impl Wrapper {
    pub fn new(key: SymmetricKey) -> Self {
        let digest = Sha256::digest(key.as_slice());
        Self {
            key_id: format!("kdkv_{}", hex::encode(&digest[..8])),
            cipher: SymmetricCipher::new(key),
        }
    }

    /// Stable identifier of the key, safe to store next to ciphertext.
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.encrypt(plaintext)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.decrypt(data)
    }
}

/// Source of scope wrappers.
#[async_trait]
pub trait WrapperProvider: Send + Sync {
    async fn get_wrapper(
        &self,
        scope_id: &str,
        purpose: KeyPurpose,
    ) -> Result<Arc<Wrapper>, KmsError>;
}

/// Wrappers derived from a single root key, cached per scope.
pub struct LocalKms {
    root: SymmetricKey,
    cache: DashMap<(String, KeyPurpose), Arc<Wrapper>>,
}

impl LocalKms {
    pub fn new(root: SymmetricKey) -> Self {
        Self {
            root,
            cache: DashMap::new(),
        }
    }
}

#[async_trait]
impl WrapperProvider for LocalKms {
    async fn get_wrapper(
        &self,
        scope_id: &str,
        purpose: KeyPurpose,
    ) -> Result<Arc<Wrapper>, KmsError> {
        if scope_id.is_empty() {
            return Err(KmsError::MissingScope);
        }

        let cache_key = (scope_id.to_owned(), purpose);
        if let Some(wrapper) = self.cache.get(&cache_key) {
            return Ok(Arc::clone(wrapper.value()));
        }

        let info = format!("{scope_id}/{purpose}");
        let wrapper = Arc::new(Wrapper::new(self.root.derive(info.as_bytes())?));
        tracing::debug!(%scope_id, %purpose, key_id = wrapper.key_id(), "derived scope wrapper");

        Ok(Arc::clone(self.cache.entry(cache_key).or_insert(wrapper).value()))
    }
}
