//! Symmetric cipher used by the framed relay.
//!
//! Every chunk is sealed independently as `nonce || ciphertext || tag`, so a
//! cipher carries no per-stream state and one instance can serve a whole pipe
//! direction.

use std::{fmt, str::FromStr};

use aes_gcm::{
    Aes128Gcm, Aes256Gcm,
    aead::{Aead, KeyInit, OsRng, generic_array::GenericArray, rand_core::RngCore},
};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

pub const NONCE_BYTES: usize = 12;
pub const TAG_BYTES: usize = 16;

const KDF_INFO: &[u8] = b"tunnelgate relay v1";

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("unknown cipher mode {0:?} (expected aes-128-gcm|aes-256-gcm|chacha20-ietf-poly1305)")]
    UnknownMode(String),
    #[error("empty crypt key")]
    EmptyKey,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("ciphertext too short: {0} bytes")]
    Truncated(usize),
    #[error("encrypt failed")]
    Encrypt,
    #[error("decrypt failed (bad key or corrupted frame)")]
    Decrypt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl CipherMode {
    pub fn name(self) -> &'static str {
        match self {
            CipherMode::Aes128Gcm => "aes-128-gcm",
            CipherMode::Aes256Gcm => "aes-256-gcm",
            CipherMode::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            CipherMode::Aes128Gcm => 16,
            CipherMode::Aes256Gcm | CipherMode::ChaCha20Poly1305 => 32,
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CipherMode {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherMode::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherMode::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherMode::ChaCha20Poly1305),
            _ => Err(CipherError::UnknownMode(s.to_string())),
        }
    }
}

enum AeadImpl {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

pub struct Cipher {
    mode: CipherMode,
    aead: AeadImpl,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Cipher {
    /// Builds a cipher from a shared secret of any length.
    ///
    /// The secret is stretched to the mode's key size with HKDF-SHA256.
    pub fn init(key: &[u8], mode: CipherMode) -> Result<Self, CipherError> {
        if key.is_empty() {
            return Err(CipherError::EmptyKey);
        }

        let mut okm = vec![0u8; mode.key_len()];
        Hkdf::<Sha256>::new(None, key)
            .expand(KDF_INFO, &mut okm)
            .map_err(|_| CipherError::KeyDerivation)?;

        let aead = match mode {
            CipherMode::Aes128Gcm => AeadImpl::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&okm).map_err(|_| CipherError::KeyDerivation)?,
            )),
            CipherMode::Aes256Gcm => AeadImpl::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&okm).map_err(|_| CipherError::KeyDerivation)?,
            )),
            CipherMode::ChaCha20Poly1305 => AeadImpl::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(&okm).map_err(|_| CipherError::KeyDerivation)?,
            )),
        };

        Ok(Self { mode, aead })
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce);
        let n = GenericArray::from_slice(&nonce);

        let sealed = match &self.aead {
            AeadImpl::Aes128(c) => c.encrypt(n, plain),
            AeadImpl::Aes256(c) => c.encrypt(n, plain),
            AeadImpl::ChaCha(c) => c.encrypt(n, plain),
        }
        .map_err(|_| CipherError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_BYTES + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        if data.len() < NONCE_BYTES + TAG_BYTES {
            return Err(CipherError::Truncated(data.len()));
        }
        let (nonce, sealed) = data.split_at(NONCE_BYTES);
        let n = GenericArray::from_slice(nonce);

        let opened = match &self.aead {
            AeadImpl::Aes128(c) => c.decrypt(n, sealed),
            AeadImpl::Aes256(c) => c.decrypt(n, sealed),
            AeadImpl::ChaCha(c) => c.decrypt(n, sealed),
        };
        opened.map_err(|_| CipherError::Decrypt)
    }
}
