//! Protocol message body encryption
//!
//! Bodies are encrypted with AES-256-CBC under the session's shared key. A
//! random 16-byte IV is prepended to the ciphertext and the result is
//! base64-encoded for the relay. Hashes are always taken over the plaintext.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use cbc::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block and IV size
pub const IV_LEN: usize = 16;

/// Session key size
pub const KEY_LEN: usize = 32;

/// Message crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid hex key: {0}")]
    InvalidHex(String),
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("invalid base64 body: {0}")]
    InvalidBase64(String),
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    #[error("decryption failed: bad padding or wrong key")]
    Decryption,
    #[error("random number generator failure: {0}")]
    Rng(String),
}

impl CryptoError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CryptoError::InvalidHex(_) | CryptoError::InvalidKeyLength(_) => "INVALID_KEY",
            CryptoError::InvalidBase64(_) | CryptoError::CiphertextTooShort(_) => "INVALID_BODY",
            CryptoError::Decryption => "DECRYPTION_FAILED",
            CryptoError::Rng(_) => "RNG_FAILURE",
        }
    }
}

/// Symmetric cipher bound to one session key
#[derive(Clone)]
pub struct MessageCrypto {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for MessageCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageCrypto").finish_non_exhaustive()
    }
}

impl MessageCrypto {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Build from the hex-encoded session key
    pub fn from_hex(hex_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex_key.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// Encrypt a plaintext body into `base64(iv || ciphertext)`
    pub fn encrypt(&self, plaintext: &[u8]) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        self.encrypt_with_iv(plaintext, &iv)
    }

    fn encrypt_with_iv(&self, plaintext: &[u8], iv: &[u8; IV_LEN]) -> String {
        let ciphertext = Aes256CbcEnc::new(GenericArray::from_slice(&self.key), GenericArray::from_slice(iv))
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(iv);
        out.extend_from_slice(&ciphertext);
        BASE64.encode(out)
    }

    /// Decrypt a `base64(iv || ciphertext)` body
    pub fn decrypt(&self, body: &str) -> Result<Vec<u8>, CryptoError> {
        let raw = BASE64
            .decode(body.trim())
            .map_err(|e| CryptoError::InvalidBase64(e.to_string()))?;
        if raw.len() < IV_LEN * 2 || raw.len() % IV_LEN != 0 {
            return Err(CryptoError::CiphertextTooShort(raw.len()));
        }

        let (iv, ciphertext) = raw.split_at(IV_LEN);
        Aes256CbcDec::new(GenericArray::from_slice(&self.key), GenericArray::from_slice(iv))
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }
}

/// Hex-encoded SHA-256 digest
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Fresh random 32-byte session key, hex-encoded
pub fn generate_encryption_key() -> Result<String, CryptoError> {
    let mut key = [0u8; KEY_LEN];
    getrandom::getrandom(&mut key).map_err(|e| CryptoError::Rng(e.to_string()))?;
    Ok(hex::encode(key))
}
