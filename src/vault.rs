//! Key share vaults
//!
//! A vault holds at most one key share per signature scheme. [`FileVault`]
//! keeps them encrypted at rest using AES-256-GCM with a password-derived key.

use crate::engine::KeyShare;
use crate::types::SignatureAlgorithm;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Vault errors
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("encryption error: {0}")]
    Encryption(String),
    #[error("decryption error: {0}")]
    Decryption(String),
    #[error("vault file not found: {0}")]
    NotFound(String),
    #[error("invalid password")]
    InvalidPassword,
    #[error("unsupported vault version {0}")]
    UnsupportedVersion(u8),
}

impl VaultError {
    pub fn error_code(&self) -> &'static str {
        match self {
            VaultError::Io(_) => "IO_ERROR",
            VaultError::Serialization(_) => "SERIALIZATION_ERROR",
            VaultError::Encryption(_) => "ENCRYPTION_ERROR",
            VaultError::Decryption(_) => "DECRYPTION_ERROR",
            VaultError::NotFound(_) => "VAULT_NOT_FOUND",
            VaultError::InvalidPassword => "INVALID_PASSWORD",
            VaultError::UnsupportedVersion(_) => "UNSUPPORTED_VERSION",
        }
    }
}

/// Source of per-scheme key shares
pub trait Vault: Send + Sync {
    /// Display name of the vault
    fn name(&self) -> &str;

    /// Key share for a scheme, if the vault has one
    fn key_share(&self, algorithm: SignatureAlgorithm) -> Option<&KeyShare>;
}

/// Vault held entirely in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryVault {
    name: String,
    shares: BTreeMap<SignatureAlgorithm, KeyShare>,
}

impl MemoryVault {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shares: BTreeMap::new(),
        }
    }

    /// Add a share, replacing any share of the same scheme
    pub fn with_share(mut self, share: KeyShare) -> Self {
        self.insert(share);
        self
    }

    pub fn insert(&mut self, share: KeyShare) {
        self.shares.insert(share.algorithm, share);
    }

    pub fn shares(&self) -> impl Iterator<Item = &KeyShare> {
        self.shares.values()
    }
}

impl Vault for MemoryVault {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_share(&self, algorithm: SignatureAlgorithm) -> Option<&KeyShare> {
        self.shares.get(&algorithm)
    }
}

const VAULT_VERSION: u8 = 1;

/// Encrypted vault file format
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedVaultFile {
    /// Version for future format changes
    version: u8,
    /// Vault display name
    name: String,
    /// Salt for key derivation (hex-encoded)
    salt: String,
    /// Nonce for AES-GCM (hex-encoded)
    nonce: String,
    /// Encrypted key shares (hex-encoded)
    ciphertext: String,
    /// Group public key per scheme, readable without the password
    public_keys: BTreeMap<SignatureAlgorithm, String>,
}

/// Password-protected vault file
pub struct FileVault {
    path: PathBuf,
}

impl FileVault {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Derive encryption key from password using SHA-256
    fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt);
        hasher.update(b"mpc-keysign-vault-v1");
        hasher.finalize().into()
    }

    /// Encrypt every share of `vault` into the file
    pub fn save(&self, vault: &MemoryVault, password: &str) -> Result<(), VaultError> {
        let shares: Vec<&KeyShare> = vault.shares().collect();
        let plaintext = serde_json::to_vec(&shares)?;

        let mut salt = [0u8; 16];
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let key = Self::derive_key(password, &salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::Encryption(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let encrypted = EncryptedVaultFile {
            version: VAULT_VERSION,
            name: vault.name().to_string(),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce_bytes),
            ciphertext: hex::encode(ciphertext),
            public_keys: vault
                .shares()
                .map(|s| (s.algorithm, s.public_key.clone()))
                .collect(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&encrypted)?)?;

        tracing::info!(
            vault = %vault.name(),
            path = %self.path.display(),
            shares = encrypted.public_keys.len(),
            "Saved encrypted vault"
        );
        Ok(())
    }

    /// Decrypt the file into a [`MemoryVault`]
    pub fn load(&self, password: &str) -> Result<MemoryVault, VaultError> {
        let encrypted = self.read_file()?;

        let decode = |field: &str| {
            hex::decode(field).map_err(|e| VaultError::Decryption(e.to_string()))
        };
        let salt = decode(&encrypted.salt)?;
        let nonce_bytes = decode(&encrypted.nonce)?;
        let ciphertext = decode(&encrypted.ciphertext)?;
        if nonce_bytes.len() != 12 {
            return Err(VaultError::Decryption("invalid nonce length".to_string()));
        }

        let key = Self::derive_key(password, &salt);
        let cipher =
            Aes256Gcm::new_from_slice(&key).map_err(|e| VaultError::Decryption(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|_| VaultError::InvalidPassword)?;

        let shares: Vec<KeyShare> = serde_json::from_slice(&plaintext)?;
        let vault = shares
            .into_iter()
            .fold(MemoryVault::new(encrypted.name), MemoryVault::with_share);

        tracing::info!(
            vault = %vault.name(),
            path = %self.path.display(),
            "Loaded vault"
        );
        Ok(vault)
    }

    /// Group public keys without decryption
    pub fn public_keys(&self) -> Result<BTreeMap<SignatureAlgorithm, String>, VaultError> {
        Ok(self.read_file()?.public_keys)
    }

    fn read_file(&self) -> Result<EncryptedVaultFile, VaultError> {
        if !self.exists() {
            return Err(VaultError::NotFound(self.path.display().to_string()));
        }
        let json = std::fs::read_to_string(&self.path)?;
        let encrypted: EncryptedVaultFile = serde_json::from_str(&json)?;
        if encrypted.version != VAULT_VERSION {
            return Err(VaultError::UnsupportedVersion(encrypted.version));
        }
        Ok(encrypted)
    }
}
