//! Cryptographic engine contract
//!
//! The threshold-signing mathematics lives behind [`SigningEngine`]; a session
//! only moves opaque bytes in and out of it. Engines are created per signing
//! attempt by an [`EngineFactory`] and owned through an [`EngineHandle`],
//! which frees the engine on every exit path.

use crate::types::{PartyId, SignatureAlgorithm};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine errors, surfaced verbatim and never retried
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid key share: {0}")]
    InvalidKeyShare(String),
    #[error("invalid setup message: {0}")]
    InvalidSetup(String),
    #[error("signature not ready")]
    NotFinished,
    #[error("engine already released")]
    Released,
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl EngineError {
    pub fn error_code(&self) -> &'static str {
        match self {
            EngineError::Protocol(_) => "ENGINE_PROTOCOL",
            EngineError::InvalidKeyShare(_) => "INVALID_KEY_SHARE",
            EngineError::InvalidSetup(_) => "INVALID_SETUP",
            EngineError::NotFinished => "NOT_FINISHED",
            EngineError::Released => "ENGINE_RELEASED",
            EngineError::Unsupported(_) => "UNSUPPORTED",
        }
    }
}

/// Message an engine wants delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Plaintext protocol bytes
    pub body: Vec<u8>,
    /// Parties that must receive the body
    pub receivers: Vec<PartyId>,
}

/// One party's state in a running threshold-signing protocol
pub trait SigningEngine: Send {
    /// Next message to deliver, if any is ready
    fn output_message(&mut self) -> Result<Option<OutboundMessage>, EngineError>;

    /// Feed a message from a peer; returns true once the signature is ready
    fn input_message(&mut self, message: &[u8]) -> Result<bool, EngineError>;

    /// Raw signature bytes
    fn finish(&mut self) -> Result<Vec<u8>, EngineError>;

    /// Drop secret state
    fn free(&mut self);
}

/// One party's share of a split private key
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyShare {
    pub algorithm: SignatureAlgorithm,
    /// Hex-encoded group public key
    pub public_key: String,
    /// Engine-specific share encoding
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl std::fmt::Debug for KeyShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyShare")
            .field("algorithm", &self.algorithm)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// What an engine needs to know about the signing attempt
#[derive(Debug, Clone, Copy)]
pub struct EngineContext<'a> {
    pub session_id: &'a str,
    pub local_party: &'a str,
    /// Full committee including the local party, sorted
    pub parties: &'a [PartyId],
    /// Digest to sign
    pub message: &'a [u8],
    pub chain_path: &'a str,
    pub key_share: &'a KeyShare,
}

/// Creates engines for one signature scheme
pub trait EngineFactory: Send + Sync {
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Whether the initiator distributes a setup message before the rounds
    fn uses_setup_message(&self) -> bool {
        false
    }

    /// Setup message built by the initiator
    fn setup_message(&self, _ctx: &EngineContext<'_>) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::Unsupported("setup message".to_string()))
    }

    /// Create an engine; `setup` is the initiator's setup message when used
    fn create(
        &self,
        ctx: &EngineContext<'_>,
        setup: Option<&[u8]>,
    ) -> Result<Box<dyn SigningEngine>, EngineError>;
}

/// Exclusive owner of an engine; frees it exactly once
pub struct EngineHandle {
    engine: Option<Box<dyn SigningEngine>>,
}

impl EngineHandle {
    pub fn new(engine: Box<dyn SigningEngine>) -> Self {
        Self {
            engine: Some(engine),
        }
    }

    fn engine_mut(&mut self) -> Result<&mut (dyn SigningEngine + 'static), EngineError> {
        self.engine.as_deref_mut().ok_or(EngineError::Released)
    }

    pub fn output_message(&mut self) -> Result<Option<OutboundMessage>, EngineError> {
        self.engine_mut()?.output_message()
    }

    pub fn input_message(&mut self, message: &[u8]) -> Result<bool, EngineError> {
        self.engine_mut()?.input_message(message)
    }

    pub fn finish(&mut self) -> Result<Vec<u8>, EngineError> {
        self.engine_mut()?.finish()
    }

    /// Free the engine; later calls are no-ops
    pub fn release(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.free();
            tracing::trace!("Released signing engine");
        }
    }

    pub fn is_released(&self) -> bool {
        self.engine.is_none()
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.release();
    }
}
