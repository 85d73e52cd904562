//! Message relay ("mediator")
//!
//! An untrusted store-and-forward service holding ephemeral session and
//! message state in memory. Parties only ever exchange encrypted protocol
//! bytes through it.
//!
//! - [`RelayStore`]: the in-memory state, one lock per map
//! - [`create_router`] / [`RelayServer`]: the HTTP surface
//! - [`RelayClient`]: HTTP client used by remote parties
//! - [`RelayTransport`]: what a signing session needs from a relay, implemented
//!   for both the HTTP client and the in-process store

pub mod client;
pub mod server;
pub mod store;

pub use client::RelayClient;
pub use server::{create_router, AppState, RelayServer};
pub use store::RelayStore;

use crate::types::{PartyId, RelayMessage};
use async_trait::async_trait;
use thiserror::Error;

/// Header carrying the out-of-band message identifier
pub const MESSAGE_ID_HEADER: &str = "message_id";

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("relay returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("payload hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl RelayError {
    /// Transient failures the session loops retry with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Network(_) | RelayError::Timeout(_) => true,
            RelayError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            RelayError::Network(_) => "RELAY_NETWORK",
            RelayError::Timeout(_) => "RELAY_TIMEOUT",
            RelayError::Status { .. } => "RELAY_STATUS",
            RelayError::HashMismatch { .. } => "HASH_MISMATCH",
            RelayError::InvalidMessage(_) => "INVALID_MESSAGE",
            RelayError::Decode(_) => "DECODE_ERROR",
        }
    }
}

/// Relay operations consumed by signing sessions and the coordinator
///
/// Lookups return `Ok(None)` for absent keys.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Liveness check
    async fn ping(&self) -> Result<(), RelayError>;

    /// Register parties with a session, creating it if needed
    async fn start_session(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError>;

    /// Parties registered with a session
    async fn get_session(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError>;

    /// Purge everything the relay holds for a session
    async fn delete_session(&self, session_id: &str) -> Result<(), RelayError>;

    /// Fan a message out to every receiver in `message.to`
    async fn post_message(&self, message: &RelayMessage) -> Result<(), RelayError>;

    /// Current inbox of a participant; does not clear it
    async fn get_messages(
        &self,
        session_id: &str,
        participant: &str,
    ) -> Result<Vec<RelayMessage>, RelayError>;

    /// Remove a message from a participant's inbox; absence is not an error
    async fn delete_message(
        &self,
        session_id: &str,
        participant: &str,
        hash: &str,
    ) -> Result<(), RelayError>;

    /// Publish the committee that starts the signing rounds
    async fn mark_tss_started(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError>;

    async fn get_tss_start(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError>;

    /// Record parties that finished the protocol
    async fn mark_tss_complete(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError>;

    async fn get_tss_complete(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError>;

    /// Store a completion record keyed by an out-of-band message id
    async fn set_keysign_finished(
        &self,
        session_id: &str,
        message_id: &str,
        payload: &str,
    ) -> Result<(), RelayError>;

    async fn get_keysign_finished(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<String>, RelayError>;

    /// Store the session setup message
    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> Result<(), RelayError>;

    async fn get_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> Result<Option<String>, RelayError>;

    /// Store integrity-checked bytes under their SHA-256 hash
    async fn store_payload(&self, hash: &str, payload: &[u8]) -> Result<(), RelayError>;

    async fn get_payload(&self, hash: &str) -> Result<Option<Vec<u8>>, RelayError>;
}
