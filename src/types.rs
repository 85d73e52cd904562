//! Request, response and wire types shared by the relay, sessions and coordinator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of one party (device) taking part in a signing session
pub type PartyId = String;

/// Signature scheme a key share belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    /// ECDSA-class threshold signing (DKLS-style engines)
    Ecdsa,
    /// EdDSA/Schnorr-class threshold signing (FROST-style engines)
    Eddsa,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ecdsa => "ecdsa",
            SignatureAlgorithm::Eddsa => "eddsa",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ecdsa" | "dkls" => Ok(SignatureAlgorithm::Ecdsa),
            "eddsa" | "schnorr" | "frost" => Ok(SignatureAlgorithm::Eddsa),
            other => Err(format!("unknown signature algorithm: {}", other)),
        }
    }
}

/// Encrypted protocol message as stored and forwarded by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    /// Session the message belongs to
    #[serde(default)]
    pub session_id: String,
    /// Sending party
    #[serde(default)]
    pub from: PartyId,
    /// Receiving parties; the relay stores one copy per receiver
    #[serde(default)]
    pub to: Vec<PartyId>,
    /// Base64 ciphertext (IV prepended)
    #[serde(default)]
    pub body: String,
    /// Hex SHA-256 of the plaintext body
    #[serde(default)]
    pub hash: String,
    /// Sender-assigned, advisory ordering hint
    #[serde(default)]
    pub sequence_no: u64,
}

/// Normalized signature produced by a finished session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysignSignature {
    pub algorithm: SignatureAlgorithm,
    /// Hex-encoded `r` component
    pub r: String,
    /// Hex-encoded `s` component
    pub s: String,
    /// Hex-encoded recovery byte (ECDSA only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_id: Option<String>,
    /// Hex-encoded DER `SEQUENCE { r, s }` (ECDSA only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub der_signature: Option<String>,
    /// Wallet-consumable signature string
    pub signature: String,
}

/// Pairing payload a joining device needs to enter a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinInfo {
    pub session_id: String,
    pub hex_encryption_key: String,
    pub relay_url: String,
    pub initiator: PartyId,
    pub algorithm: SignatureAlgorithm,
}

/// Request handed to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningRequest {
    /// Network the payload targets (chain-specific digest builders use it)
    pub network: String,
    /// Key share scheme to sign with
    pub scheme: SignatureAlgorithm,
    /// Curve name, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curve: Option<String>,
    /// Hex-encoded payload the digest is derived from
    pub payload: String,
    /// Derivation path passed to the engine
    #[serde(default = "default_chain_path")]
    pub chain_path: String,
    /// Reuse an existing session identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Peers already known to be in the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<PartyId>>,
}

fn default_chain_path() -> String {
    "m".to_string()
}

/// Result returned to the wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningResult {
    pub signature: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<KeysignSignature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_id: Option<String>,
}

/// Generic error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Optional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
