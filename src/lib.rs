//! Threshold signing relay and sessions for multi-party wallets
//!
//! A private key is split into shares held by separate devices. To sign,
//! the devices exchange encrypted protocol messages through an untrusted
//! relay until their engines agree on a signature; no device ever holds
//! the full key.
//!
//! # Architecture
//!
//! - [`relay`]: the in-memory store-and-forward service and its HTTP client
//! - [`session`]: one signing attempt, driving an engine over the relay
//! - [`coordinator`]: key share selection, relay bootstrap and cleanup
//! - [`frost`]: FROST (secp256k1, Taproot) engine for Schnorr signatures
//!
//! # Usage
//!
//! ## Run a stand-alone relay
//! ```bash
//! mpc-keysign relay --bind 0.0.0.0:18080
//! ```
//!
//! ## Sign on the initiating device
//! ```bash
//! mpc-keysign sign --vault vault.json --scheme eddsa --payload <hex digest>
//! ```
//!
//! ## Join from another device
//! ```bash
//! mpc-keysign join --vault vault.json --join-info '<json>' --payload <hex digest>
//! ```

pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod engine;
pub mod frost;
pub mod logging;
pub mod relay;
pub mod session;
pub mod signature;
pub mod types;
pub mod vault;

pub use config::{ConfigError, CoordinatorConfig, RelayConfig, SessionTimeouts};
pub use coordinator::{
    CoordinatorError, DigestBuilder, PrehashedDigest, PreparedSigning, Sha256Digest,
    SigningCoordinator,
};
pub use crypto::{CryptoError, MessageCrypto};
pub use engine::{EngineError, EngineFactory, EngineHandle, KeyShare, SigningEngine};
pub use frost::FrostEngineFactory;
pub use relay::{RelayClient, RelayError, RelayServer, RelayStore, RelayTransport};
pub use session::{SessionConfig, SessionError, SessionState, SigningSession};
pub use types::*;
pub use vault::{FileVault, MemoryVault, Vault, VaultError};
