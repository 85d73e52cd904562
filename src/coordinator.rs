//! Signing coordinator
//!
//! Turns a [`SigningRequest`] into a finished signature:
//!
//! 1. resolve the key share for the requested scheme from the vault
//! 2. derive the digest to sign from the payload
//! 3. generate the session id, session key and relay URL
//! 4. start (or connect to) a relay and run the matching [`SigningSession`]
//! 5. normalize the result and tear the relay down, on success and on failure
//!
//! The initiator calls [`SigningCoordinator::prepare`] (to get the
//! [`JoinInfo`] to hand to other devices) and then
//! [`SigningCoordinator::run`], or [`SigningCoordinator::sign`] for both.
//! Other devices call [`SigningCoordinator::join`].

use crate::config::CoordinatorConfig;
use crate::crypto::{generate_encryption_key, CryptoError};
use crate::engine::{EngineFactory, KeyShare};
use crate::logging::log_signing_event;
use crate::relay::{RelayClient, RelayError, RelayServer, RelayTransport};
use crate::session::{SessionConfig, SessionError, SigningSession};
use crate::types::{JoinInfo, SignatureAlgorithm, SigningRequest, SigningResult};
use crate::vault::{Vault, VaultError};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// Coordinator errors
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("vault has no {0} key share")]
    MissingKeyShare(SignatureAlgorithm),
    #[error("no signing engine registered for {0}")]
    MissingEngine(SignatureAlgorithm),
    #[error("invalid payload: {0}")]
    Digest(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("vault error: {0}")]
    Vault(#[from] VaultError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinatorError {
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinatorError::MissingKeyShare(_) => "MISSING_KEY_SHARE",
            CoordinatorError::MissingEngine(_) => "MISSING_ENGINE",
            CoordinatorError::Digest(_) => "INVALID_PAYLOAD",
            CoordinatorError::InvalidRequest(_) => "INVALID_REQUEST",
            CoordinatorError::Session(e) => e.error_code(),
            CoordinatorError::Relay(e) => e.error_code(),
            CoordinatorError::Vault(e) => e.error_code(),
            CoordinatorError::Crypto(e) => e.error_code(),
            CoordinatorError::Io(_) => "IO_ERROR",
        }
    }
}

/// Chain-specific digest derivation
pub trait DigestBuilder: Send + Sync {
    /// Digest the engines sign for this request
    fn digest(&self, request: &SigningRequest) -> Result<Vec<u8>, CoordinatorError>;
}

/// The payload already is the 32-byte digest (sighash)
#[derive(Debug, Default, Clone, Copy)]
pub struct PrehashedDigest;

impl DigestBuilder for PrehashedDigest {
    fn digest(&self, request: &SigningRequest) -> Result<Vec<u8>, CoordinatorError> {
        let bytes = decode_payload(&request.payload)?;
        if bytes.len() != 32 {
            return Err(CoordinatorError::Digest(format!(
                "expected a 32-byte digest, got {} bytes",
                bytes.len()
            )));
        }
        Ok(bytes)
    }
}

/// SHA-256 over the payload bytes
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Digest;

impl DigestBuilder for Sha256Digest {
    fn digest(&self, request: &SigningRequest) -> Result<Vec<u8>, CoordinatorError> {
        let bytes = decode_payload(&request.payload)?;
        Ok(Sha256::digest(&bytes).to_vec())
    }
}

fn decode_payload(payload: &str) -> Result<Vec<u8>, CoordinatorError> {
    let payload = payload.strip_prefix("0x").unwrap_or(payload);
    if payload.is_empty() {
        return Err(CoordinatorError::Digest("empty payload".to_string()));
    }
    hex::decode(payload).map_err(|e| CoordinatorError::Digest(e.to_string()))
}

/// Everything an initiator needs to run one signing attempt
///
/// Holds the relay the attempt uses. Dropping it without calling
/// [`SigningCoordinator::run`] stops a self-hosted relay.
pub struct PreparedSigning {
    join_info: JoinInfo,
    session: SessionConfig,
    key_share: KeyShare,
    factory: Arc<dyn EngineFactory>,
    transport: Arc<dyn RelayTransport>,
    server: Option<RelayServer>,
}

impl PreparedSigning {
    /// Pairing payload for the other devices
    pub fn join_info(&self) -> &JoinInfo {
        &self.join_info
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }
}

/// Bootstraps relays and sessions for one device
pub struct SigningCoordinator {
    config: CoordinatorConfig,
    vault: Arc<dyn Vault>,
    factories: HashMap<SignatureAlgorithm, Arc<dyn EngineFactory>>,
    digest: Arc<dyn DigestBuilder>,
    shutdown: watch::Receiver<bool>,
}

impl SigningCoordinator {
    pub fn new(config: CoordinatorConfig, vault: Arc<dyn Vault>) -> Self {
        // a dropped sender never fires
        let (_, shutdown) = watch::channel(false);
        Self {
            config,
            vault,
            factories: HashMap::new(),
            digest: Arc::new(PrehashedDigest),
            shutdown,
        }
    }

    /// Register the engine factory for its scheme
    pub fn with_engine(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.factories.insert(factory.algorithm(), factory);
        self
    }

    pub fn with_digest_builder(mut self, digest: Arc<dyn DigestBuilder>) -> Self {
        self.digest = digest;
        self
    }

    /// Cancel running sessions when the watched value becomes `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    fn resolve(
        &self,
        algorithm: SignatureAlgorithm,
    ) -> Result<(KeyShare, Arc<dyn EngineFactory>), CoordinatorError> {
        let key_share = self
            .vault
            .key_share(algorithm)
            .cloned()
            .ok_or(CoordinatorError::MissingKeyShare(algorithm))?;
        let factory = self
            .factories
            .get(&algorithm)
            .cloned()
            .ok_or(CoordinatorError::MissingEngine(algorithm))?;
        Ok((key_share, factory))
    }

    /// Sign as the initiator, start to finish
    pub async fn sign(&self, request: &SigningRequest) -> Result<SigningResult, CoordinatorError> {
        let prepared = self.prepare(request).await?;
        self.run(prepared).await
    }

    /// Resolve inputs and bring up the relay, without starting the rounds
    pub async fn prepare(&self, request: &SigningRequest) -> Result<PreparedSigning, CoordinatorError> {
        let (key_share, factory) = self.resolve(request.scheme)?;
        let message = self.digest.digest(request)?;

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let hex_encryption_key = generate_encryption_key()?;

        let (transport, server, relay_url) =
            match &self.config.relay_url {
                Some(url) => {
                    let client = RelayClient::new(url.clone(), self.config.request_timeout)?;
                    client.ping().await?;
                    (Arc::new(client) as Arc<dyn RelayTransport>, None, url.clone())
                }
                None => {
                    let server = RelayServer::start(&self.config.relay).await?;
                    let url = self
                        .config
                        .relay
                        .public_url
                        .clone()
                        .unwrap_or_else(|| server.url());
                    // the hosting device talks to its own relay in-process
                    (
                        Arc::new(server.store().clone()) as Arc<dyn RelayTransport>,
                        Some(server),
                        url,
                    )
                }
            };

        let join_info = JoinInfo {
            session_id: session_id.clone(),
            hex_encryption_key: hex_encryption_key.clone(),
            relay_url,
            initiator: self.config.local_party_id.clone(),
            algorithm: request.scheme,
        };

        tracing::info!(
            session_id = %session_id,
            algorithm = %request.scheme,
            network = %request.network,
            relay = %join_info.relay_url,
            self_hosted = server.is_some(),
            "Prepared signing session"
        );

        Ok(PreparedSigning {
            join_info,
            session: SessionConfig {
                session_id,
                local_party: self.config.local_party_id.clone(),
                peers: request.peers.clone().unwrap_or_default(),
                hex_encryption_key,
                algorithm: request.scheme,
                message,
                chain_path: request.chain_path.clone(),
                is_initiator: true,
                hosts_relay: server.is_some(),
                timeouts: self.config.timeouts,
            },
            key_share,
            factory,
            transport,
            server,
        })
    }

    /// Run a prepared attempt; the relay is torn down whatever the outcome
    pub async fn run(&self, prepared: PreparedSigning) -> Result<SigningResult, CoordinatorError> {
        let PreparedSigning {
            session,
            key_share,
            factory,
            transport,
            server,
            ..
        } = prepared;
        let session_id = session.session_id.clone();
        let algorithm = session.algorithm;

        let result = self
            .run_session(session, key_share, factory, transport.clone())
            .await;

        if let Err(e) = transport.delete_session(&session_id).await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to delete relay session");
        }
        if let Some(server) = server {
            if let Err(e) = server.shutdown().await {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to stop relay");
            }
        }

        report(&session_id, algorithm, true, &result);
        result
    }

    /// Join a session started by another device
    pub async fn join(
        &self,
        info: &JoinInfo,
        request: &SigningRequest,
    ) -> Result<SigningResult, CoordinatorError> {
        if request.scheme != info.algorithm {
            return Err(CoordinatorError::InvalidRequest(format!(
                "request is {}, session is {}",
                request.scheme, info.algorithm
            )));
        }
        let (key_share, factory) = self.resolve(info.algorithm)?;
        let message = self.digest.digest(request)?;

        let client = RelayClient::new(info.relay_url.clone(), self.config.request_timeout)?;
        client.ping().await?;

        tracing::info!(
            session_id = %info.session_id,
            initiator = %info.initiator,
            relay = %info.relay_url,
            "Joining signing session"
        );

        let session = SessionConfig {
            session_id: info.session_id.clone(),
            local_party: self.config.local_party_id.clone(),
            peers: request.peers.clone().unwrap_or_default(),
            hex_encryption_key: info.hex_encryption_key.clone(),
            algorithm: info.algorithm,
            message,
            chain_path: request.chain_path.clone(),
            is_initiator: false,
            hosts_relay: false,
            timeouts: self.config.timeouts,
        };

        let result = self
            .run_session(session, key_share, factory, Arc::new(client))
            .await;
        report(&info.session_id, info.algorithm, false, &result);
        result
    }

    async fn run_session(
        &self,
        config: SessionConfig,
        key_share: KeyShare,
        factory: Arc<dyn EngineFactory>,
        transport: Arc<dyn RelayTransport>,
    ) -> Result<SigningResult, CoordinatorError> {
        let mut session = SigningSession::new(config, key_share, transport, factory)?
            .with_shutdown(self.shutdown.clone());
        let signature = session.run().await?;

        Ok(SigningResult {
            signature: signature.signature.clone(),
            raw: Some(signature),
            tx_id: None,
        })
    }
}

fn report(
    session_id: &str,
    algorithm: SignatureAlgorithm,
    initiator: bool,
    result: &Result<SigningResult, CoordinatorError>,
) {
    match result {
        Ok(_) => log_signing_event(session_id, algorithm, initiator, None),
        Err(e) => log_signing_event(
            session_id,
            algorithm,
            initiator,
            Some((e.error_code(), &e.to_string())),
        ),
    }
}
