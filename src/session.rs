//! Round-driven signing session
//!
//! One [`SigningSession`] drives one signing attempt:
//!
//! ```text
//! Init -> WaitingForPeers -> RoundActive -> Complete
//!   \            \               \
//!    +------------+---------------+--> Failed
//! ```
//!
//! Once the committee is known the session runs two loops side by side: the
//! outbound loop publishes whatever the engine produces, the inbound loop
//! feeds the engine whatever peers sent. Protocol bodies are encrypted with
//! the session key before they reach the relay. The ECDSA and EdDSA variants
//! share this orchestration and only differ in signature assembly.

use crate::config::SessionTimeouts;
use crate::crypto::{sha256_hex, CryptoError, MessageCrypto};
use crate::engine::{EngineContext, EngineError, EngineFactory, EngineHandle, KeyShare};
use crate::relay::{RelayError, RelayTransport};
use crate::signature::{self, SignatureError};
use crate::types::{KeysignSignature, PartyId, RelayMessage, SignatureAlgorithm};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no peer joined within {0:?}")]
    PeerTimeout(Duration),
    #[error("signing rounds did not complete within {0:?}")]
    ProtocolTimeout(Duration),
    #[error("setup message not received within {0:?}")]
    SetupTimeout(Duration),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("relay error: {0}")]
    Relay(#[from] RelayError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("session cancelled")]
    Cancelled,
    #[error("invalid session state: {0}")]
    InvalidState(String),
}

impl SessionError {
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::PeerTimeout(_) => "PEER_TIMEOUT",
            SessionError::ProtocolTimeout(_) => "PROTOCOL_TIMEOUT",
            SessionError::SetupTimeout(_) => "SETUP_TIMEOUT",
            SessionError::Engine(e) => e.error_code(),
            SessionError::Relay(e) => e.error_code(),
            SessionError::Crypto(e) => e.error_code(),
            SessionError::Signature(_) => "SIGNATURE_ERROR",
            SessionError::Cancelled => "CANCELLED",
            SessionError::InvalidState(_) => "INVALID_STATE",
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    WaitingForPeers,
    RoundActive,
    Complete,
    Failed,
}

/// Parameters of one signing attempt
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub session_id: String,
    pub local_party: PartyId,
    /// Peers already known; empty means wait for them on the relay
    pub peers: Vec<PartyId>,
    /// Hex-encoded 32-byte session key shared by every party
    pub hex_encryption_key: String,
    pub algorithm: SignatureAlgorithm,
    /// Digest to sign
    pub message: Vec<u8>,
    pub chain_path: String,
    /// The initiator publishes the committee and the setup message
    pub is_initiator: bool,
    /// The relay lives in this process and stops when the session ends
    pub hosts_relay: bool,
    pub timeouts: SessionTimeouts,
}

/// One signing attempt; never reused
pub struct SigningSession {
    config: SessionConfig,
    key_share: KeyShare,
    relay: Arc<dyn RelayTransport>,
    factory: Arc<dyn EngineFactory>,
    crypto: MessageCrypto,
    shutdown: watch::Receiver<bool>,
    state: SessionState,
    committee: Vec<PartyId>,
    result: Option<KeysignSignature>,
    error: Option<String>,
}

impl SigningSession {
    pub fn new(
        config: SessionConfig,
        key_share: KeyShare,
        relay: Arc<dyn RelayTransport>,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self, SessionError> {
        if key_share.algorithm != config.algorithm || factory.algorithm() != config.algorithm {
            return Err(SessionError::InvalidState(format!(
                "session is {}, key share is {}, engine is {}",
                config.algorithm,
                key_share.algorithm,
                factory.algorithm()
            )));
        }
        let crypto = MessageCrypto::from_hex(&config.hex_encryption_key)?;
        // a dropped sender never fires
        let (_, shutdown) = watch::channel(false);

        Ok(Self {
            config,
            key_share,
            relay,
            factory,
            crypto,
            shutdown,
            state: SessionState::Init,
            committee: Vec::new(),
            result: None,
            error: None,
        })
    }

    /// Cancel the session when the watched value becomes `true`
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn session_id(&self) -> &str {
        &self.config.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SessionState::Complete
    }

    pub fn result(&self) -> Option<&KeysignSignature> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Sorted committee, local party included; empty until peers are known
    pub fn committee(&self) -> &[PartyId] {
        &self.committee
    }

    /// Run the attempt to completion
    pub async fn run(&mut self) -> Result<KeysignSignature, SessionError> {
        if self.state != SessionState::Init {
            return Err(SessionError::InvalidState(
                "a session can only run once".to_string(),
            ));
        }

        tracing::info!(
            session_id = %self.config.session_id,
            party = %self.config.local_party,
            algorithm = %self.config.algorithm,
            initiator = self.config.is_initiator,
            "Starting signing session"
        );

        let mut shutdown = self.shutdown.clone();
        let result = tokio::select! {
            result = self.drive() => result,
            _ = cancelled(&mut shutdown) => Err(SessionError::Cancelled),
        };

        match &result {
            Ok(signature) => {
                self.state = SessionState::Complete;
                self.result = Some(signature.clone());
                tracing::info!(session_id = %self.config.session_id, "Signing session complete");
            }
            Err(e) => {
                self.state = SessionState::Failed;
                self.error = Some(e.to_string());
                tracing::warn!(
                    session_id = %self.config.session_id,
                    code = e.error_code(),
                    error = %e,
                    "Signing session failed"
                );
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<KeysignSignature, SessionError> {
        self.committee = self.wait_for_peers().await?;
        let setup = self.exchange_setup().await?;

        let ctx = EngineContext {
            session_id: &self.config.session_id,
            local_party: &self.config.local_party,
            parties: &self.committee,
            message: &self.config.message,
            chain_path: &self.config.chain_path,
            key_share: &self.key_share,
        };
        let engine = Mutex::new(EngineHandle::new(self.factory.create(&ctx, setup.as_deref())?));

        self.state = SessionState::RoundActive;
        tracing::debug!(
            session_id = %self.config.session_id,
            committee = ?self.committee,
            "Signing rounds started"
        );

        let complete = AtomicBool::new(false);
        let bound = self.config.timeouts.protocol;
        // one bound for both loops: the last outbound message may still be
        // in flight after the inbound loop finished
        // the handle frees the engine when this frame unwinds on error
        tokio::time::timeout(bound, async {
            tokio::try_join!(
                self.process_outbound(&engine, &complete),
                self.process_inbound(&engine, &complete),
            )
        })
        .await
        .map_err(|_| SessionError::ProtocolTimeout(bound))??;

        let signature = self.finish(&mut *engine.lock().await)?;
        self.publish_completion(&signature).await;
        Ok(signature)
    }

    /// Resolve the signing committee
    ///
    /// Returns at once when peers were supplied. Otherwise the initiator
    /// waits for a peer to register and publishes the committee, and a
    /// joiner waits for a published committee that includes it.
    pub async fn wait_for_peers(&mut self) -> Result<Vec<PartyId>, SessionError> {
        self.state = SessionState::WaitingForPeers;
        let local = self.config.local_party.clone();
        let sid = self.config.session_id.clone();
        let bound = self.config.timeouts.peer_wait;

        if !self.config.peers.is_empty() {
            let committee = committee_of(&local, &self.config.peers);
            if self.config.is_initiator {
                self.retry(|| self.relay.mark_tss_started(&sid, &committee)).await?;
            }
            return Ok(committee);
        }

        let committee = tokio::time::timeout(bound, self.poll_committee())
            .await
            .map_err(|_| SessionError::PeerTimeout(bound))??;

        tracing::info!(
            session_id = %sid,
            peers = committee.len() - 1,
            "Peers joined"
        );
        Ok(committee)
    }

    /// Register with the relay and poll until the committee is known
    async fn poll_committee(&self) -> Result<Vec<PartyId>, SessionError> {
        let sid = &self.config.session_id;
        let local = &self.config.local_party;
        self.retry(|| self.relay.start_session(sid, std::slice::from_ref(local)))
            .await?;

        loop {
            if self.config.is_initiator {
                let registered = self.retry(|| self.relay.get_session(sid)).await?;
                let peers: Vec<PartyId> = registered
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|p| p != local)
                    .collect();
                if !peers.is_empty() {
                    let committee = committee_of(local, &peers);
                    self.retry(|| self.relay.mark_tss_started(sid, &committee)).await?;
                    return Ok(committee);
                }
            } else if let Some(started) = self.retry(|| self.relay.get_tss_start(sid)).await? {
                if started.contains(local) {
                    let peers: Vec<PartyId> = started.into_iter().filter(|p| p != local).collect();
                    return Ok(committee_of(local, &peers));
                }
            }
            tokio::time::sleep(self.config.timeouts.peer_poll_interval).await;
        }
    }

    /// Distribute (initiator) or fetch (joiner) the engine setup message
    async fn exchange_setup(&self) -> Result<Option<Vec<u8>>, SessionError> {
        if !self.factory.uses_setup_message() {
            return Ok(None);
        }
        let sid = &self.config.session_id;
        let message_id = sha256_hex(&self.config.message);

        if self.config.is_initiator {
            let ctx = EngineContext {
                session_id: sid,
                local_party: &self.config.local_party,
                parties: &self.committee,
                message: &self.config.message,
                chain_path: &self.config.chain_path,
                key_share: &self.key_share,
            };
            let setup = self.factory.setup_message(&ctx)?;
            let encrypted = self.crypto.encrypt(&setup);
            self.retry(|| {
                self.relay
                    .upload_setup_message(sid, Some(&message_id), &encrypted)
            })
            .await?;
            tracing::debug!(session_id = %sid, "Uploaded setup message");
            return Ok(Some(setup));
        }

        let bound = self.config.timeouts.setup_wait;
        let setup = tokio::time::timeout(bound, self.poll_setup(&message_id))
            .await
            .map_err(|_| SessionError::SetupTimeout(bound))??;

        tracing::debug!(session_id = %sid, "Received setup message");
        Ok(Some(setup))
    }

    async fn poll_setup(&self, message_id: &str) -> Result<Vec<u8>, SessionError> {
        let sid = &self.config.session_id;
        loop {
            if let Some(encrypted) = self
                .retry(|| self.relay.get_setup_message(sid, Some(message_id)))
                .await?
            {
                return Ok(self.crypto.decrypt(&encrypted)?);
            }
            tokio::time::sleep(self.config.timeouts.peer_poll_interval).await;
        }
    }

    /// Publish engine output until the inbound loop reports completion
    async fn process_outbound(
        &self,
        engine: &Mutex<EngineHandle>,
        complete: &AtomicBool,
    ) -> Result<(), SessionError> {
        let mut sequence_no: u64 = 0;

        loop {
            let next = engine.lock().await.output_message()?;
            let Some(outbound) = next else {
                // drained; nothing more will be produced once complete
                if complete.load(Ordering::SeqCst) {
                    return Ok(());
                }
                tokio::time::sleep(self.config.timeouts.poll_interval).await;
                continue;
            };
            if outbound.receivers.is_empty() {
                continue;
            }

            let body = self.crypto.encrypt(&outbound.body);
            let hash = sha256_hex(&outbound.body);

            for receiver in &outbound.receivers {
                let message = RelayMessage {
                    session_id: self.config.session_id.clone(),
                    from: self.config.local_party.clone(),
                    to: vec![receiver.clone()],
                    body: body.clone(),
                    hash: hash.clone(),
                    sequence_no,
                };
                self.retry(|| self.relay.post_message(&message)).await?;
            }

            tracing::trace!(
                session_id = %self.config.session_id,
                sequence_no,
                receivers = outbound.receivers.len(),
                "Posted protocol message"
            );
            sequence_no += 1;
        }
    }

    /// Feed peer messages to the engine until it reports completion
    async fn process_inbound(
        &self,
        engine: &Mutex<EngineHandle>,
        complete: &AtomicBool,
    ) -> Result<(), SessionError> {
        let sid = &self.config.session_id;
        let local = &self.config.local_party;
        let mut processed: HashSet<(String, PartyId, String)> = HashSet::new();

        loop {
            let mut messages = self.retry(|| self.relay.get_messages(sid, local)).await?;
            // advisory only; the dedup cache is what guarantees correctness
            messages.sort_by_key(|m| m.sequence_no);

            for message in messages {
                let key = (sid.clone(), message.from.clone(), message.hash.clone());
                if processed.contains(&key) {
                    self.delete_best_effort(&message.hash).await;
                    continue;
                }

                let plaintext = self.crypto.decrypt(&message.body)?;
                let finished = engine.lock().await.input_message(&plaintext)?;
                processed.insert(key);
                self.delete_best_effort(&message.hash).await;

                tracing::trace!(
                    session_id = %sid,
                    from = %message.from,
                    sequence_no = message.sequence_no,
                    "Applied protocol message"
                );

                if finished {
                    complete.store(true, Ordering::SeqCst);
                    return Ok(());
                }
            }

            tokio::time::sleep(self.config.timeouts.poll_interval).await;
        }
    }

    async fn delete_best_effort(&self, hash: &str) {
        if let Err(e) = self
            .relay
            .delete_message(&self.config.session_id, &self.config.local_party, hash)
            .await
        {
            tracing::warn!(
                session_id = %self.config.session_id,
                hash = %hash,
                error = %e,
                "Failed to delete processed message"
            );
        }
    }

    /// Take the raw signature, free the engine, assemble the output
    fn finish(&self, engine: &mut EngineHandle) -> Result<KeysignSignature, SessionError> {
        let raw = engine.finish();
        engine.release();
        Ok(signature::assemble(self.config.algorithm, &raw?)?)
    }

    /// Best-effort completion markers; an initiator hosting the relay also
    /// keeps it alive until every peer reports completion
    async fn publish_completion(&self, signature: &KeysignSignature) {
        let sid = &self.config.session_id;
        let local = std::slice::from_ref(&self.config.local_party);

        if let Err(e) = self.relay.mark_tss_complete(sid, local).await {
            tracing::warn!(session_id = %sid, error = %e, "Failed to mark completion");
        }
        if !self.config.is_initiator {
            return;
        }

        match serde_json::to_vec(signature) {
            Ok(json) => {
                let message_id = sha256_hex(&self.config.message);
                let record = self.crypto.encrypt(&json);
                if let Err(e) = self.relay.set_keysign_finished(sid, &message_id, &record).await {
                    tracing::warn!(session_id = %sid, error = %e, "Failed to store keysign record");
                }
            }
            Err(e) => {
                tracing::warn!(session_id = %sid, error = %e, "Failed to encode keysign record");
            }
        }

        if !self.config.hosts_relay {
            return;
        }
        let bound = self.config.timeouts.protocol;
        if tokio::time::timeout(bound, self.await_peer_completion()).await.is_err() {
            tracing::warn!(session_id = %sid, "Not every peer reported completion");
        }
    }

    async fn await_peer_completion(&self) {
        loop {
            if let Ok(Some(done)) = self.relay.get_tss_complete(&self.config.session_id).await {
                if self.committee.iter().all(|p| done.contains(p)) {
                    return;
                }
            }
            tokio::time::sleep(self.config.timeouts.poll_interval).await;
        }
    }

    /// Retry transient relay failures with a fixed backoff
    ///
    /// Unbounded on its own; every caller sits under a timeout or a
    /// shutdown signal.
    async fn retry<T, F, Fut>(&self, mut op: F) -> Result<T, RelayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RelayError>>,
    {
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        session_id = %self.config.session_id,
                        error = %e,
                        "Relay call failed, retrying"
                    );
                    tokio::time::sleep(self.config.timeouts.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Sorted, deduplicated committee including the local party
fn committee_of(local: &str, peers: &[PartyId]) -> Vec<PartyId> {
    let mut committee: Vec<PartyId> = peers.to_vec();
    committee.push(local.to_string());
    committee.sort();
    committee.dedup();
    committee
}

/// Resolves once the watched flag is set; never if the sender is gone
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
