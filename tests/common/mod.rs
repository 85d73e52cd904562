//! Test engines and helpers shared by the integration tests

#![allow(dead_code)]

use mpc_keysign::engine::{EngineContext, EngineError, EngineFactory, OutboundMessage, SigningEngine};
use mpc_keysign::{KeyShare, PartyId, SessionConfig, SessionTimeouts, SignatureAlgorithm};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Counts engine calls across every engine a factory creates
#[derive(Clone, Default)]
pub struct EngineCounters {
    pub frees: Arc<AtomicUsize>,
    pub inputs: Arc<AtomicUsize>,
}

impl EngineCounters {
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> usize {
        self.inputs.load(Ordering::SeqCst)
    }
}

#[derive(Serialize, Deserialize)]
struct Contribution {
    from: PartyId,
    value: String,
}

/// Deterministic stand-in for an ECDSA engine
///
/// Every party broadcasts one contribution derived from its id and the
/// digest. Once all contributions are in, every party derives the same
/// `r || s || recovery` from them.
pub struct MockEcdsaEngine {
    peers: Vec<PartyId>,
    message: Vec<u8>,
    outbox: Option<OutboundMessage>,
    contributions: BTreeMap<PartyId, Vec<u8>>,
    counters: EngineCounters,
}

fn contribution(party: &str, message: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(party.as_bytes());
    hasher.update(message);
    hasher.finalize().to_vec()
}

impl MockEcdsaEngine {
    pub fn new(ctx: &EngineContext<'_>, counters: EngineCounters) -> Self {
        let peers: Vec<PartyId> = ctx
            .parties
            .iter()
            .filter(|p| p.as_str() != ctx.local_party)
            .cloned()
            .collect();
        let own = contribution(ctx.local_party, ctx.message);
        let body = serde_json::to_vec(&Contribution {
            from: ctx.local_party.to_string(),
            value: hex::encode(&own),
        })
        .unwrap();

        let mut contributions = BTreeMap::new();
        contributions.insert(ctx.local_party.to_string(), own);

        Self {
            outbox: Some(OutboundMessage {
                body,
                receivers: peers.clone(),
            }),
            peers,
            message: ctx.message.to_vec(),
            contributions,
            counters,
        }
    }

    fn done(&self) -> bool {
        self.contributions.len() == self.peers.len() + 1
    }
}

impl SigningEngine for MockEcdsaEngine {
    fn output_message(&mut self) -> Result<Option<OutboundMessage>, EngineError> {
        Ok(self.outbox.take())
    }

    fn input_message(&mut self, message: &[u8]) -> Result<bool, EngineError> {
        self.counters.inputs.fetch_add(1, Ordering::SeqCst);
        let c: Contribution =
            serde_json::from_slice(message).map_err(|e| EngineError::Protocol(e.to_string()))?;
        let value = hex::decode(&c.value).map_err(|e| EngineError::Protocol(e.to_string()))?;
        self.contributions.insert(c.from, value);
        Ok(self.done())
    }

    fn finish(&mut self) -> Result<Vec<u8>, EngineError> {
        if !self.done() {
            return Err(EngineError::NotFinished);
        }
        let derive = |label: &[u8]| {
            let mut hasher = Sha256::new();
            hasher.update(label);
            for value in self.contributions.values() {
                hasher.update(value);
            }
            hasher.update(&self.message);
            hasher.finalize().to_vec()
        };
        let r = derive(b"r");
        let s = derive(b"s");
        let recovery = r[31] & 1;

        let mut raw = r;
        raw.extend_from_slice(&s);
        raw.push(recovery);
        Ok(raw)
    }

    fn free(&mut self) {
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockEcdsaFactory {
    pub counters: EngineCounters,
}

impl EngineFactory for MockEcdsaFactory {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ecdsa
    }

    fn create(
        &self,
        ctx: &EngineContext<'_>,
        _setup: Option<&[u8]>,
    ) -> Result<Box<dyn SigningEngine>, EngineError> {
        Ok(Box::new(MockEcdsaEngine::new(ctx, self.counters.clone())))
    }
}

/// Engine that rejects every inbound message
pub struct FailingEngine {
    counters: EngineCounters,
}

impl SigningEngine for FailingEngine {
    fn output_message(&mut self) -> Result<Option<OutboundMessage>, EngineError> {
        Ok(None)
    }

    fn input_message(&mut self, _message: &[u8]) -> Result<bool, EngineError> {
        self.counters.inputs.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Protocol("malformed round message".to_string()))
    }

    fn finish(&mut self) -> Result<Vec<u8>, EngineError> {
        Err(EngineError::NotFinished)
    }

    fn free(&mut self) {
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FailingFactory {
    pub counters: EngineCounters,
}

impl EngineFactory for FailingFactory {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ecdsa
    }

    fn create(
        &self,
        _ctx: &EngineContext<'_>,
        _setup: Option<&[u8]>,
    ) -> Result<Box<dyn SigningEngine>, EngineError> {
        Ok(Box::new(FailingEngine {
            counters: self.counters.clone(),
        }))
    }
}

/// Engine that finishes on its first input and only then queues a reply
pub struct LastWordEngine {
    reply_to: PartyId,
    outbox: Option<OutboundMessage>,
    counters: EngineCounters,
}

impl SigningEngine for LastWordEngine {
    fn output_message(&mut self) -> Result<Option<OutboundMessage>, EngineError> {
        Ok(self.outbox.take())
    }

    fn input_message(&mut self, _message: &[u8]) -> Result<bool, EngineError> {
        self.counters.inputs.fetch_add(1, Ordering::SeqCst);
        self.outbox = Some(OutboundMessage {
            body: b"final round".to_vec(),
            receivers: vec![self.reply_to.clone()],
        });
        Ok(true)
    }

    fn finish(&mut self) -> Result<Vec<u8>, EngineError> {
        Ok(vec![0x11; 65])
    }

    fn free(&mut self) {
        self.counters.frees.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct LastWordFactory {
    pub reply_to: PartyId,
    pub counters: EngineCounters,
}

impl EngineFactory for LastWordFactory {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ecdsa
    }

    fn create(
        &self,
        _ctx: &EngineContext<'_>,
        _setup: Option<&[u8]>,
    ) -> Result<Box<dyn SigningEngine>, EngineError> {
        Ok(Box::new(LastWordEngine {
            reply_to: self.reply_to.clone(),
            outbox: None,
            counters: self.counters.clone(),
        }))
    }
}

/// Key share for engines that do not read share data
pub fn ecdsa_share() -> KeyShare {
    KeyShare {
        algorithm: SignatureAlgorithm::Ecdsa,
        public_key: "02".to_string() + &"00".repeat(32),
        data: Vec::new(),
    }
}

/// Default bounds with quick membership polling
pub fn fast_timeouts() -> SessionTimeouts {
    SessionTimeouts {
        peer_poll_interval: Duration::from_millis(100),
        ..SessionTimeouts::default()
    }
}

pub fn session_config(
    session_id: &str,
    party: &str,
    peers: &[&str],
    is_initiator: bool,
    hex_key: &str,
    algorithm: SignatureAlgorithm,
    message: &[u8],
) -> SessionConfig {
    SessionConfig {
        session_id: session_id.to_string(),
        local_party: party.to_string(),
        peers: peers.iter().map(|p| p.to_string()).collect(),
        hex_encryption_key: hex_key.to_string(),
        algorithm,
        message: message.to_vec(),
        chain_path: "m/44'/60'/0'/0/0".to_string(),
        is_initiator,
        hosts_relay: false,
        timeouts: fast_timeouts(),
    }
}
