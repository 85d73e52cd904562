//! FROST signing engine
//!
//! Drives the two-round FROST protocol for threshold Schnorr signatures
//! (secp256k1, Taproot ciphersuite) through the opaque [`SigningEngine`]
//! contract:
//!
//! 1. every signer broadcasts its nonce commitment
//! 2. once all commitments are in, every signer broadcasts its signature share
//! 3. once all shares are in, every signer aggregates locally
//!
//! The finished signature is the 64-byte `R.x || s`.

use crate::engine::{EngineContext, EngineError, EngineFactory, KeyShare, OutboundMessage, SigningEngine};
use crate::types::{PartyId, SignatureAlgorithm};
use frost_secp256k1_tr as frost;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Serialized FROST key material carried in [`KeyShare::data`]
#[derive(Debug, Serialize, Deserialize)]
pub struct FrostShareData {
    /// Serialized FROST key package
    pub key_package: Vec<u8>,
    /// Serialized FROST public key package
    pub public_key_package: Vec<u8>,
}

/// Setup message distributed by the initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrostSetup {
    pub session_id: String,
    /// Signing committee, sorted
    pub parties: Vec<PartyId>,
    /// Hex-encoded digest to sign
    pub message: String,
    pub chain_path: String,
}

/// Protocol messages exchanged between signers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "round", rename_all = "snake_case")]
enum FrostMessage {
    Commitment { identifier: String, commitment: String },
    Share { identifier: String, share: String },
}

fn frost_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Protocol(e.to_string())
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, EngineError> {
    hex::decode(value).map_err(|e| EngineError::Protocol(format!("invalid {} hex: {}", field, e)))
}

/// Wrap FROST packages into a key share
pub fn key_share(
    key_package: &frost::keys::KeyPackage,
    public_key_package: &frost::keys::PublicKeyPackage,
) -> Result<KeyShare, EngineError> {
    let data = FrostShareData {
        key_package: key_package
            .serialize()
            .map_err(|e| EngineError::InvalidKeyShare(e.to_string()))?,
        public_key_package: public_key_package
            .serialize()
            .map_err(|e| EngineError::InvalidKeyShare(e.to_string()))?,
    };

    Ok(KeyShare {
        algorithm: SignatureAlgorithm::Eddsa,
        public_key: hex::encode(group_public_key(public_key_package)?),
        data: serde_json::to_vec(&data).map_err(|e| EngineError::InvalidKeyShare(e.to_string()))?,
    })
}

/// Unpack FROST packages from a key share
pub fn unpack_key_share(
    share: &KeyShare,
) -> Result<(frost::keys::KeyPackage, frost::keys::PublicKeyPackage), EngineError> {
    if share.algorithm != SignatureAlgorithm::Eddsa {
        return Err(EngineError::InvalidKeyShare(format!(
            "expected eddsa share, got {}",
            share.algorithm
        )));
    }
    let data: FrostShareData = serde_json::from_slice(&share.data)
        .map_err(|e| EngineError::InvalidKeyShare(e.to_string()))?;
    let key_package = frost::keys::KeyPackage::deserialize(&data.key_package)
        .map_err(|e| EngineError::InvalidKeyShare(e.to_string()))?;
    let public_key_package = frost::keys::PublicKeyPackage::deserialize(&data.public_key_package)
        .map_err(|e| EngineError::InvalidKeyShare(e.to_string()))?;
    Ok((key_package, public_key_package))
}

/// Group public key (x-only, 32 bytes)
pub fn group_public_key(
    public_key_package: &frost::keys::PublicKeyPackage,
) -> Result<[u8; 32], EngineError> {
    // compressed point: parity byte followed by the x-coordinate
    let serialized = public_key_package
        .verifying_key()
        .serialize()
        .map_err(|e| EngineError::InvalidKeyShare(e.to_string()))?;
    if serialized.len() != 33 {
        return Err(EngineError::InvalidKeyShare(format!(
            "unexpected verifying key length {}",
            serialized.len()
        )));
    }
    let mut x_only = [0u8; 32];
    x_only.copy_from_slice(&serialized[1..33]);
    Ok(x_only)
}

/// Generate key shares with a trusted dealer (development only)
///
/// Parties are assigned FROST identifiers in sorted order.
pub fn generate_key_shares(
    parties: &[PartyId],
    threshold: u16,
) -> Result<BTreeMap<PartyId, KeyShare>, EngineError> {
    let mut sorted = parties.to_vec();
    sorted.sort();
    sorted.dedup();

    let mut rng = rand::rngs::OsRng;
    let (shares, pubkey_package) = frost::keys::generate_with_dealer(
        sorted.len() as u16,
        threshold,
        frost::keys::IdentifierList::Default,
        &mut rng,
    )
    .map_err(frost_error)?;

    sorted
        .into_iter()
        .zip(shares.into_values())
        .map(|(party, secret_share)| {
            let key_package =
                frost::keys::KeyPackage::try_from(secret_share).map_err(frost_error)?;
            Ok((party, key_share(&key_package, &pubkey_package)?))
        })
        .collect()
}

/// One signer's FROST state
pub struct FrostEngine {
    local_party: PartyId,
    peers: Vec<PartyId>,
    /// Number of signers taking part
    signers: usize,
    message: Vec<u8>,
    key_package: Option<frost::keys::KeyPackage>,
    public_key_package: frost::keys::PublicKeyPackage,
    nonces: Option<frost::round1::SigningNonces>,
    commitments: BTreeMap<frost::Identifier, frost::round1::SigningCommitments>,
    shares: BTreeMap<frost::Identifier, frost::round2::SignatureShare>,
    signing_package: Option<frost::SigningPackage>,
    outbox: VecDeque<OutboundMessage>,
    signature: Option<Vec<u8>>,
}

impl FrostEngine {
    /// Create the engine and queue the round 1 commitment
    pub fn new(
        local_party: &str,
        parties: &[PartyId],
        message: &[u8],
        key_package: frost::keys::KeyPackage,
        public_key_package: frost::keys::PublicKeyPackage,
    ) -> Result<Self, EngineError> {
        if !parties.iter().any(|p| p == local_party) {
            return Err(EngineError::Protocol(format!(
                "local party {} is not in the committee",
                local_party
            )));
        }
        let min_signers = *key_package.min_signers() as usize;
        if parties.len() < min_signers {
            return Err(EngineError::Protocol(format!(
                "committee of {} is below the threshold of {}",
                parties.len(),
                min_signers
            )));
        }

        let peers: Vec<PartyId> = parties
            .iter()
            .filter(|p| p.as_str() != local_party)
            .cloned()
            .collect();

        let mut rng = rand::thread_rng();
        let (nonces, commitment) = frost::round1::commit(key_package.signing_share(), &mut rng);
        let identifier = *key_package.identifier();

        let body = serde_json::to_vec(&FrostMessage::Commitment {
            identifier: hex::encode(identifier.serialize()),
            commitment: hex::encode(commitment.serialize().map_err(frost_error)?),
        })
        .map_err(frost_error)?;

        let mut commitments = BTreeMap::new();
        commitments.insert(identifier, commitment);

        let mut outbox = VecDeque::new();
        outbox.push_back(OutboundMessage {
            body,
            receivers: peers.clone(),
        });

        tracing::debug!(
            party = %local_party,
            signers = parties.len(),
            "Generated round 1 commitment"
        );

        Ok(Self {
            local_party: local_party.to_string(),
            peers,
            signers: parties.len(),
            message: message.to_vec(),
            key_package: Some(key_package),
            public_key_package,
            nonces: Some(nonces),
            commitments,
            shares: BTreeMap::new(),
            signing_package: None,
            outbox,
            signature: None,
        })
    }

    fn parse_identifier(hex_id: &str) -> Result<frost::Identifier, EngineError> {
        frost::Identifier::deserialize(&decode_hex("identifier", hex_id)?).map_err(frost_error)
    }

    /// Sign once every commitment is in, aggregate once every share is in
    fn advance(&mut self) -> Result<bool, EngineError> {
        if self.signing_package.is_none() && self.commitments.len() == self.signers {
            let nonces = self.nonces.take().ok_or(EngineError::Released)?;
            let key_package = self.key_package.as_ref().ok_or(EngineError::Released)?;

            let signing_package = frost::SigningPackage::new(self.commitments.clone(), &self.message);
            let share = frost::round2::sign(&signing_package, &nonces, key_package).map_err(frost_error)?;
            let identifier = *key_package.identifier();

            let body = serde_json::to_vec(&FrostMessage::Share {
                identifier: hex::encode(identifier.serialize()),
                share: hex::encode(share.serialize()),
            })
            .map_err(frost_error)?;

            self.shares.insert(identifier, share);
            self.outbox.push_back(OutboundMessage {
                body,
                receivers: self.peers.clone(),
            });
            self.signing_package = Some(signing_package);

            tracing::debug!(party = %self.local_party, "Generated round 2 signature share");
        }

        if self.signature.is_none() && self.shares.len() == self.signers {
            if let Some(signing_package) = &self.signing_package {
                let signature = frost::aggregate(signing_package, &self.shares, &self.public_key_package)
                    .map_err(frost_error)?;
                let bytes = signature.serialize().map_err(frost_error)?;
                if bytes.len() != 64 {
                    return Err(EngineError::Protocol(format!(
                        "invalid signature length: expected 64, got {}",
                        bytes.len()
                    )));
                }
                self.signature = Some(bytes);

                tracing::debug!(party = %self.local_party, "Aggregated signature");
            }
        }

        Ok(self.signature.is_some())
    }
}

impl SigningEngine for FrostEngine {
    fn output_message(&mut self) -> Result<Option<OutboundMessage>, EngineError> {
        Ok(self.outbox.pop_front())
    }

    fn input_message(&mut self, message: &[u8]) -> Result<bool, EngineError> {
        let message: FrostMessage = serde_json::from_slice(message).map_err(frost_error)?;

        match message {
            FrostMessage::Commitment {
                identifier,
                commitment,
            } => {
                let identifier = Self::parse_identifier(&identifier)?;
                let commitment = frost::round1::SigningCommitments::deserialize(&decode_hex(
                    "commitment",
                    &commitment,
                )?)
                .map_err(frost_error)?;

                if self.signing_package.is_some() && !self.commitments.contains_key(&identifier) {
                    return Err(EngineError::Protocol(
                        "commitment arrived after signing started".to_string(),
                    ));
                }
                if let Some(existing) = self.commitments.get(&identifier) {
                    if *existing != commitment {
                        return Err(EngineError::Protocol(
                            "conflicting commitment from signer".to_string(),
                        ));
                    }
                } else {
                    self.commitments.insert(identifier, commitment);
                }
            }
            FrostMessage::Share { identifier, share } => {
                let identifier = Self::parse_identifier(&identifier)?;
                let share = frost::round2::SignatureShare::deserialize(&decode_hex("share", &share)?)
                    .map_err(frost_error)?;
                self.shares.entry(identifier).or_insert(share);
            }
        }

        self.advance()
    }

    fn finish(&mut self) -> Result<Vec<u8>, EngineError> {
        self.signature.clone().ok_or(EngineError::NotFinished)
    }

    fn free(&mut self) {
        self.nonces = None;
        self.key_package = None;
        self.outbox.clear();
        self.commitments.clear();
        self.shares.clear();
        self.signing_package = None;
    }
}

/// Factory for [`FrostEngine`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct FrostEngineFactory;

impl EngineFactory for FrostEngineFactory {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Eddsa
    }

    fn uses_setup_message(&self) -> bool {
        true
    }

    fn setup_message(&self, ctx: &EngineContext<'_>) -> Result<Vec<u8>, EngineError> {
        let setup = FrostSetup {
            session_id: ctx.session_id.to_string(),
            parties: ctx.parties.to_vec(),
            message: hex::encode(ctx.message),
            chain_path: ctx.chain_path.to_string(),
        };
        serde_json::to_vec(&setup).map_err(|e| EngineError::InvalidSetup(e.to_string()))
    }

    fn create(
        &self,
        ctx: &EngineContext<'_>,
        setup: Option<&[u8]>,
    ) -> Result<Box<dyn SigningEngine>, EngineError> {
        let setup: FrostSetup = match setup {
            Some(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| EngineError::InvalidSetup(e.to_string()))?,
            None => return Err(EngineError::InvalidSetup("missing setup message".to_string())),
        };

        if setup.session_id != ctx.session_id {
            return Err(EngineError::InvalidSetup("session mismatch".to_string()));
        }
        if setup.message != hex::encode(ctx.message) {
            return Err(EngineError::InvalidSetup(
                "setup digest differs from the digest to sign".to_string(),
            ));
        }

        let (key_package, public_key_package) = unpack_key_share(ctx.key_share)?;
        let engine = FrostEngine::new(
            ctx.local_party,
            &setup.parties,
            ctx.message,
            key_package,
            public_key_package,
        )?;
        Ok(Box::new(engine))
    }
}
