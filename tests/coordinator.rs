//! Coordinator flows: self-hosted and external relays, cleanup on every exit

mod common;

use common::{ecdsa_share, fast_timeouts, EngineCounters, MockEcdsaFactory};
use mpc_keysign::frost::generate_key_shares;
use mpc_keysign::{
    CoordinatorConfig, CoordinatorError, FrostEngineFactory, KeyShare, MemoryVault, RelayClient,
    RelayConfig, RelayServer, RelayTransport, SignatureAlgorithm, SigningCoordinator,
    SigningRequest,
};
use std::sync::Arc;
use std::time::Duration;

const DIGEST_HEX: &str = "4242424242424242424242424242424242424242424242424242424242424242";

fn request(scheme: SignatureAlgorithm) -> SigningRequest {
    SigningRequest {
        network: "bitcoin".to_string(),
        scheme,
        curve: None,
        payload: DIGEST_HEX.to_string(),
        chain_path: "m".to_string(),
        session_id: None,
        peers: None,
    }
}

fn config(party: &str, relay_url: Option<String>) -> CoordinatorConfig {
    let mut config = CoordinatorConfig::new(party);
    config.relay_url = relay_url;
    config.request_timeout = Duration::from_secs(5);
    config.timeouts = fast_timeouts();
    config
}

fn frost_coordinator(party: &str, share: KeyShare) -> SigningCoordinator {
    SigningCoordinator::new(
        config(party, None),
        Arc::new(MemoryVault::new(party).with_share(share)),
    )
    .with_engine(Arc::new(FrostEngineFactory))
}

fn ecdsa_coordinator(
    party: &str,
    relay_url: &str,
    counters: &EngineCounters,
) -> SigningCoordinator {
    SigningCoordinator::new(
        config(party, Some(relay_url.to_string())),
        Arc::new(MemoryVault::new(party).with_share(ecdsa_share())),
    )
    .with_engine(Arc::new(MockEcdsaFactory {
        counters: counters.clone(),
    }))
}

#[tokio::test]
async fn test_self_hosted_frost_signing() {
    let parties = vec!["phone".to_string(), "laptop".to_string()];
    let shares = generate_key_shares(&parties, 2).unwrap();

    let initiator = frost_coordinator("phone", shares["phone"].clone());
    let joiner = frost_coordinator("laptop", shares["laptop"].clone());

    let prepared = initiator.prepare(&request(SignatureAlgorithm::Eddsa)).await.unwrap();
    let info = prepared.join_info().clone();
    assert_eq!(info.initiator, "phone");
    assert_eq!(info.algorithm, SignatureAlgorithm::Eddsa);
    assert_eq!(info.hex_encryption_key.len(), 64);
    assert_eq!(prepared.session_id(), info.session_id);

    // the advertised relay is reachable before the rounds start
    let client = RelayClient::new(info.relay_url.as_str(), Duration::from_secs(5)).unwrap();
    client.ping().await.unwrap();

    let join_request = request(SignatureAlgorithm::Eddsa);
    let (ours, theirs) = tokio::join!(
        initiator.run(prepared),
        joiner.join(&info, &join_request)
    );
    let (ours, theirs) = (ours.unwrap(), theirs.unwrap());

    assert_eq!(ours.signature, theirs.signature);
    assert_eq!(ours.signature.len(), 128);
    assert_eq!(ours.raw, theirs.raw);
    assert!(ours.tx_id.is_none());

    // the self-hosted relay is gone once the initiator returns
    assert!(client.ping().await.is_err());
}

#[tokio::test]
async fn test_external_relay_ecdsa_signing() {
    let server = RelayServer::start(&RelayConfig::default()).await.unwrap();
    let url = server.url();
    let counters = EngineCounters::default();

    let initiator = ecdsa_coordinator("alice", &url, &counters);
    let joiner = ecdsa_coordinator("bob", &url, &counters);

    let prepared = initiator.prepare(&request(SignatureAlgorithm::Ecdsa)).await.unwrap();
    let info = prepared.join_info().clone();
    assert_eq!(info.relay_url, url);

    let join_request = request(SignatureAlgorithm::Ecdsa);
    let (ours, theirs) = tokio::join!(
        initiator.run(prepared),
        joiner.join(&info, &join_request)
    );
    let (ours, theirs) = (ours.unwrap(), theirs.unwrap());

    assert_eq!(ours.signature, theirs.signature);
    assert!(ours.signature.starts_with("0x"));
    let raw = ours.raw.unwrap();
    assert!(raw.der_signature.is_some());
    assert!(raw.recovery_id.is_some());
    assert_eq!(counters.frees(), 2);

    // the initiator removed every trace of the session
    assert!(server.store().get_session(&info.session_id).await.is_none());
    assert_eq!(server.store().session_count().await, 0);
    assert!(server.store().get_messages(&info.session_id, "alice").await.is_empty());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_attempt_still_cleans_up() {
    let server = RelayServer::start(&RelayConfig::default()).await.unwrap();
    let url = server.url();
    let counters = EngineCounters::default();

    let mut config = config("alice", Some(url.clone()));
    config.timeouts.peer_wait = Duration::from_millis(300);
    let initiator = SigningCoordinator::new(
        config,
        Arc::new(MemoryVault::new("alice").with_share(ecdsa_share())),
    )
    .with_engine(Arc::new(MockEcdsaFactory {
        counters: counters.clone(),
    }));

    let mut req = request(SignatureAlgorithm::Ecdsa);
    req.session_id = Some("lonely".to_string());

    let err = initiator.sign(&req).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Session(_)));
    assert_eq!(err.error_code(), "PEER_TIMEOUT");
    assert_eq!(counters.frees(), 0);

    // the initiator had registered itself before giving up
    assert!(server.store().get_session("lonely").await.is_none());
    assert_eq!(server.store().session_count().await, 0);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_join_rejects_scheme_mismatch() {
    let server = RelayServer::start(&RelayConfig::default()).await.unwrap();
    let url = server.url();
    let counters = EngineCounters::default();

    let initiator = ecdsa_coordinator("alice", &url, &counters);
    let prepared = initiator.prepare(&request(SignatureAlgorithm::Ecdsa)).await.unwrap();
    let info = prepared.join_info().clone();
    drop(prepared);

    let joiner = ecdsa_coordinator("bob", &url, &counters);
    let err = joiner
        .join(&info, &request(SignatureAlgorithm::Eddsa))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INVALID_REQUEST");

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unreachable_external_relay() {
    // bind and drop to get a port nobody listens on
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let counters = EngineCounters::default();
    let initiator = ecdsa_coordinator("alice", &url, &counters);
    let err = match initiator.prepare(&request(SignatureAlgorithm::Ecdsa)).await {
        Err(e) => e,
        Ok(_) => panic!("expected the relay ping to fail"),
    };
    assert!(matches!(err, CoordinatorError::Relay(_)));
}
