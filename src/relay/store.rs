//! In-memory relay state
//!
//! Every map sits behind its own lock. Keys are disjoint across sessions and
//! participants, so there is no cross-session contention. Nothing is
//! persisted; state lives as long as the store does.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{RelayError, RelayTransport};
use crate::crypto::sha256_hex;
use crate::types::{PartyId, RelayMessage};

type InboxKey = (String, PartyId);
type SetupKey = (String, Option<String>);

/// Ephemeral relay state, owned by whoever started the relay
///
/// Cloning is cheap and shares the underlying maps.
#[derive(Clone, Default)]
pub struct RelayStore {
    /// session -> registered parties
    sessions: Arc<RwLock<HashMap<String, Vec<PartyId>>>>,
    /// (session, participant) -> inbox
    messages: Arc<RwLock<HashMap<InboxKey, Vec<RelayMessage>>>>,
    /// sha256 hex -> payload bytes
    payloads: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    /// (session, message id) -> setup message
    setup_messages: Arc<RwLock<HashMap<SetupKey, Vec<u8>>>>,
    /// session -> committee that started the rounds
    started: Arc<RwLock<HashMap<String, Vec<PartyId>>>>,
    /// session -> parties that completed
    completed: Arc<RwLock<HashMap<String, Vec<PartyId>>>>,
    /// (session, message id) -> keysign completion record
    keysign_finished: Arc<RwLock<HashMap<(String, String), Vec<u8>>>>,
}

fn append_unique(list: &mut Vec<PartyId>, parties: &[PartyId]) {
    for party in parties {
        if !list.contains(party) {
            list.push(party.clone());
        }
    }
}

impl RelayStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a session exists and register `parties` with it
    pub async fn start_session(&self, session_id: &str, parties: &[PartyId]) {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session_id.to_string()).or_default();
        append_unique(entry, parties);
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Vec<PartyId>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Purge inboxes, parties, markers and setup state of a session
    pub async fn delete_session(&self, session_id: &str) {
        self.sessions.write().await.remove(session_id);
        self.messages
            .write()
            .await
            .retain(|(session, _), _| session != session_id);
        self.setup_messages
            .write()
            .await
            .retain(|(session, _), _| session != session_id);
        self.started.write().await.remove(session_id);
        self.completed.write().await.remove(session_id);
        self.keysign_finished
            .write()
            .await
            .retain(|(session, _), _| session != session_id);
    }

    /// Store one copy of the message per receiver
    pub async fn post_message(&self, session_id: &str, message: RelayMessage) -> Result<(), RelayError> {
        if message.from.is_empty() {
            return Err(RelayError::InvalidMessage("missing from".to_string()));
        }
        if message.to.is_empty() {
            return Err(RelayError::InvalidMessage("missing to".to_string()));
        }
        if message.body.is_empty() {
            return Err(RelayError::InvalidMessage("missing body".to_string()));
        }

        let message = RelayMessage {
            session_id: session_id.to_string(),
            ..message
        };

        let mut messages = self.messages.write().await;
        for receiver in &message.to {
            messages
                .entry((session_id.to_string(), receiver.clone()))
                .or_default()
                .push(message.clone());
        }

        tracing::trace!(
            session_id = %session_id,
            from = %message.from,
            receivers = message.to.len(),
            hash = %message.hash,
            "Stored relay message"
        );
        Ok(())
    }

    pub async fn get_messages(&self, session_id: &str, participant: &str) -> Vec<RelayMessage> {
        self.messages
            .read()
            .await
            .get(&(session_id.to_string(), participant.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Remove messages with `hash` from an inbox
    ///
    /// Returns false when the inbox itself does not exist.
    pub async fn delete_message(&self, session_id: &str, participant: &str, hash: &str) -> bool {
        let mut messages = self.messages.write().await;
        match messages.get_mut(&(session_id.to_string(), participant.to_string())) {
            Some(inbox) => {
                inbox.retain(|m| m.hash != hash);
                true
            }
            None => false,
        }
    }

    pub async fn mark_tss_started(&self, session_id: &str, parties: &[PartyId]) {
        self.started
            .write()
            .await
            .insert(session_id.to_string(), parties.to_vec());
    }

    pub async fn get_tss_start(&self, session_id: &str) -> Option<Vec<PartyId>> {
        self.started.read().await.get(session_id).cloned()
    }

    pub async fn mark_tss_complete(&self, session_id: &str, parties: &[PartyId]) {
        let mut completed = self.completed.write().await;
        let entry = completed.entry(session_id.to_string()).or_default();
        append_unique(entry, parties);
    }

    pub async fn get_tss_complete(&self, session_id: &str) -> Option<Vec<PartyId>> {
        self.completed.read().await.get(session_id).cloned()
    }

    pub async fn set_keysign_finished(&self, session_id: &str, message_id: &str, payload: Vec<u8>) {
        self.keysign_finished
            .write()
            .await
            .insert((session_id.to_string(), message_id.to_string()), payload);
    }

    pub async fn get_keysign_finished(&self, session_id: &str, message_id: &str) -> Option<Vec<u8>> {
        self.keysign_finished
            .read()
            .await
            .get(&(session_id.to_string(), message_id.to_string()))
            .cloned()
    }

    pub async fn set_setup_message(&self, session_id: &str, message_id: Option<&str>, payload: Vec<u8>) {
        self.setup_messages
            .write()
            .await
            .insert((session_id.to_string(), message_id.map(str::to_string)), payload);
    }

    pub async fn get_setup_message(&self, session_id: &str, message_id: Option<&str>) -> Option<Vec<u8>> {
        self.setup_messages
            .read()
            .await
            .get(&(session_id.to_string(), message_id.map(str::to_string)))
            .cloned()
    }

    /// Store bytes under their hash, rejecting anything that does not hash to it
    pub async fn store_payload(&self, hash: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        let actual = sha256_hex(&payload);
        if !actual.eq_ignore_ascii_case(hash) {
            tracing::warn!(expected = %hash, actual = %actual, "Rejected payload with mismatching hash");
            return Err(RelayError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        self.payloads.write().await.insert(actual, payload);
        Ok(())
    }

    pub async fn get_payload(&self, hash: &str) -> Option<Vec<u8>> {
        self.payloads
            .read()
            .await
            .get(&hash.to_ascii_lowercase())
            .cloned()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn encode_record(payload: &str) -> Result<Vec<u8>, RelayError> {
    serde_json::to_vec(payload).map_err(|e| RelayError::Decode(e.to_string()))
}

fn decode_record(bytes: Option<Vec<u8>>) -> Result<Option<String>, RelayError> {
    bytes
        .map(|b| serde_json::from_slice::<String>(&b).map_err(|e| RelayError::Decode(e.to_string())))
        .transpose()
}

/// In-process transport; records are kept JSON-encoded exactly as the HTTP
/// surface stores them.
#[async_trait]
impl RelayTransport for RelayStore {
    async fn ping(&self) -> Result<(), RelayError> {
        Ok(())
    }

    async fn start_session(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError> {
        RelayStore::start_session(self, session_id, parties).await;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError> {
        Ok(RelayStore::get_session(self, session_id).await)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), RelayError> {
        RelayStore::delete_session(self, session_id).await;
        Ok(())
    }

    async fn post_message(&self, message: &RelayMessage) -> Result<(), RelayError> {
        RelayStore::post_message(self, &message.session_id, message.clone()).await
    }

    async fn get_messages(
        &self,
        session_id: &str,
        participant: &str,
    ) -> Result<Vec<RelayMessage>, RelayError> {
        Ok(RelayStore::get_messages(self, session_id, participant).await)
    }

    async fn delete_message(
        &self,
        session_id: &str,
        participant: &str,
        hash: &str,
    ) -> Result<(), RelayError> {
        RelayStore::delete_message(self, session_id, participant, hash).await;
        Ok(())
    }

    async fn mark_tss_started(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError> {
        RelayStore::mark_tss_started(self, session_id, parties).await;
        Ok(())
    }

    async fn get_tss_start(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError> {
        Ok(RelayStore::get_tss_start(self, session_id).await)
    }

    async fn mark_tss_complete(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError> {
        RelayStore::mark_tss_complete(self, session_id, parties).await;
        Ok(())
    }

    async fn get_tss_complete(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError> {
        Ok(RelayStore::get_tss_complete(self, session_id).await)
    }

    async fn set_keysign_finished(
        &self,
        session_id: &str,
        message_id: &str,
        payload: &str,
    ) -> Result<(), RelayError> {
        let record = encode_record(payload)?;
        RelayStore::set_keysign_finished(self, session_id, message_id, record).await;
        Ok(())
    }

    async fn get_keysign_finished(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<String>, RelayError> {
        decode_record(RelayStore::get_keysign_finished(self, session_id, message_id).await)
    }

    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> Result<(), RelayError> {
        let record = encode_record(payload)?;
        self.set_setup_message(session_id, message_id, record).await;
        Ok(())
    }

    async fn get_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> Result<Option<String>, RelayError> {
        decode_record(RelayStore::get_setup_message(self, session_id, message_id).await)
    }

    async fn store_payload(&self, hash: &str, payload: &[u8]) -> Result<(), RelayError> {
        RelayStore::store_payload(self, hash, payload.to_vec()).await
    }

    async fn get_payload(&self, hash: &str) -> Result<Option<Vec<u8>>, RelayError> {
        Ok(RelayStore::get_payload(self, hash).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(from: &str, to: &[&str], hash: &str) -> RelayMessage {
        RelayMessage {
            session_id: String::new(),
            from: from.to_string(),
            to: to.iter().map(|s| s.to_string()).collect(),
            body: "QmFzZTY0".to_string(),
            hash: hash.to_string(),
            sequence_no: 0,
        }
    }

    #[tokio::test]
    async fn test_start_session_appends_parties() {
        let store = RelayStore::new();
        store.start_session("s1", &["A".to_string()]).await;
        store.start_session("s1", &["B".to_string(), "A".to_string()]).await;
        assert_eq!(
            store.get_session("s1").await.unwrap(),
            vec!["A".to_string(), "B".to_string()]
        );
        assert!(store.get_session("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_post_message_fans_out() {
        let store = RelayStore::new();
        store
            .post_message("s1", message("A", &["B", "C"], "h1"))
            .await
            .unwrap();

        let for_b = store.get_messages("s1", "B").await;
        let for_c = store.get_messages("s1", "C").await;
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_c.len(), 1);
        assert_eq!(for_b[0].session_id, "s1");
        assert!(store.get_messages("s1", "A").await.is_empty());

        // reading does not clear
        assert_eq!(store.get_messages("s1", "B").await.len(), 1);
    }

    #[tokio::test]
    async fn test_post_message_validation() {
        let store = RelayStore::new();
        let mut msg = message("", &["B"], "h");
        assert!(matches!(
            store.post_message("s1", msg.clone()).await,
            Err(RelayError::InvalidMessage(_))
        ));
        msg.from = "A".into();
        msg.to.clear();
        assert!(store.post_message("s1", msg.clone()).await.is_err());
        msg.to = vec!["B".into()];
        msg.body.clear();
        assert!(store.post_message("s1", msg).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_message() {
        let store = RelayStore::new();
        store.post_message("s1", message("A", &["B"], "h1")).await.unwrap();
        store.post_message("s1", message("A", &["B"], "h2")).await.unwrap();

        assert!(store.delete_message("s1", "B", "h1").await);
        let remaining = store.get_messages("s1", "B").await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].hash, "h2");

        // unknown hash is fine, unknown inbox is reported
        assert!(store.delete_message("s1", "B", "nope").await);
        assert!(!store.delete_message("s1", "Z", "h2").await);
    }

    #[tokio::test]
    async fn test_delete_session_purges_everything() {
        let store = RelayStore::new();
        store.start_session("s1", &["A".to_string()]).await;
        store.start_session("s2", &["A".to_string()]).await;
        store.post_message("s1", message("A", &["B"], "h1")).await.unwrap();
        store.post_message("s2", message("A", &["B"], "h1")).await.unwrap();
        store.set_setup_message("s1", None, b"setup".to_vec()).await;
        store.mark_tss_started("s1", &["A".to_string()]).await;
        store.set_keysign_finished("s1", "m1", b"done".to_vec()).await;

        store.delete_session("s1").await;

        assert!(store.get_session("s1").await.is_none());
        assert!(store.get_messages("s1", "B").await.is_empty());
        assert!(store.get_setup_message("s1", None).await.is_none());
        assert!(store.get_tss_start("s1").await.is_none());
        assert!(store.get_keysign_finished("s1", "m1").await.is_none());

        assert!(store.get_session("s2").await.is_some());
        assert_eq!(store.get_messages("s2", "B").await.len(), 1);
    }

    #[tokio::test]
    async fn test_payload_integrity() {
        let store = RelayStore::new();
        let payload = b"psbt bytes".to_vec();
        let hash = sha256_hex(&payload);

        let err = store.store_payload(&"00".repeat(32), payload.clone()).await;
        assert!(matches!(err, Err(RelayError::HashMismatch { .. })));
        assert!(store.get_payload(&hash).await.is_none());

        store.store_payload(&hash, payload.clone()).await.unwrap();
        assert_eq!(store.get_payload(&hash).await.unwrap(), payload);
        assert_eq!(store.get_payload(&hash.to_uppercase()).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_markers() {
        let store = RelayStore::new();
        assert!(store.get_tss_start("s1").await.is_none());
        store
            .mark_tss_started("s1", &["A".to_string(), "B".to_string()])
            .await;
        assert_eq!(store.get_tss_start("s1").await.unwrap().len(), 2);

        store.mark_tss_complete("s1", &["A".to_string()]).await;
        store.mark_tss_complete("s1", &["B".to_string(), "A".to_string()]).await;
        assert_eq!(
            store.get_tss_complete("s1").await.unwrap(),
            vec!["A".to_string(), "B".to_string()]
        );
    }

    #[tokio::test]
    async fn test_transport_records_round_trip() {
        let store = RelayStore::new();
        let transport: &dyn RelayTransport = &store;
        transport
            .upload_setup_message("s1", Some("m1"), "encrypted-setup")
            .await
            .unwrap();
        assert_eq!(
            transport.get_setup_message("s1", Some("m1")).await.unwrap().as_deref(),
            Some("encrypted-setup")
        );
        assert!(transport.get_setup_message("s1", None).await.unwrap().is_none());
    }
}
