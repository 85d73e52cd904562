//! HTTP client for a remote relay

use super::{RelayError, RelayTransport, MESSAGE_ID_HEADER};
use crate::types::{ErrorResponse, PartyId, RelayMessage};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use std::time::Duration;

/// Relay client used by parties that do not host the relay themselves
#[derive(Clone)]
pub struct RelayClient {
    /// Relay base URL, without trailing slash
    base_url: String,
    /// HTTP client for relay communication
    http_client: reqwest::Client,
}

impl RelayClient {
    /// Create a client with an explicit per-request timeout
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Response, RelayError> {
        request.send().await.map_err(transport_error)
    }

    /// GET returning `None` on 404
    async fn get_optional(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Option<Response>, RelayError> {
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(response).await.map(Some)
    }

    async fn get_json_list(&self, path: &str) -> Result<Option<Vec<PartyId>>, RelayError> {
        match self.get_optional(self.http_client.get(self.url(path))).await? {
            Some(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| RelayError::Decode(e.to_string())),
            None => Ok(None),
        }
    }

    async fn get_record(
        &self,
        path: &str,
        message_id: Option<&str>,
    ) -> Result<Option<String>, RelayError> {
        let mut request = self.http_client.get(self.url(path));
        if let Some(id) = message_id {
            request = request.header(MESSAGE_ID_HEADER, id);
        }
        match self.get_optional(request).await? {
            Some(response) => response
                .json::<String>()
                .await
                .map(Some)
                .map_err(|e| RelayError::Decode(e.to_string())),
            None => Ok(None),
        }
    }
}

fn transport_error(err: reqwest::Error) -> RelayError {
    if err.is_timeout() {
        RelayError::Timeout(err.to_string())
    } else {
        RelayError::Network(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, RelayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RelayError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl RelayTransport for RelayClient {
    async fn ping(&self) -> Result<(), RelayError> {
        let response = self.send(self.http_client.get(self.url("/ping"))).await?;
        check_status(response).await.map(|_| ())
    }

    async fn start_session(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError> {
        let request = self
            .http_client
            .post(self.url(&format!("/{}", session_id)))
            .json(parties);
        check_status(self.send(request).await?).await.map(|_| ())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError> {
        self.get_json_list(&format!("/{}", session_id)).await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), RelayError> {
        let request = self.http_client.delete(self.url(&format!("/{}", session_id)));
        check_status(self.send(request).await?).await.map(|_| ())
    }

    async fn post_message(&self, message: &RelayMessage) -> Result<(), RelayError> {
        let request = self
            .http_client
            .post(self.url(&format!("/message/{}", message.session_id)))
            .json(message);
        let response = self.send(request).await?;
        if response.status() == StatusCode::PRECONDITION_FAILED {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::InvalidMessage(body));
        }
        check_status(response).await.map(|_| ())
    }

    async fn get_messages(
        &self,
        session_id: &str,
        participant: &str,
    ) -> Result<Vec<RelayMessage>, RelayError> {
        let request = self
            .http_client
            .get(self.url(&format!("/message/{}/{}", session_id, participant)));
        check_status(self.send(request).await?)
            .await?
            .json()
            .await
            .map_err(|e| RelayError::Decode(e.to_string()))
    }

    async fn delete_message(
        &self,
        session_id: &str,
        participant: &str,
        hash: &str,
    ) -> Result<(), RelayError> {
        let request = self.http_client.delete(self.url(&format!(
            "/message/{}/{}/{}",
            session_id, participant, hash
        )));
        let response = self.send(request).await?;
        // an already-empty inbox is not an error
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await.map(|_| ())
    }

    async fn mark_tss_started(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError> {
        let request = self
            .http_client
            .post(self.url(&format!("/start/{}", session_id)))
            .json(parties);
        check_status(self.send(request).await?).await.map(|_| ())
    }

    async fn get_tss_start(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError> {
        self.get_json_list(&format!("/start/{}", session_id)).await
    }

    async fn mark_tss_complete(&self, session_id: &str, parties: &[PartyId]) -> Result<(), RelayError> {
        let request = self
            .http_client
            .post(self.url(&format!("/complete/{}", session_id)))
            .json(parties);
        check_status(self.send(request).await?).await.map(|_| ())
    }

    async fn get_tss_complete(&self, session_id: &str) -> Result<Option<Vec<PartyId>>, RelayError> {
        self.get_json_list(&format!("/complete/{}", session_id)).await
    }

    async fn set_keysign_finished(
        &self,
        session_id: &str,
        message_id: &str,
        payload: &str,
    ) -> Result<(), RelayError> {
        let request = self
            .http_client
            .post(self.url(&format!("/complete/{}/keysign", session_id)))
            .header(MESSAGE_ID_HEADER, message_id)
            .json(payload);
        check_status(self.send(request).await?).await.map(|_| ())
    }

    async fn get_keysign_finished(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<Option<String>, RelayError> {
        self.get_record(&format!("/complete/{}/keysign", session_id), Some(message_id))
            .await
    }

    async fn upload_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
        payload: &str,
    ) -> Result<(), RelayError> {
        let mut request = self
            .http_client
            .post(self.url(&format!("/setup-message/{}", session_id)))
            .json(payload);
        if let Some(id) = message_id {
            request = request.header(MESSAGE_ID_HEADER, id);
        }
        check_status(self.send(request).await?).await.map(|_| ())
    }

    async fn get_setup_message(
        &self,
        session_id: &str,
        message_id: Option<&str>,
    ) -> Result<Option<String>, RelayError> {
        self.get_record(&format!("/setup-message/{}", session_id), message_id)
            .await
    }

    async fn store_payload(&self, hash: &str, payload: &[u8]) -> Result<(), RelayError> {
        let request = self
            .http_client
            .post(self.url(&format!("/payload/{}", hash)))
            .body(payload.to_vec());
        let response = self.send(request).await?;
        if response.status() == StatusCode::BAD_REQUEST {
            let actual = response
                .json::<ErrorResponse>()
                .await
                .ok()
                .and_then(|e| e.details)
                .unwrap_or_default();
            return Err(RelayError::HashMismatch {
                expected: hash.to_string(),
                actual,
            });
        }
        check_status(response).await.map(|_| ())
    }

    async fn get_payload(&self, hash: &str) -> Result<Option<Vec<u8>>, RelayError> {
        match self
            .get_optional(self.http_client.get(self.url(&format!("/payload/{}", hash))))
            .await?
        {
            Some(response) => response
                .bytes()
                .await
                .map(|b| Some(b.to_vec()))
                .map_err(|e| RelayError::Decode(e.to_string())),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalized() {
        let client = RelayClient::new("http://127.0.0.1:8080/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8080");
        assert_eq!(client.url("/ping"), "http://127.0.0.1:8080/ping");
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_retryable() {
        // nothing listens on port 9 of localhost in the test environment
        let client = RelayClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
