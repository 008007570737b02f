use relay_proto::{ChatMessage, NewMessage};
use reqwest::Client;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid message api url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("sending disabled: {0} is not a participant of this conversation")]
    SendDisabled(String),
    #[error("message must not be empty")]
    EmptyMessage,
    #[error("relay unavailable: {0}")]
    Relay(String),
}

/// Client for the message store: `GET /api/messages/{conversationId}` and
/// `POST /api/messages`.
#[derive(Clone)]
pub struct MessageApi {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl MessageApi {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, ChatError> {
        let base_url = Url::parse(base_url).map_err(|err| ChatError::InvalidUrl {
            url: base_url.to_string(),
            reason: err.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ChatError::InvalidUrl {
                url: base_url.to_string(),
                reason: "not a base url".into(),
            });
        }
        Ok(Self {
            http: Client::new(),
            base_url,
            token,
        })
    }

    /// Every stored message of `conversation_id`, oldest first.
    pub async fn history(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let url = self.endpoint(&["api", "messages", conversation_id])?;
        tracing::debug!(target = "chat", %url, "fetching history");
        let res = self.authorize(self.http.get(url)).send().await?;
        if res.status().is_success() {
            Ok(res.json::<Vec<ChatMessage>>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ChatError::UnexpectedStatus { status, body })
        }
    }

    /// Persists a message and returns it as stored.
    pub async fn post(&self, message: &NewMessage) -> Result<ChatMessage, ChatError> {
        let url = self.endpoint(&["api", "messages"])?;
        tracing::debug!(
            target = "chat",
            conversation = %message.conversation_id,
            "posting message"
        );
        let res = self
            .authorize(self.http.post(url))
            .json(message)
            .send()
            .await?;
        if res.status().is_success() {
            Ok(res.json::<ChatMessage>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ChatError::UnexpectedStatus { status, body })
        }
    }

    // Segments are percent-encoded, so an id can never add path components.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ChatError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ChatError::InvalidUrl {
                url: self.base_url.to_string(),
                reason: "not a base url".into(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_encodes_conversation_ids() {
        let api = MessageApi::new("http://localhost:5000/", None).unwrap();
        let url = api.endpoint(&["api", "messages", "shelf/7?|u1:u2"]).unwrap();
        assert_eq!(url.path(), "/api/messages/shelf%2F7%3F|u1:u2");
    }

    #[test]
    fn endpoint_keeps_base_path() {
        let api = MessageApi::new("https://example.com/backend", None).unwrap();
        let url = api.endpoint(&["api", "messages"]).unwrap();
        assert_eq!(url.as_str(), "https://example.com/backend/api/messages");
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(matches!(
            MessageApi::new("mailto:someone@example.com", None),
            Err(ChatError::InvalidUrl { .. })
        ));
        assert!(MessageApi::new("not a url", None).is_err());
    }
}
