use super::api::{ChatError, MessageApi};
use crate::call::relay::RelayLink;
use conversation_id::{ConversationId, CounterpartBook, canonicalize};
use relay_proto::{ChatMessage, ClientEvent, NewMessage, RelayEvent};
use std::sync::Arc;

/// One conversation as seen by the signed-in user.
pub struct ConversationRoom {
    id: String,
    parsed: Option<ConversationId>,
    user_id: String,
    user_name: String,
    relay: Arc<dyn RelayLink>,
    api: MessageApi,
}

impl ConversationRoom {
    /// Opens the room for `raw_id` and records its counterpart in `book`.
    /// A malformed id is kept verbatim; such a room can read but not send.
    pub fn open(
        raw_id: &str,
        user_id: &str,
        user_name: &str,
        relay: Arc<dyn RelayLink>,
        api: MessageApi,
        book: &mut CounterpartBook,
    ) -> Self {
        let parsed = ConversationId::parse(raw_id).ok();
        let id = parsed
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| canonicalize(raw_id));
        if parsed
            .as_ref()
            .is_some_and(|conversation| book.record(conversation, user_id))
        {
            tracing::debug!(target = "chat", conversation = %id, "counterpart recorded");
        }
        Self {
            id,
            parsed,
            user_id: user_id.to_string(),
            user_name: user_name.to_string(),
            relay,
            api,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The participant who receives messages sent from here, if any.
    pub fn recipient(&self) -> Option<&str> {
        self.parsed
            .as_ref()
            .and_then(|conversation| conversation.counterpart(&self.user_id))
    }

    pub fn can_send(&self) -> bool {
        self.recipient().is_some()
    }

    /// Subscribes this socket to the room's broadcasts.
    pub fn join(&self) -> Result<(), ChatError> {
        self.relay
            .send(ClientEvent::ChatJoin {
                conversation_id: self.id.clone(),
            })
            .map_err(|err| ChatError::Relay(err.to_string()))
    }

    pub async fn history(&self) -> Result<Vec<ChatMessage>, ChatError> {
        self.api.history(&self.id).await
    }

    /// Stores `text` through the message API, then broadcasts the stored
    /// message to the room.
    pub async fn send(&self, text: &str) -> Result<ChatMessage, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let recipient = self
            .recipient()
            .ok_or_else(|| ChatError::SendDisabled(self.user_id.clone()))?;
        let stored = self
            .api
            .post(&NewMessage {
                conversation_id: self.id.clone(),
                sender_id: self.user_id.clone(),
                sender_name: self.user_name.clone(),
                recipient_id: recipient.to_string(),
                text: text.to_string(),
            })
            .await?;
        if let Err(err) = self.relay.send(ClientEvent::ChatBroadcast(stored.clone())) {
            // Already persisted; the other side sees it on its next history load.
            tracing::warn!(target = "chat", conversation = %self.id, error = %err, "broadcast failed");
        }
        Ok(stored)
    }

    /// Returns the message carried by `event` when it belongs to this room.
    pub fn accept(&self, event: &RelayEvent) -> Option<ChatMessage> {
        match event {
            RelayEvent::ChatBroadcast(message) if canonicalize(&message.conversation_id) == self.id => {
                Some(message.clone())
            }
            _ => None,
        }
    }
}
