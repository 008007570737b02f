//! Canonical identifiers for two-party conversations.
//!
//! A conversation between two users, optionally scoped to a resource such
//! as a book listing, is keyed by `[<resource>|]<idA>:<idB>` with the two
//! participant ids in ascending UTF-16 code unit order. Both participants and the message
//! backend derive the same key regardless of who opened the thread.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod counterparts;

pub use counterparts::CounterpartBook;

pub const RESOURCE_SEPARATOR: char = '|';
pub const PARTICIPANT_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationIdError {
    #[error("conversation id {0:?} has no participant separator")]
    MissingSeparator(String),
    #[error("conversation id {0:?} has an empty participant id")]
    EmptyParticipant(String),
}

/// A conversation key in canonical participant order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId {
    resource: Option<String>,
    first: String,
    second: String,
    trailing: Vec<String>,
}

impl ConversationId {
    /// Parses `raw` and puts the participant pair in canonical order.
    pub fn parse(raw: &str) -> Result<Self, ConversationIdError> {
        let (resource, pair) = match raw.split_once(RESOURCE_SEPARATOR) {
            Some((resource, pair)) => (Some(resource.to_string()), pair),
            None => (None, raw),
        };

        let mut segments = pair.split(PARTICIPANT_SEPARATOR);
        let a = segments.next().unwrap_or_default();
        let b = segments
            .next()
            .ok_or_else(|| ConversationIdError::MissingSeparator(raw.to_string()))?;
        if a.is_empty() || b.is_empty() {
            return Err(ConversationIdError::EmptyParticipant(raw.to_string()));
        }
        let trailing = segments.map(str::to_string).collect();

        let (first, second) = ordered(a, b);
        Ok(Self {
            resource,
            first: first.to_string(),
            second: second.to_string(),
            trailing,
        })
    }

    /// Conversation between two users with no resource scope.
    pub fn between(a: &str, b: &str) -> Self {
        let (first, second) = ordered(a, b);
        Self {
            resource: None,
            first: first.to_string(),
            second: second.to_string(),
            trailing: Vec::new(),
        }
    }

    /// Conversation between two users about `resource`.
    pub fn for_resource(resource: &str, a: &str, b: &str) -> Self {
        Self {
            resource: Some(resource.to_string()),
            ..Self::between(a, b)
        }
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }

    pub fn trailing(&self) -> &[String] {
        &self.trailing
    }

    /// The participant that is not `me`, or `None` when `me` is not part of
    /// this conversation. A conversation with oneself resolves to oneself.
    pub fn counterpart(&self, me: &str) -> Option<&str> {
        if self.first == me {
            Some(&self.second)
        } else if self.second == me {
            Some(&self.first)
        } else {
            None
        }
    }
}

/// Orders by UTF-16 code units, which is how the web clients and the
/// message backend sort the same ids.
fn ordered<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a.encode_utf16().cmp(b.encode_utf16()).is_le() {
        (a, b)
    } else {
        (b, a)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(resource) = &self.resource {
            write!(f, "{resource}{RESOURCE_SEPARATOR}")?;
        }
        write!(f, "{}{PARTICIPANT_SEPARATOR}{}", self.first, self.second)?;
        for segment in &self.trailing {
            write!(f, "{PARTICIPANT_SEPARATOR}{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for ConversationId {
    type Err = ConversationIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = ConversationIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.to_string()
    }
}

/// Canonical form of `raw`. Input that is not a two-party id is returned
/// unchanged.
pub fn canonicalize(raw: &str) -> String {
    match ConversationId::parse(raw) {
        Ok(id) => id.to_string(),
        Err(err) => {
            tracing::warn!(
                target = "conversation",
                input = %raw,
                error = %err,
                "passing through non-canonical conversation id"
            );
            raw.to_string()
        }
    }
}

/// Recipient of a message sent by `me` into conversation `raw`.
pub fn resolve_recipient(raw: &str, me: &str) -> Option<String> {
    let id = match ConversationId::parse(raw) {
        Ok(id) => id,
        Err(err) => {
            tracing::warn!(
                target = "conversation",
                input = %raw,
                error = %err,
                "cannot resolve recipient"
            );
            return None;
        }
    };
    id.counterpart(me).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn participant_order_does_not_matter() {
        assert_eq!(canonicalize("alice:bob"), canonicalize("bob:alice"));
        assert_eq!(canonicalize("bob:alice"), "alice:bob");
    }

    #[test]
    fn resource_prefix_is_kept() {
        assert_eq!(canonicalize("bookX|u2:u1"), "bookX|u1:u2");
        let id = ConversationId::parse("bookX|u2:u1").unwrap();
        assert_eq!(id.resource(), Some("bookX"));
        assert_eq!(id.participants(), ("u1", "u2"));
    }

    #[test]
    fn canonicalizing_twice_is_a_no_op() {
        for raw in ["zed:amy", "b-17|u9:u10", "x:w:extra:more", "same:same"] {
            let once = canonicalize(raw);
            assert_eq!(canonicalize(&once), once, "input {raw}");
        }
    }

    #[test]
    fn trailing_segments_follow_the_sorted_pair() {
        assert_eq!(canonicalize("r|z:a:thread:2"), "r|a:z:thread:2");
        let id = ConversationId::parse("z:a:thread").unwrap();
        assert_eq!(id.trailing(), ["thread".to_string()]);
    }

    #[test]
    fn order_follows_utf16_code_units() {
        // The high surrogate 0xD83D sorts below 0xFF5E, unlike the UTF-8 bytes.
        assert_eq!(canonicalize("\u{FF5E}:\u{1F600}"), "\u{1F600}:\u{FF5E}");
        assert_eq!(canonicalize("\u{1F600}:\u{FF5E}"), "\u{1F600}:\u{FF5E}");
        assert_eq!(canonicalize("u2:u10"), "u10:u2");
    }

    #[test]
    fn input_without_colon_passes_through() {
        assert_eq!(canonicalize("demo-convo"), "demo-convo");
        assert_eq!(canonicalize("book-1|demo"), "book-1|demo");
        assert_eq!(
            ConversationId::parse("demo-convo"),
            Err(ConversationIdError::MissingSeparator("demo-convo".into()))
        );
    }

    #[test]
    fn empty_participant_passes_through() {
        assert_eq!(canonicalize("alice:"), "alice:");
        assert!(matches!(
            ConversationId::parse(":bob"),
            Err(ConversationIdError::EmptyParticipant(_))
        ));
    }

    #[test]
    fn recipient_is_the_other_participant() {
        assert_eq!(resolve_recipient("alice:bob", "alice").as_deref(), Some("bob"));
        assert_eq!(resolve_recipient("alice:bob", "bob").as_deref(), Some("alice"));
        assert_eq!(resolve_recipient("book|bob:alice", "bob").as_deref(), Some("alice"));
    }

    #[test]
    fn recipient_is_none_for_outsiders_and_malformed_ids() {
        assert_eq!(resolve_recipient("alice:bob", "carol"), None);
        assert_eq!(resolve_recipient("demo-convo", "alice"), None);
    }

    #[test]
    fn constructors_agree_with_parse() {
        assert_eq!(
            ConversationId::between("bob", "alice"),
            ConversationId::parse("alice:bob").unwrap()
        );
        assert_eq!(
            ConversationId::for_resource("b1", "u2", "u1").to_string(),
            "b1|u1:u2"
        );
    }

    #[test]
    fn serializes_as_canonical_string() {
        let id: ConversationId = serde_json::from_str("\"b|y:x\"").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"b|x:y\"");
        assert!(serde_json::from_str::<ConversationId>("\"nope\"").is_err());
    }
}
