use crate::ConversationId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every counterpart the local user has talked to about each resource.
///
/// Entries are ordered by recency, most recent last, and hold each
/// counterpart once. A seller with several interested buyers keeps all of
/// them; `latest` gives the single "last counterpart" view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CounterpartBook {
    by_resource: BTreeMap<String, Vec<String>>,
}

impl CounterpartBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the counterpart of `me` in `conversation`. Returns `false`
    /// when the conversation has no resource scope or `me` is not in it.
    pub fn record(&mut self, conversation: &ConversationId, me: &str) -> bool {
        let Some(resource) = conversation.resource() else {
            return false;
        };
        let Some(counterpart) = conversation.counterpart(me) else {
            return false;
        };
        self.remember(resource, counterpart);
        true
    }

    pub fn remember(&mut self, resource: &str, counterpart: &str) {
        let entries = self.by_resource.entry(resource.to_string()).or_default();
        entries.retain(|existing| existing != counterpart);
        entries.push(counterpart.to_string());
    }

    pub fn latest(&self, resource: &str) -> Option<&str> {
        self.by_resource
            .get(resource)
            .and_then(|entries| entries.last())
            .map(String::as_str)
    }

    pub fn all(&self, resource: &str) -> &[String] {
        self.by_resource
            .get(resource)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn forget(&mut self, resource: &str) -> bool {
        self.by_resource.remove(resource).is_some()
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.by_resource.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_resource.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seller_keeps_every_buyer_most_recent_last() {
        let mut book = CounterpartBook::new();
        let seller = "seller";
        assert!(book.record(&ConversationId::for_resource("book-1", seller, "buyer-a"), seller));
        assert!(book.record(&ConversationId::for_resource("book-1", "buyer-b", seller), seller));
        assert!(book.record(&ConversationId::for_resource("book-1", seller, "buyer-a"), seller));

        assert_eq!(book.all("book-1"), ["buyer-b".to_string(), "buyer-a".to_string()]);
        assert_eq!(book.latest("book-1"), Some("buyer-a"));
    }

    #[test]
    fn unscoped_or_foreign_conversations_are_not_recorded() {
        let mut book = CounterpartBook::new();
        assert!(!book.record(&ConversationId::between("a", "b"), "a"));
        assert!(!book.record(&ConversationId::for_resource("r", "a", "b"), "c"));
        assert!(book.is_empty());
        assert!(book.all("r").is_empty());
        assert_eq!(book.latest("r"), None);
    }

    #[test]
    fn forget_drops_a_resource() {
        let mut book = CounterpartBook::new();
        book.remember("r1", "x");
        book.remember("r2", "y");
        assert!(book.forget("r1"));
        assert!(!book.forget("r1"));
        assert_eq!(book.resources().collect::<Vec<_>>(), ["r2"]);
    }
}
