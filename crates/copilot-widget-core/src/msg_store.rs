//! Append-only transcript store.

use std::collections::HashMap;

use crate::{
    error::StoreError,
    message::{Content, Message, MessageId, MessageStatus, TurnFailure},
};

/// Ordered, append-only log of messages.
///
/// Insertion order is transcript order. Nothing is ever removed; a message
/// that should disappear is marked `Failed` instead.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its id.
    ///
    /// The returned id is authoritative: a message whose id is already in
    /// the store is stored under a fresh one.
    pub fn append(&mut self, mut message: Message) -> MessageId {
        while self.index.contains_key(&message.id) {
            tracing::debug!(id = %message.id, "Duplicate message id, assigning a new one");
            message.id = MessageId::new();
        }
        let id = message.id;
        self.index.insert(id, self.messages.len());
        self.messages.push(message);
        id
    }

    /// Move a message to `status`.
    ///
    /// # Errors
    /// `NotFound` if `id` is absent, `InvalidTransition` if `status` is not
    /// reachable from the current status.
    pub fn update_status(&mut self, id: MessageId, status: MessageStatus) -> Result<(), StoreError> {
        self.transition(id, status, None, None)
    }

    /// Deliver a pending message with its final content.
    ///
    /// # Errors
    /// Same as [`Self::update_status`].
    pub fn deliver(&mut self, id: MessageId, content: Content) -> Result<(), StoreError> {
        self.transition(id, MessageStatus::Delivered, Some(content), None)
    }

    /// Fail a pending message, recording why.
    ///
    /// # Errors
    /// Same as [`Self::update_status`].
    pub fn fail(&mut self, id: MessageId, failure: TurnFailure) -> Result<(), StoreError> {
        self.transition(id, MessageStatus::Failed, None, Some(failure))
    }

    fn transition(
        &mut self,
        id: MessageId,
        status: MessageStatus,
        content: Option<Content>,
        failure: Option<TurnFailure>,
    ) -> Result<(), StoreError> {
        let pos = *self.index.get(&id).ok_or(StoreError::NotFound(id))?;
        let message = &mut self.messages[pos];

        if !message.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                id,
                from: message.status,
                to: status,
            });
        }

        message.status = status;
        if let Some(content) = content {
            message.content = content;
        }
        message.failure = failure;
        Ok(())
    }

    /// Look up a message by id.
    #[must_use]
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.index.get(&id).map(|&pos| &self.messages[pos])
    }

    /// Copy of the transcript. Later writes never show up in it.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Borrow the transcript in order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_preserves_order() {
        let mut store = MessageStore::new();
        let a = store.append(Message::user("one"));
        let b = store.append(Message::pending_bot());
        let c = store.append(Message::user("two"));

        let ids: Vec<_> = store.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_append_rekeys_duplicate_ids() {
        let mut store = MessageStore::new();
        let pending = Message::pending_bot();
        let first = store.append(pending.clone());
        let second = store.append(pending);

        assert_ne!(first, second);
        assert_eq!(store.len(), 2);
        store.deliver(first, Content::text("first")).unwrap();
        assert_eq!(store.get(first).unwrap().content.as_text(), Some("first"));
        assert_eq!(store.get(second).unwrap().status, MessageStatus::Pending);
        assert_eq!(store.snapshot()[1].id, second);
    }

    #[test]
    fn test_update_status_not_found() {
        let mut store = MessageStore::new();
        let missing = MessageId::new();
        assert_eq!(
            store.update_status(missing, MessageStatus::Delivered),
            Err(StoreError::NotFound(missing))
        );
    }

    #[test]
    fn test_update_status_rejects_final_messages() {
        let mut store = MessageStore::new();
        let id = store.append(Message::user("hi"));

        let err = store.update_status(id, MessageStatus::Failed).unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                id,
                from: MessageStatus::Delivered,
                to: MessageStatus::Failed,
            }
        );
        assert_eq!(store.get(id).unwrap().status, MessageStatus::Delivered);
    }

    #[test]
    fn test_pending_moves_once() {
        let mut store = MessageStore::new();
        let id = store.append(Message::pending_bot());

        store.deliver(id, Content::text("Hi there")).unwrap();
        assert!(store.fail(id, TurnFailure::Timeout).is_err());

        let msg = store.get(id).unwrap();
        assert_eq!(msg.status, MessageStatus::Delivered);
        assert_eq!(msg.content.as_text(), Some("Hi there"));
        assert!(msg.failure.is_none());
    }

    #[test]
    fn test_fail_records_reason() {
        let mut store = MessageStore::new();
        let id = store.append(Message::pending_bot());

        store.fail(id, TurnFailure::Timeout).unwrap();
        let msg = store.get(id).unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.failure, Some(TurnFailure::Timeout));
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut store = MessageStore::new();
        let id = store.append(Message::pending_bot());
        let before = store.snapshot();

        store.deliver(id, Content::text("done")).unwrap();
        store.append(Message::user("more"));

        assert_eq!(before.len(), 1);
        assert_eq!(before[0].status, MessageStatus::Pending);
        assert!(before[0].content.is_empty());
    }
}
