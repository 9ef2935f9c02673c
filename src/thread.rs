use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::store::ChatStore;
use crate::types::{
    now_iso, ChangeEvent, ChatError, ChatMessage, NewMessage, Sender, SessionStatus,
    DEFAULT_SESSION_STATUS,
};

/// Something the hosting view should surface to the person in front of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadNotice {
    SendFailed,
    ConversationEnded,
}

/// Ordered live view of one session's messages.
///
/// Opening a thread subscribes to the change feed *before* the history fetch,
/// so a message inserted between the two cannot be missed; anything that
/// arrives twice is absorbed by the dedup merge in [`MessageThread::apply_event`].
pub struct MessageThread {
    store: Arc<dyn ChatStore>,
    session_id: String,
    messages: Vec<ChatMessage>,
    status: SessionStatus,
    contact_info: Option<String>,
    notices: Vec<ThreadNotice>,
}

impl MessageThread {
    pub async fn open(
        store: Arc<dyn ChatStore>,
        session_id: &str,
    ) -> Result<(Self, broadcast::Receiver<ChangeEvent>), ChatError> {
        let receiver = store.subscribe();
        let history = store
            .messages_for_session(session_id)
            .await
            .map_err(ChatError::Fetch)?;
        let meta = store
            .session_meta(session_id)
            .await
            .map_err(ChatError::Fetch)?;

        let mut thread = MessageThread {
            store,
            session_id: session_id.to_string(),
            messages: Vec::new(),
            status: meta
                .as_ref()
                .map(|m| m.status)
                .unwrap_or(DEFAULT_SESSION_STATUS),
            contact_info: meta.and_then(|m| m.contact_info),
            notices: Vec::new(),
        };
        for message in history {
            thread.merge(message);
        }
        Ok((thread, receiver))
    }

    /// Builds a thread from a locally cached transcript without touching the
    /// store, for when the remote fetch is unavailable.
    pub fn from_cache(
        store: Arc<dyn ChatStore>,
        session_id: &str,
        cached: Vec<ChatMessage>,
    ) -> Self {
        let mut thread = MessageThread {
            store,
            session_id: session_id.to_string(),
            messages: Vec::new(),
            status: DEFAULT_SESSION_STATUS,
            contact_info: None,
            notices: Vec::new(),
        };
        for message in cached {
            thread.merge(message);
        }
        thread
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn contact_info(&self) -> Option<&str> {
        self.contact_info.as_deref()
    }

    pub fn take_notices(&mut self) -> Vec<ThreadNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Re-inserts a cached message, skipping anything already known.
    pub fn merge(&mut self, message: ChatMessage) {
        if !self.is_known(&message) {
            self.insert_ordered(message);
        }
    }

    /// Applies one change-feed event. Duplicate message notifications (the
    /// echo of our own optimistic insert included) are dropped silently.
    pub fn apply_event(&mut self, event: &ChangeEvent) {
        match event {
            ChangeEvent::MessageInserted(message) if message.session_id == self.session_id => {
                self.merge(message.clone());
            }
            ChangeEvent::SessionUpserted(meta) if meta.session_id == self.session_id => {
                if meta.contact_info.is_some() {
                    self.contact_info = meta.contact_info.clone();
                }
                if meta.status == SessionStatus::Completed {
                    if self.status != SessionStatus::Completed {
                        self.status = SessionStatus::Completed;
                        self.notices.push(ThreadNotice::ConversationEnded);
                    }
                } else if self.status != SessionStatus::Completed {
                    // Completed is terminal; other statuses track the feed.
                    self.status = meta.status;
                }
            }
            _ => {}
        }
    }

    /// Refetches history and dedup-merges it; the manual retry affordance
    /// after a failed load.
    pub async fn resync(&mut self) -> Result<(), ChatError> {
        let history = self
            .store
            .messages_for_session(&self.session_id)
            .await
            .map_err(ChatError::Fetch)?;
        for message in history {
            self.merge(message);
        }
        Ok(())
    }

    pub async fn send(&mut self, sender: Sender, text: &str) -> Result<ChatMessage, ChatError> {
        self.send_with_suggestions(sender, text, Vec::new()).await
    }

    /// Optimistic send: the message is appended locally under a temporary id
    /// before the insert, reconciled to the store-assigned id on success, and
    /// rolled back (with a single `SendFailed` notice) on failure.
    pub async fn send_with_suggestions(
        &mut self,
        sender: Sender,
        text: &str,
        suggestions: Vec<String>,
    ) -> Result<ChatMessage, ChatError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if self.status == SessionStatus::Completed {
            return Err(ChatError::SessionClosed);
        }

        let draft = NewMessage {
            session_id: self.session_id.clone(),
            sender,
            text: trimmed.to_string(),
            suggestions,
            created_at: now_iso(),
        };
        let temp_id = format!("tmp-{}", Uuid::new_v4());
        self.insert_ordered(ChatMessage {
            id: temp_id.clone(),
            session_id: draft.session_id.clone(),
            sender: draft.sender,
            text: draft.text.clone(),
            suggestions: draft.suggestions.clone(),
            created_at: draft.created_at.clone(),
        });

        match self.store.insert_message(&draft).await {
            Ok(persisted) => {
                if let Some(entry) = self.messages.iter_mut().find(|m| m.id == temp_id) {
                    entry.id = persisted.id.clone();
                }
                Ok(persisted)
            }
            Err(err) => {
                self.messages.retain(|m| m.id != temp_id);
                self.notices.push(ThreadNotice::SendFailed);
                Err(ChatError::Send(err))
            }
        }
    }

    fn is_known(&self, message: &ChatMessage) -> bool {
        self.messages.iter().any(|m| m.same_message(message))
    }

    /// Keeps the list sorted by timestamp; ties land after existing equals,
    /// preserving arrival order.
    fn insert_ordered(&mut self, message: ChatMessage) {
        let at = self
            .messages
            .partition_point(|m| m.created_at.as_str() <= message.created_at.as_str());
        self.messages.insert(at, message);
    }
}

/// Session Status Gate: marks a session completed. Idempotent — ending an
/// already-completed session changes nothing and is not an error. A real
/// change is broadcast by the store so every subscriber freezes at once.
pub async fn end_session(store: &dyn ChatStore, session_id: &str) -> Result<bool, ChatError> {
    store
        .set_session_status(session_id, SessionStatus::Completed)
        .await
        .map_err(ChatError::Send)
}

/// Stateless send path for server handlers that hold no local message list.
/// Same gating as [`MessageThread::send`], checked against stored metadata
/// before any insert.
pub async fn send_checked(
    store: &dyn ChatStore,
    session_id: &str,
    sender: Sender,
    text: &str,
) -> Result<ChatMessage, ChatError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    let status = store
        .session_meta(session_id)
        .await
        .map_err(ChatError::Fetch)?
        .map(|m| m.status)
        .unwrap_or(DEFAULT_SESSION_STATUS);
    if status == SessionStatus::Completed {
        return Err(ChatError::SessionClosed);
    }
    store
        .insert_message(&NewMessage {
            session_id: session_id.to_string(),
            sender,
            text: trimmed.to_string(),
            suggestions: Vec::new(),
            created_at: now_iso(),
        })
        .await
        .map_err(ChatError::Send)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{SessionMeta, SessionStatus};

    fn message(session_id: &str, sender: Sender, text: &str, created_at: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            sender,
            text: text.to_string(),
            suggestions: vec![],
            created_at: created_at.to_string(),
        }
    }

    async fn open(store: &Arc<MemoryStore>, session_id: &str) -> MessageThread {
        let store: Arc<dyn ChatStore> = store.clone();
        MessageThread::open(store, session_id).await.unwrap().0
    }

    #[tokio::test]
    async fn notifications_arriving_out_of_order_stay_sorted() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;

        let m2 = message("s1", Sender::Agent, "second", "2026-08-29T10:00:02+00:00");
        let m1 = message("s1", Sender::User, "first", "2026-08-29T10:00:01+00:00");
        let m3 = message("s1", Sender::User, "third", "2026-08-29T10:00:03+00:00");
        thread.apply_event(&ChangeEvent::MessageInserted(m2));
        thread.apply_event(&ChangeEvent::MessageInserted(m3));
        thread.apply_event(&ChangeEvent::MessageInserted(m1));

        let texts: Vec<&str> = thread.messages().iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn duplicate_notification_does_not_grow_the_thread() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;

        let m = message("s1", Sender::User, "Hello", "2026-08-29T10:00:00+00:00");
        thread.apply_event(&ChangeEvent::MessageInserted(m.clone()));
        thread.apply_event(&ChangeEvent::MessageInserted(m));
        assert_eq!(thread.messages().len(), 1);
    }

    #[tokio::test]
    async fn sender_is_part_of_the_dedup_key() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;

        let bot = message("s1", Sender::Bot, "Hello", "2026-08-29T10:00:00+00:00");
        let agent = message("s1", Sender::Agent, "Hello", "2026-08-29T10:00:00+00:00");
        thread.apply_event(&ChangeEvent::MessageInserted(bot));
        thread.apply_event(&ChangeEvent::MessageInserted(agent));
        assert_eq!(thread.messages().len(), 2);
    }

    #[tokio::test]
    async fn own_echo_is_not_appended_twice() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;

        let sent = thread.send(Sender::User, "hi there").await.unwrap();
        // The change feed echoes the insert back to its sender.
        thread.apply_event(&ChangeEvent::MessageInserted(sent));
        assert_eq!(thread.messages().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_rolls_back_and_raises_one_notice() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;

        store.set_fail_inserts(true);
        let err = thread.send(Sender::User, "will not make it").await;
        assert!(matches!(err, Err(ChatError::Send(_))));
        assert!(thread.messages().is_empty());
        assert_eq!(thread.take_notices(), vec![ThreadNotice::SendFailed]);
        assert_eq!(store.message_count("s1"), 0);
    }

    #[tokio::test]
    async fn send_is_rejected_after_completion_without_touching_the_store() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;
        thread.send(Sender::User, "hello").await.unwrap();

        end_session(store.as_ref(), "s1").await.unwrap();
        thread.apply_event(&ChangeEvent::SessionUpserted(SessionMeta {
            session_id: "s1".into(),
            contact_info: None,
            status: SessionStatus::Completed,
            transferred: false,
            created_at: now_iso(),
            updated_at: now_iso(),
        }));

        let before = store.message_count("s1");
        let err = thread.send(Sender::User, "too late").await;
        assert!(matches!(err, Err(ChatError::SessionClosed)));
        assert_eq!(store.message_count("s1"), before);
    }

    #[tokio::test]
    async fn completion_notice_is_raised_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;

        let completed = SessionMeta {
            session_id: "s1".into(),
            contact_info: None,
            status: SessionStatus::Completed,
            transferred: true,
            created_at: now_iso(),
            updated_at: now_iso(),
        };
        thread.apply_event(&ChangeEvent::SessionUpserted(completed.clone()));
        thread.apply_event(&ChangeEvent::SessionUpserted(completed));
        assert_eq!(thread.take_notices(), vec![ThreadNotice::ConversationEnded]);
        assert_eq!(thread.status(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn completed_status_does_not_reopen_from_a_stale_event() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;

        let mut meta = SessionMeta {
            session_id: "s1".into(),
            contact_info: None,
            status: SessionStatus::Completed,
            transferred: true,
            created_at: now_iso(),
            updated_at: now_iso(),
        };
        thread.apply_event(&ChangeEvent::SessionUpserted(meta.clone()));
        meta.status = SessionStatus::Active;
        thread.apply_event(&ChangeEvent::SessionUpserted(meta));
        assert_eq!(thread.status(), SessionStatus::Completed);
    }

    #[tokio::test]
    async fn missing_metadata_defaults_to_active() {
        let store = Arc::new(MemoryStore::new());
        let thread = open(&store, "never-escalated").await;
        assert_eq!(thread.status(), SessionStatus::Active);
    }

    #[tokio::test]
    async fn ending_twice_changes_state_once() {
        let store = Arc::new(MemoryStore::new());
        assert!(end_session(store.as_ref(), "s1").await.unwrap());
        assert!(!end_session(store.as_ref(), "s1").await.unwrap());
    }

    #[tokio::test]
    async fn resync_merges_without_duplicating() {
        let store = Arc::new(MemoryStore::new());
        let mut thread = open(&store, "s1").await;
        thread.send(Sender::User, "one").await.unwrap();

        // A second actor writes directly to the store.
        store
            .insert_message(&NewMessage {
                session_id: "s1".into(),
                sender: Sender::Agent,
                text: "two".into(),
                suggestions: vec![],
                created_at: now_iso(),
            })
            .await
            .unwrap();

        thread.resync().await.unwrap();
        thread.resync().await.unwrap();
        assert_eq!(thread.messages().len(), 2);
    }

    #[tokio::test]
    async fn send_checked_gates_on_stored_status() {
        let store = Arc::new(MemoryStore::new());
        send_checked(store.as_ref(), "s1", Sender::Agent, "hello")
            .await
            .unwrap();
        end_session(store.as_ref(), "s1").await.unwrap();
        let err = send_checked(store.as_ref(), "s1", Sender::Agent, "late").await;
        assert!(matches!(err, Err(ChatError::SessionClosed)));
        assert_eq!(store.message_count("s1"), 1);
    }
}
