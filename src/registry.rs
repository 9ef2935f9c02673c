use std::sync::Arc;

use crate::store::ChatStore;
use crate::types::{ChangeEvent, ChatError, SessionSummary, NO_CONTACT_LABEL};

/// Agent-facing list of sessions handed over to a human, newest first.
///
/// `refresh` rebuilds the list from the store; `apply_event` folds live
/// metadata changes in between refreshes. A failed refresh keeps the previous
/// list on screen and records the error for a manual retry.
pub struct SessionRegistry {
    store: Arc<dyn ChatStore>,
    sessions: Vec<SessionSummary>,
    last_error: Option<String>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        SessionRegistry {
            store,
            sessions: Vec::new(),
            last_error: None,
        }
    }

    pub fn sessions(&self) -> &[SessionSummary] {
        &self.sessions
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub async fn refresh(&mut self) -> Result<(), ChatError> {
        match self.store.transferred_sessions().await {
            Ok(list) => {
                self.sessions = list;
                self.last_error = None;
                Ok(())
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(ChatError::Fetch(err))
            }
        }
    }

    /// Folds a metadata change into the list: known sessions update in place
    /// (never downgrading a known contact label), new transferred sessions
    /// are prepended. Non-transferred metadata is not the agent's business.
    pub fn apply_event(&mut self, event: &ChangeEvent) {
        let ChangeEvent::SessionUpserted(meta) = event else {
            return;
        };
        if !meta.transferred {
            return;
        }

        let contact = meta
            .contact_info
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        if let Some(existing) = self
            .sessions
            .iter_mut()
            .find(|s| s.session_id == meta.session_id)
        {
            existing.status = meta.status;
            if let Some(contact) = contact {
                existing.contact_label = contact.to_string();
            }
        } else {
            self.sessions.insert(
                0,
                SessionSummary {
                    session_id: meta.session_id.clone(),
                    contact_label: contact
                        .map(str::to_string)
                        .unwrap_or_else(|| NO_CONTACT_LABEL.to_string()),
                    status: meta.status,
                    created_at: meta.created_at.clone(),
                    last_message: None,
                },
            );
        }
    }
}
