use std::sync::Arc;

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::replies;
use crate::store::ChatStore;
use crate::thread::{end_session, MessageThread, ThreadNotice};
use crate::types::{
    now_iso, ChangeEvent, ChatError, ChatMessage, Sender, SessionMeta, SessionStatus,
};

const GREETING: &str =
    "Hello! Welcome to Corley Integrated Paralegal Services. How can I help you today?";
const CONTACT_PROMPT: &str =
    "Please share a phone number or email address so an agent can reach you:";
const CLOSING_MESSAGE: &str = "This conversation has ended. Thank you for contacting us.";

/// Per-browser conversation state. `Bot` answers from the canned rule table;
/// `AwaitingContact` means escalation was requested and the next visitor
/// message is taken as contact info; `Transferred` hands replies to a human;
/// `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WidgetPhase {
    Bot,
    AwaitingContact,
    Transferred,
    Ended,
}

/// The visitor's locally persisted state: the session token plus a cached
/// transcript. The client loads it before joining and saves what
/// [`VisitorWidget::context`] exposes after each exchange. The token is never
/// rotated here — a new conversation starts only if the client clears it.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: String,
    pub cached_messages: Vec<ChatMessage>,
}

impl SessionContext {
    pub fn fresh() -> Self {
        SessionContext {
            session_id: Uuid::new_v4().to_string(),
            cached_messages: Vec::new(),
        }
    }

    pub fn restore(session_id: String, cached_messages: Vec<ChatMessage>) -> Self {
        SessionContext {
            session_id,
            cached_messages,
        }
    }
}

pub struct VisitorWidget {
    store: Arc<dyn ChatStore>,
    thread: MessageThread,
    phase: WidgetPhase,
    ctx: SessionContext,
}

fn phase_from_meta(meta: Option<&SessionMeta>) -> WidgetPhase {
    match meta {
        None => WidgetPhase::Bot,
        Some(m) if m.status == SessionStatus::Completed => WidgetPhase::Ended,
        Some(m)
            if m.transferred
                && m.contact_info
                    .as_deref()
                    .is_some_and(|c| !c.trim().is_empty()) =>
        {
            WidgetPhase::Transferred
        }
        Some(m) if m.transferred => WidgetPhase::AwaitingContact,
        Some(_) => WidgetPhase::Bot,
    }
}

impl VisitorWidget {
    /// Opens (or resumes) the visitor conversation. The phase is re-derived
    /// from stored metadata; if the remote fetch fails or returns nothing,
    /// the cached transcript from `ctx` is restored, and a fresh greeting is
    /// emitted only when neither exists.
    pub async fn open(
        store: Arc<dyn ChatStore>,
        ctx: SessionContext,
    ) -> (Self, broadcast::Receiver<ChangeEvent>) {
        match MessageThread::open(store.clone(), &ctx.session_id).await {
            Ok((mut thread, receiver)) => {
                if thread.messages().is_empty() {
                    for message in ctx.cached_messages.clone() {
                        thread.merge(message);
                    }
                }
                let meta = store.session_meta(&ctx.session_id).await.ok().flatten();
                let phase = phase_from_meta(meta.as_ref());
                let mut widget = VisitorWidget {
                    store,
                    thread,
                    phase,
                    ctx,
                };
                if widget.thread.messages().is_empty() && widget.phase == WidgetPhase::Bot {
                    widget.greet().await;
                }
                widget.save();
                (widget, receiver)
            }
            Err(err) => {
                tracing::warn!(
                    session_id = %ctx.session_id,
                    error = %err,
                    "history fetch failed, restoring widget from local cache"
                );
                let receiver = store.subscribe();
                let thread = MessageThread::from_cache(
                    store.clone(),
                    &ctx.session_id,
                    ctx.cached_messages.clone(),
                );
                let mut widget = VisitorWidget {
                    store,
                    thread,
                    phase: WidgetPhase::Bot,
                    ctx,
                };
                if widget.thread.messages().is_empty() {
                    widget.greet().await;
                }
                (widget, receiver)
            }
        }
    }

    pub fn phase(&self) -> WidgetPhase {
        self.phase
    }

    pub fn session_id(&self) -> &str {
        &self.ctx.session_id
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.thread.messages()
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn take_notices(&mut self) -> Vec<ThreadNotice> {
        self.thread.take_notices()
    }

    /// One visitor turn: persist the message, then act on the current phase —
    /// capture contact info, or answer from the rule table. Transferred
    /// sessions get no bot reply; a human is on the other end.
    pub async fn handle_visitor_message(&mut self, text: &str) -> Result<(), ChatError> {
        if self.phase == WidgetPhase::Ended {
            return Err(ChatError::SessionClosed);
        }
        self.thread.send(Sender::User, text).await?;

        match self.phase {
            WidgetPhase::AwaitingContact => {
                self.capture_contact(text.trim()).await?;
            }
            WidgetPhase::Bot => {
                let reply = replies::match_reply(text);
                let suggestions = reply.suggestions.iter().map(|s| s.to_string()).collect();
                self.thread
                    .send_with_suggestions(Sender::Bot, reply.text, suggestions)
                    .await?;
            }
            WidgetPhase::Transferred | WidgetPhase::Ended => {}
        }
        self.save();
        Ok(())
    }

    /// Explicit "connect to live agent" action: marks the session
    /// transferred (pending until contact info arrives) and asks for a way
    /// to reach the visitor. A no-op when escalation already happened.
    pub async fn request_escalation(&mut self) -> Result<(), ChatError> {
        match self.phase {
            WidgetPhase::Ended => Err(ChatError::SessionClosed),
            WidgetPhase::AwaitingContact | WidgetPhase::Transferred => Ok(()),
            WidgetPhase::Bot => {
                let now = now_iso();
                self.store
                    .upsert_session_meta(&SessionMeta {
                        session_id: self.ctx.session_id.clone(),
                        contact_info: None,
                        status: SessionStatus::Pending,
                        transferred: true,
                        created_at: now.clone(),
                        updated_at: now,
                    })
                    .await
                    .map_err(ChatError::Send)?;
                self.phase = WidgetPhase::AwaitingContact;
                self.thread.send(Sender::Bot, CONTACT_PROMPT).await?;
                self.save();
                Ok(())
            }
        }
    }

    /// Visitor-initiated end: closing message first (the gate drops right
    /// after), then the terminal status. Idempotent. Clears the cached
    /// transcript but keeps the session token.
    pub async fn end(&mut self) -> Result<(), ChatError> {
        if self.phase == WidgetPhase::Ended {
            return Ok(());
        }
        let _ = self.thread.send(Sender::Bot, CLOSING_MESSAGE).await;
        end_session(self.store.as_ref(), &self.ctx.session_id).await?;
        self.phase = WidgetPhase::Ended;
        self.ctx.cached_messages.clear();
        Ok(())
    }

    /// Feeds one change-feed event through the thread; an agent-initiated
    /// completion moves the widget to `Ended`.
    pub fn apply_event(&mut self, event: &ChangeEvent) {
        self.thread.apply_event(event);
        if self.thread.status() == SessionStatus::Completed {
            self.phase = WidgetPhase::Ended;
        }
    }

    async fn capture_contact(&mut self, contact: &str) -> Result<(), ChatError> {
        // No validation by design: what counts as reachable contact info is
        // an open product decision.
        let now = now_iso();
        self.store
            .upsert_session_meta(&SessionMeta {
                session_id: self.ctx.session_id.clone(),
                contact_info: Some(contact.to_string()),
                status: SessionStatus::Active,
                transferred: true,
                created_at: now.clone(),
                updated_at: now,
            })
            .await
            .map_err(ChatError::Send)?;
        self.phase = WidgetPhase::Transferred;
        let confirmation = format!("Thank you! An agent will contact you at {contact} shortly.");
        self.thread.send(Sender::Bot, &confirmation).await?;
        Ok(())
    }

    async fn greet(&mut self) {
        if self.thread.send(Sender::Bot, GREETING).await.is_err() {
            // Store unreachable: show the greeting locally anyway.
            self.thread.merge(ChatMessage {
                id: format!("local-{}", Uuid::new_v4()),
                session_id: self.ctx.session_id.clone(),
                sender: Sender::Bot,
                text: GREETING.to_string(),
                suggestions: Vec::new(),
                created_at: now_iso(),
            });
            self.thread.take_notices();
        }
    }

    /// Save boundary: snapshot the transcript into the context the client
    /// persists locally.
    fn save(&mut self) {
        self.ctx.cached_messages = self.thread.messages().to_vec();
    }
}
