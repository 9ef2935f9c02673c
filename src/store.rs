use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{
    now_iso, ChangeEvent, ChatMessage, FormSubmission, NewFormSubmission, NewMessage, NewVisit,
    Sender, SessionMeta, SessionStatus, SessionSummary, StoreError, DEFAULT_SESSION_STATUS,
    NO_CONTACT_LABEL,
};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Capability interface over the relational store and its change feed. The
/// rest of the crate only talks to this trait; the server wires in Postgres,
/// the tests wire in [`MemoryStore`].
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Persists a message, assigning its permanent id, and publishes the
    /// insert to the change feed.
    async fn insert_message(&self, draft: &NewMessage) -> Result<ChatMessage, StoreError>;

    /// All messages of a session, ordered by timestamp ascending.
    async fn messages_for_session(&self, session_id: &str)
        -> Result<Vec<ChatMessage>, StoreError>;

    async fn session_meta(&self, session_id: &str) -> Result<Option<SessionMeta>, StoreError>;

    /// Insert-or-update session metadata. `transferred` only ever moves to
    /// true, a known contact is never overwritten by an empty one, and a
    /// `completed` status is terminal.
    async fn upsert_session_meta(&self, meta: &SessionMeta) -> Result<SessionMeta, StoreError>;

    /// Idempotent status change; returns whether anything changed. Creates
    /// the metadata row when the session only exists as messages.
    async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<bool, StoreError>;

    /// Sessions with `transferred = true`, newest first, each joined with its
    /// most recent message.
    async fn transferred_sessions(&self) -> Result<Vec<SessionSummary>, StoreError>;

    async fn insert_form_submission(
        &self,
        draft: &NewFormSubmission,
    ) -> Result<FormSubmission, StoreError>;

    async fn list_form_submissions(&self) -> Result<Vec<FormSubmission>, StoreError>;

    async fn record_visit(&self, visit: &NewVisit) -> Result<(), StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

pub fn contact_label(contact_info: Option<&str>, last_message: Option<&ChatMessage>) -> String {
    if let Some(info) = contact_info {
        if !info.trim().is_empty() {
            return info.to_string();
        }
    }
    if let Some(message) = last_message {
        return message.text.clone();
    }
    NO_CONTACT_LABEL.to_string()
}

pub struct PgStore {
    pool: PgPool,
    events: broadcast::Sender<ChangeEvent>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        let (events, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(PgStore { pool, events })
    }

    fn publish(&self, event: ChangeEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

fn parse_message_row(row: PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        sender: Sender::parse(&row.get::<String, _>("sender")).unwrap_or(Sender::User),
        text: row.get("text"),
        suggestions: serde_json::from_str::<Vec<String>>(&row.get::<String, _>("suggestions"))
            .unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

fn parse_session_row(row: PgRow) -> SessionMeta {
    SessionMeta {
        session_id: row.get("session_id"),
        contact_info: row.get::<Option<String>, _>("contact_info"),
        status: SessionStatus::parse(&row.get::<String, _>("status"))
            .unwrap_or(DEFAULT_SESSION_STATUS),
        transferred: row.get("transferred"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[async_trait]
impl ChatStore for PgStore {
    async fn insert_message(&self, draft: &NewMessage) -> Result<ChatMessage, StoreError> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            session_id: draft.session_id.clone(),
            sender: draft.sender,
            text: draft.text.clone(),
            suggestions: draft.suggestions.clone(),
            created_at: draft.created_at.clone(),
        };
        let suggestions =
            serde_json::to_string(&message.suggestions).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO chat_messages (id, session_id, sender, text, suggestions, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&message.id)
        .bind(&message.session_id)
        .bind(message.sender.as_str())
        .bind(&message.text)
        .bind(suggestions)
        .bind(&message.created_at)
        .execute(&self.pool)
        .await?;
        self.publish(ChangeEvent::MessageInserted(message.clone()));
        Ok(message)
    }

    async fn messages_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, session_id, sender, text, suggestions, created_at \
             FROM chat_messages WHERE session_id = $1 ORDER BY created_at ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(parse_message_row).collect())
    }

    async fn session_meta(&self, session_id: &str) -> Result<Option<SessionMeta>, StoreError> {
        let row = sqlx::query(
            "SELECT session_id, contact_info, status, transferred, created_at, updated_at \
             FROM chat_sessions WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_session_row))
    }

    async fn upsert_session_meta(&self, meta: &SessionMeta) -> Result<SessionMeta, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO chat_sessions (session_id, contact_info, status, transferred, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (session_id) DO UPDATE SET
                contact_info = COALESCE(NULLIF(EXCLUDED.contact_info, ''), chat_sessions.contact_info),
                status = CASE
                    WHEN chat_sessions.status = 'completed' THEN chat_sessions.status
                    ELSE EXCLUDED.status
                END,
                transferred = chat_sessions.transferred OR EXCLUDED.transferred,
                updated_at = EXCLUDED.updated_at
            RETURNING session_id, contact_info, status, transferred, created_at, updated_at
            "#,
        )
        .bind(&meta.session_id)
        .bind(&meta.contact_info)
        .bind(meta.status.as_str())
        .bind(meta.transferred)
        .bind(&meta.created_at)
        .bind(&meta.updated_at)
        .fetch_one(&self.pool)
        .await?;
        let merged = parse_session_row(row);
        self.publish(ChangeEvent::SessionUpserted(merged.clone()));
        Ok(merged)
    }

    async fn set_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
    ) -> Result<bool, StoreError> {
        let now = now_iso();
        let result = sqlx::query(
            r#"
            INSERT INTO chat_sessions (session_id, contact_info, status, transferred, created_at, updated_at)
            VALUES ($1, NULL, $2, FALSE, $3, $3)
            ON CONFLICT (session_id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            WHERE chat_sessions.status <> EXCLUDED.status
              AND chat_sessions.status <> 'completed'
            "#,
        )
        .bind(session_id)
        .bind(status.as_str())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            if let Some(meta) = self.session_meta(session_id).await? {
                self.publish(ChangeEvent::SessionUpserted(meta));
            }
        }
        Ok(changed)
    }

    async fn transferred_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id, contact_info, status, transferred, created_at, updated_at \
             FROM chat_sessions WHERE transferred = TRUE ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut list = Vec::with_capacity(rows.len());
        for row in rows {
            let meta = parse_session_row(row);
            let last_message = sqlx::query(
                "SELECT id, session_id, sender, text, suggestions, created_at \
                 FROM chat_messages WHERE session_id = $1 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(&meta.session_id)
            .fetch_optional(&self.pool)
            .await?
            .map(parse_message_row);

            list.push(SessionSummary {
                contact_label: contact_label(meta.contact_info.as_deref(), last_message.as_ref()),
                session_id: meta.session_id,
                status: meta.status,
                created_at: meta.created_at,
                last_message,
            });
        }
        Ok(list)
    }

    async fn insert_form_submission(
        &self,
        draft: &NewFormSubmission,
    ) -> Result<FormSubmission, StoreError> {
        let submission = FormSubmission {
            id: Uuid::new_v4().to_string(),
            first_name: draft.first_name.clone(),
            last_name: draft.last_name.clone(),
            email: draft.email.clone(),
            phone: draft.phone.clone(),
            address: draft.address.clone(),
            city: draft.city.clone(),
            state: draft.state.clone(),
            zip: draft.zip.trim().to_string(),
            existing_client: draft.existing_client,
            help_message: draft.help_message.clone(),
            disclaimer: draft.disclaimer,
            created_at: now_iso(),
        };
        sqlx::query(
            "INSERT INTO form_submissions \
             (id, first_name, last_name, email, phone, address, city, state, zip, \
              existing_client, help_message, disclaimer, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
        )
        .bind(&submission.id)
        .bind(&submission.first_name)
        .bind(&submission.last_name)
        .bind(&submission.email)
        .bind(&submission.phone)
        .bind(&submission.address)
        .bind(&submission.city)
        .bind(&submission.state)
        .bind(&submission.zip)
        .bind(submission.existing_client)
        .bind(&submission.help_message)
        .bind(submission.disclaimer)
        .bind(&submission.created_at)
        .execute(&self.pool)
        .await?;
        Ok(submission)
    }

    async fn list_form_submissions(&self) -> Result<Vec<FormSubmission>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, first_name, last_name, email, phone, address, city, state, zip, \
                    existing_client, help_message, disclaimer, created_at \
             FROM form_submissions ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| FormSubmission {
                id: row.get("id"),
                first_name: row.get("first_name"),
                last_name: row.get("last_name"),
                email: row.get("email"),
                phone: row.get("phone"),
                address: row.get("address"),
                city: row.get("city"),
                state: row.get("state"),
                zip: row.get("zip"),
                existing_client: row.get("existing_client"),
                help_message: row.get("help_message"),
                disclaimer: row.get("disclaimer"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn record_visit(&self, visit: &NewVisit) -> Result<(), StoreError> {
        let referrer = if visit.referrer.trim().is_empty() {
            "Direct"
        } else {
            visit.referrer.as_str()
        };
        sqlx::query(
            "INSERT INTO visitor_logs \
             (id, ip_address, country, region, city, user_agent, referrer, page_url, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&visit.ip_address)
        .bind(&visit.country)
        .bind(&visit.region)
        .bind(&visit.city)
        .bind(&visit.user_agent)
        .bind(referrer)
        .bind(&visit.page_url)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
pub use memory::MemoryStore;

#[cfg(test)]
mod memory {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemoryInner {
        messages: HashMap<String, Vec<ChatMessage>>,
        sessions: HashMap<String, SessionMeta>,
        forms: Vec<FormSubmission>,
        visits: Vec<NewVisit>,
    }

    /// In-memory store with failure injection, backing the unit tests for
    /// rollback, gating, and dedup behavior.
    pub struct MemoryStore {
        inner: Mutex<MemoryInner>,
        events: broadcast::Sender<ChangeEvent>,
        fail_inserts: AtomicBool,
        fail_fetches: AtomicBool,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            let (events, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
            MemoryStore {
                inner: Mutex::new(MemoryInner::default()),
                events,
                fail_inserts: AtomicBool::new(false),
                fail_fetches: AtomicBool::new(false),
            }
        }

        pub fn set_fail_inserts(&self, fail: bool) {
            self.fail_inserts.store(fail, Ordering::SeqCst);
        }

        pub fn set_fail_fetches(&self, fail: bool) {
            self.fail_fetches.store(fail, Ordering::SeqCst);
        }

        pub fn message_count(&self, session_id: &str) -> usize {
            let inner = self.inner.lock().unwrap();
            inner.messages.get(session_id).map_or(0, Vec::len)
        }

        pub fn form_count(&self) -> usize {
            self.inner.lock().unwrap().forms.len()
        }

        pub fn visit_count(&self) -> usize {
            self.inner.lock().unwrap().visits.len()
        }

        fn publish(&self, event: ChangeEvent) {
            let _ = self.events.send(event);
        }

        fn check_insert(&self) -> Result<(), StoreError> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("injected insert failure".into()))
            } else {
                Ok(())
            }
        }

        fn check_fetch(&self) -> Result<(), StoreError> {
            if self.fail_fetches.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("injected fetch failure".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ChatStore for MemoryStore {
        async fn insert_message(&self, draft: &NewMessage) -> Result<ChatMessage, StoreError> {
            self.check_insert()?;
            let message = ChatMessage {
                id: Uuid::new_v4().to_string(),
                session_id: draft.session_id.clone(),
                sender: draft.sender,
                text: draft.text.clone(),
                suggestions: draft.suggestions.clone(),
                created_at: draft.created_at.clone(),
            };
            {
                let mut inner = self.inner.lock().unwrap();
                inner
                    .messages
                    .entry(message.session_id.clone())
                    .or_default()
                    .push(message.clone());
            }
            self.publish(ChangeEvent::MessageInserted(message.clone()));
            Ok(message)
        }

        async fn messages_for_session(
            &self,
            session_id: &str,
        ) -> Result<Vec<ChatMessage>, StoreError> {
            self.check_fetch()?;
            let inner = self.inner.lock().unwrap();
            let mut messages = inner.messages.get(session_id).cloned().unwrap_or_default();
            messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(messages)
        }

        async fn session_meta(
            &self,
            session_id: &str,
        ) -> Result<Option<SessionMeta>, StoreError> {
            self.check_fetch()?;
            let inner = self.inner.lock().unwrap();
            Ok(inner.sessions.get(session_id).cloned())
        }

        async fn upsert_session_meta(
            &self,
            meta: &SessionMeta,
        ) -> Result<SessionMeta, StoreError> {
            self.check_insert()?;
            let merged = {
                let mut inner = self.inner.lock().unwrap();
                let merged = match inner.sessions.get(&meta.session_id) {
                    Some(existing) => SessionMeta {
                        session_id: existing.session_id.clone(),
                        contact_info: meta
                            .contact_info
                            .clone()
                            .filter(|c| !c.is_empty())
                            .or_else(|| existing.contact_info.clone()),
                        status: if existing.status == SessionStatus::Completed {
                            SessionStatus::Completed
                        } else {
                            meta.status
                        },
                        transferred: existing.transferred || meta.transferred,
                        created_at: existing.created_at.clone(),
                        updated_at: meta.updated_at.clone(),
                    },
                    None => meta.clone(),
                };
                inner
                    .sessions
                    .insert(merged.session_id.clone(), merged.clone());
                merged
            };
            self.publish(ChangeEvent::SessionUpserted(merged.clone()));
            Ok(merged)
        }

        async fn set_session_status(
            &self,
            session_id: &str,
            status: SessionStatus,
        ) -> Result<bool, StoreError> {
            self.check_insert()?;
            let now = now_iso();
            let updated = {
                let mut inner = self.inner.lock().unwrap();
                match inner.sessions.get_mut(session_id) {
                    Some(meta)
                        if meta.status == status || meta.status == SessionStatus::Completed =>
                    {
                        None
                    }
                    Some(meta) => {
                        meta.status = status;
                        meta.updated_at = now;
                        Some(meta.clone())
                    }
                    None => {
                        let meta = SessionMeta {
                            session_id: session_id.to_string(),
                            contact_info: None,
                            status,
                            transferred: false,
                            created_at: now.clone(),
                            updated_at: now,
                        };
                        inner.sessions.insert(session_id.to_string(), meta.clone());
                        Some(meta)
                    }
                }
            };
            match updated {
                Some(meta) => {
                    self.publish(ChangeEvent::SessionUpserted(meta));
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn transferred_sessions(&self) -> Result<Vec<SessionSummary>, StoreError> {
            self.check_fetch()?;
            let inner = self.inner.lock().unwrap();
            let mut metas: Vec<&SessionMeta> = inner
                .sessions
                .values()
                .filter(|m| m.transferred)
                .collect();
            metas.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(metas
                .into_iter()
                .map(|meta| {
                    let last_message = inner
                        .messages
                        .get(&meta.session_id)
                        .and_then(|list| list.last().cloned());
                    SessionSummary {
                        contact_label: contact_label(
                            meta.contact_info.as_deref(),
                            last_message.as_ref(),
                        ),
                        session_id: meta.session_id.clone(),
                        status: meta.status,
                        created_at: meta.created_at.clone(),
                        last_message,
                    }
                })
                .collect())
        }

        async fn insert_form_submission(
            &self,
            draft: &NewFormSubmission,
        ) -> Result<FormSubmission, StoreError> {
            self.check_insert()?;
            let submission = FormSubmission {
                id: Uuid::new_v4().to_string(),
                first_name: draft.first_name.clone(),
                last_name: draft.last_name.clone(),
                email: draft.email.clone(),
                phone: draft.phone.clone(),
                address: draft.address.clone(),
                city: draft.city.clone(),
                state: draft.state.clone(),
                zip: draft.zip.trim().to_string(),
                existing_client: draft.existing_client,
                help_message: draft.help_message.clone(),
                disclaimer: draft.disclaimer,
                created_at: now_iso(),
            };
            self.inner.lock().unwrap().forms.push(submission.clone());
            Ok(submission)
        }

        async fn list_form_submissions(&self) -> Result<Vec<FormSubmission>, StoreError> {
            self.check_fetch()?;
            let mut forms = self.inner.lock().unwrap().forms.clone();
            forms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(forms)
        }

        async fn record_visit(&self, visit: &NewVisit) -> Result<(), StoreError> {
            self.check_insert()?;
            self.inner.lock().unwrap().visits.push(visit.clone());
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
            self.events.subscribe()
        }
    }
}
