use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sessions created before metadata existed have no row in `chat_sessions`;
/// they are treated as live conversations.
pub const DEFAULT_SESSION_STATUS: SessionStatus = SessionStatus::Active;

/// Registry label for a transferred session that has neither contact info nor
/// any message yet.
pub const NO_CONTACT_LABEL: &str = "No contact info yet";

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
    Agent,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
            Sender::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Sender> {
        match value {
            "user" => Some(Sender::User),
            "bot" => Some(Sender::Bot),
            "agent" => Some(Sender::Agent),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<SessionStatus> {
        match value {
            "pending" => Some(SessionStatus::Pending),
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub sender: Sender,
    pub text: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub created_at: String,
}

impl ChatMessage {
    /// Dedup identity: sender is part of the key, so a bot reply and an agent
    /// reply that collide on text and timestamp stay distinct.
    pub fn same_message(&self, other: &ChatMessage) -> bool {
        self.sender == other.sender
            && self.text == other.text
            && self.created_at == other.created_at
    }
}

/// A message as handed to the store; the store assigns the permanent id.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub sender: Sender,
    pub text: String,
    pub suggestions: Vec<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    pub contact_info: Option<String>,
    pub status: SessionStatus,
    pub transferred: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub contact_label: String,
    pub status: SessionStatus,
    pub created_at: String,
    pub last_message: Option<ChatMessage>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "record")]
pub enum ChangeEvent {
    MessageInserted(ChatMessage),
    SessionUpserted(SessionMeta),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormSubmission {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub existing_client: bool,
    #[serde(default)]
    pub help_message: String,
    pub disclaimer: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFormSubmission {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub existing_client: bool,
    #[serde(default)]
    pub help_message: String,
    #[serde(default)]
    pub disclaimer: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewVisit {
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub referrer: String,
    #[serde(default)]
    pub page_url: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("message text is empty")]
    EmptyMessage,
    #[error("conversation has ended")]
    SessionClosed,
    #[error("send failed: {0}")]
    Send(#[source] StoreError),
    #[error("fetch failed: {0}")]
    Fetch(#[source] StoreError),
}
