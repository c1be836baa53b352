use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::AtomicUsize,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// Sentinel for lead fields the guest never filled in. The dashboard relies
/// on these never being empty strings.
pub const NOT_PROVIDED: &str = "not provided";

pub const SENDER_CLIENT: &str = "client";
pub const SENDER_AGENT: &str = "agent";
pub const SENDER_BOT: &str = "bot";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub sender: String,
    pub timestamp: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub email: String,
    pub phone: String,
    pub source: String,
    pub time_on_page: String,
    pub project: String,
    pub urgency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Waiting,
    Active,
    Closed,
}

/// Durable in-process record of one guest interaction. Keyed by guest id,
/// outlives the guest's live connection, never deleted, only marked closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub client_name: String,
    pub last_message: String,
    pub unread: u32,
    pub time: String,
    pub status: ConversationStatus,
    pub client_info: ClientInfo,
    pub messages: Vec<ChatMessage>,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
}

/// One entry of the pre-chat transcript a guest brings along on join, and the
/// shape queued guest messages are buffered in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserData {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub source: Option<String>,
    pub time_on_page: Option<String>,
    pub project: Option<String>,
    pub urgency: Option<String>,
    pub message: Option<String>,
    pub timestamp: Option<String>,
}

/// Body of the `user_join` frame. Retained verbatim for queued guests so the
/// matched agent eventually receives the full transcript in one piece.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JoinPayload {
    pub user_data: UserData,
    pub conversation_history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub email: String,
    pub name: String,
    pub password_hash: String,
}

/// Frames handed to a connection's writer task. `Close` makes the writer
/// emit a close frame and stop draining.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub type ConnSender = mpsc::UnboundedSender<Outbound>;

/// The single registry state a connection occupies at any instant. The
/// terminal closed state is represented by removal from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Pending,
    Available,
    Queued,
    InSession,
}

#[derive(Debug, Clone)]
pub struct WaitingGuest {
    pub conn_id: usize,
    pub join: JoinPayload,
    pub guest_id: String,
}

/// All shared mutable routing state, guarded by one lock and mutated only as
/// whole operations. Every structure is keyed by generated connection id,
/// never by the transport handle.
#[derive(Default)]
pub struct Registry {
    pub clients: HashMap<usize, ConnSender>,
    pub states: HashMap<usize, ConnState>,
    pub agents: HashMap<usize, AgentIdentity>,
    pub available_agents: VecDeque<usize>,
    pub waiting_guests: VecDeque<WaitingGuest>,
    pub sessions: HashMap<usize, usize>,
    pub reverse_sessions: HashMap<usize, usize>,
    pub guest_ids: HashMap<usize, String>,
    pub conversations: HashMap<String, Conversation>,
}

pub struct AppState {
    pub registry: Mutex<Registry>,
    pub users: Mutex<HashMap<String, UserRecord>>,
    pub next_conn_id: AtomicUsize,
    pub jwt_secret: String,
    pub deploy_secret: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginForm {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterBody {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuickTemplate {
    pub id: String,
    pub title: String,
    pub content: String,
    pub icon: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryAgent {
    pub id: usize,
    pub name: String,
    pub status: String,
    pub department: String,
    pub avatar: String,
}
