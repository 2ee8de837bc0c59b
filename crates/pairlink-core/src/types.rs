//! Protocol vocabulary — roles, message types, error codes, payload schemas.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The two endpoint roles of a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Phone,
    Agent,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "phone" => Some(Role::Phone),
            "agent" => Some(Role::Agent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Phone => "phone",
            Role::Agent => "agent",
        }
    }

    /// The opposite role within a session.
    pub fn peer(&self) -> Role {
        match self {
            Role::Phone => Role::Agent,
            Role::Agent => Role::Phone,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message type names.
pub mod msg {
    pub const AUTH: &str = "auth";
    pub const AUTH_OK: &str = "auth.ok";
    pub const AUTH_FAIL: &str = "auth.fail";
    pub const CHAT_SEND: &str = "chat.send";
    pub const CHAT_STREAM: &str = "chat.stream";
    pub const CHAT_DONE: &str = "chat.done";
    pub const CHAT_ERROR: &str = "chat.error";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const STATUS: &str = "status";
    pub const KEY_EXCHANGE: &str = "key_exchange";

    // Agent management
    pub const AGENT_LIST: &str = "agent.list";
    pub const AGENT_LIST_RESULT: &str = "agent.list.result";
    pub const AGENT_CREATE: &str = "agent.create";
    pub const AGENT_UPDATE: &str = "agent.update";
    pub const AGENT_DELETE: &str = "agent.delete";
    pub const AGENT_RESULT: &str = "agent.result";

    // Chat history
    pub const CHAT_HISTORY: &str = "chat.history";
    pub const CHAT_HISTORY_RESULT: &str = "chat.history.result";

    // Tool status
    pub const CHAT_TOOL_STATUS: &str = "chat.tool_status";

    // Memory search
    pub const MEMORY_SEARCH: &str = "memory.search";
    pub const MEMORY_SEARCH_RESULT: &str = "memory.search.result";
}

/// Error codes carried by `chat.error` and `auth.fail` payloads.
pub mod code {
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const PEER_OFFLINE: &str = "PEER_OFFLINE";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const DAILY_QUOTA_EXCEEDED: &str = "DAILY_QUOTA_EXCEEDED";
    pub const MONTHLY_QUOTA_EXCEEDED: &str = "MONTHLY_QUOTA_EXCEEDED";
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
}

/// Is this a type the relay forwards verbatim to the peer?
///
/// Anything not listed here (and not relay-interpreted) is silently dropped.
pub fn is_forwardable(kind: &str) -> bool {
    matches!(
        kind,
        msg::CHAT_SEND
            | msg::CHAT_STREAM
            | msg::CHAT_DONE
            | msg::CHAT_ERROR
            | msg::KEY_EXCHANGE
            | msg::AGENT_LIST
            | msg::AGENT_LIST_RESULT
            | msg::AGENT_CREATE
            | msg::AGENT_UPDATE
            | msg::AGENT_DELETE
            | msg::AGENT_RESULT
            | msg::CHAT_HISTORY
            | msg::CHAT_HISTORY_RESULT
            | msg::CHAT_TOOL_STATUS
            | msg::MEMORY_SEARCH
            | msg::MEMORY_SEARCH_RESULT
    )
}

/// Types only the agent side may originate.
pub fn is_agent_only(kind: &str) -> bool {
    matches!(kind, msg::CHAT_STREAM | msg::CHAT_DONE)
}

// ── Relay-interpreted payloads ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
    /// Kept as a raw string so an unknown role can be reported verbatim.
    pub role: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub paired: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub daily_quota_bytes: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub daily_used_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    /// "online" | "offline"
    pub peer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_after_ms: i64,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

// ── Forwarded payloads ────────────────────────────────────────────────────────
//
// The relay never reads these; they exist for clients built on this crate.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    pub mime_type: String,
    pub content_b64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMsg {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSendPayload {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation: Vec<ConversationMsg>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamPayload {
    pub delta: String,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatDonePayload {
    pub full_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageInfo>,
}
