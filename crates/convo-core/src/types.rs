use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::SyncError, unread::NotificationSummary};

/// High-level client lifecycle state reported to the frontend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionLifecycleState {
    /// No user has been identified yet.
    Cold,
    /// A login or session restore flow is currently running.
    Authenticating,
    /// A user is identified; history and roster calls are allowed.
    Authenticated,
    /// The push connection is open and identified.
    Connected,
    /// The push connection was lost. Nothing reconnects automatically.
    Disconnected,
    /// The user logged out and the persisted username was cleared.
    LoggedOut,
}

/// One direct message. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Sender username.
    pub from: String,
    /// Recipient username.
    pub to: String,
    /// Opaque message text.
    pub content: String,
    /// ISO-8601 instant assigned by the sender.
    pub timestamp: String,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            content: content.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Build an outgoing message stamped with the current time.
    pub fn outgoing(
        from: impl Into<String>,
        to: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(from, to, content, now_timestamp())
    }

    /// First frame written after connect. Announces the user as online.
    pub fn identify(username: impl Into<String>) -> Self {
        Self::new(username, "", "", now_timestamp())
    }
}

/// Current UTC time in the `2024-01-02T03:04:05.678Z` form used on the wire.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Contact roster row as broadcast by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RosterEntry {
    pub username: String,
    /// Presence label, `online` or `offline` on current servers.
    pub status: String,
}

impl RosterEntry {
    pub fn new(username: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            status: status.into(),
        }
    }
}

/// Inbound push payload, decoded once at the connection boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    /// Full roster snapshot replacing the previous one.
    Roster(Vec<RosterEntry>),
    /// Chat message addressed to some user.
    Chat(Message),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireFrame {
    Roster(RosterFrame),
    Chat(Message),
}

#[derive(Deserialize)]
struct RosterFrame {
    #[serde(rename = "type")]
    _kind: RosterTag,
    #[serde(default)]
    data: Option<Vec<RosterEntry>>,
}

#[derive(Deserialize)]
enum RosterTag {
    #[serde(rename = "userlist")]
    UserList,
}

impl PushEvent {
    /// Decode one text frame from the push channel.
    pub fn decode(raw: &str) -> Result<Self, SyncError> {
        let frame = serde_json::from_str::<WireFrame>(raw).map_err(|err| {
            SyncError::protocol("invalid_push_frame", format!("unrecognized push frame: {err}"))
        })?;

        Ok(match frame {
            WireFrame::Roster(roster) => PushEvent::Roster(roster.data.unwrap_or_default()),
            WireFrame::Chat(message) => PushEvent::Chat(message),
        })
    }
}

/// History pagination tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PaginationConfig {
    /// Messages requested per history call.
    pub page_size: u16,
    /// Scroll offset (from the top) under which older history is requested.
    pub near_top_threshold_px: f32,
    /// Minimum spacing between two scroll evaluations.
    pub throttle_interval_ms: u64,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            page_size: 10,
            near_top_threshold_px: 50.0,
            throttle_interval_ms: 250,
        }
    }
}

/// `limit`/`offset` pair sent with a conversation history call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageQuery {
    pub limit: u16,
    pub offset: u64,
}

/// Why a history page was requested.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HistoryKind {
    /// Newest page fetched when a conversation is opened.
    Initial,
    /// Older page fetched by scrolling near the top.
    Older,
}

/// A history fetch tagged with the conversation it was issued for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryRequest {
    pub request_id: u64,
    pub peer: String,
    pub query: PageQuery,
    pub kind: HistoryKind,
}

/// Scroll position reported by the view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScrollSignal {
    /// Distance between the viewport top and the first message, in pixels.
    pub offset_from_top_px: f32,
    /// Whether the viewport currently shows the newest message.
    pub at_bottom: bool,
}

/// Scroll adjustment the view should perform after applying a delta.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ScrollAction {
    /// Leave the viewport where it is.
    Keep,
    /// Scroll so the newest message is visible.
    PinToBottom,
    /// Shift the viewport by the height of the prepended rows so the
    /// visible anchor does not move.
    PreserveAnchor { prepended: usize },
}

/// Incremental conversation operation, messages in oldest-first order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationOp {
    /// Replace the whole sequence: the first page after open followed by
    /// anything that arrived while it loaded.
    Reset(Vec<Message>),
    /// Add one message at the tail.
    Append(Message),
    /// Add an older page at the head.
    PrependPage(Vec<Message>),
}

/// Command channel input accepted by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncCommand {
    /// Create an account.
    Register { username: String, password: String },
    /// Authenticate and start the chat on success.
    Login { username: String, password: String },
    /// Start the chat for the persisted username, skipping login.
    RestoreSession,
    /// Open the push connection. Used at chat start and by external
    /// reconnection policies after `ConnectionClosed`.
    Connect,
    /// Re-fetch the roster through the request/response API.
    RefreshRoster,
    /// Select a peer and load its newest history page.
    OpenConversation { peer: String },
    /// Viewport moved; may load older history.
    Scroll(ScrollSignal),
    /// Send text to the selected peer.
    SendMessage { content: String },
    /// Close the connection and forget the persisted username.
    Logout,
}

/// Event channel output emitted by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SyncEvent {
    /// Lifecycle transition.
    StateChanged { state: SessionLifecycleState },
    /// Result of a registration attempt.
    RegisterResult { success: bool, message: String },
    /// Result of login or session restore.
    AuthResult {
        success: bool,
        username: Option<String>,
        message: Option<String>,
    },
    /// Roster snapshot with the local user filtered out.
    RosterUpdated { entries: Vec<RosterEntry> },
    /// A conversation became the selected one; its view was cleared.
    ConversationOpened { peer: String },
    /// Changes to a conversation's message sequence.
    ConversationDelta {
        peer: String,
        ops: Vec<ConversationOp>,
        scroll: ScrollAction,
    },
    /// Unread count for one peer changed.
    UnreadChanged { peer: String, count: u64 },
    /// Aggregate unread badge.
    NotificationSummary(NotificationSummary),
    /// A user action was rejected locally before any network call.
    ValidationFailed { reason: String },
    /// A request/response call failed; state was left unchanged.
    RequestFailed {
        operation: String,
        code: String,
        message: String,
    },
    /// The push connection ended. Terminal until the next `Connect`.
    ConnectionClosed { reason: String },
    /// Command rejected by the runtime.
    FatalError {
        code: String,
        message: String,
        recoverable: bool,
    },
}

/// Server reply to `register`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterReply {
    #[serde(default)]
    pub success: bool,
    pub message: String,
}

/// Server reply to `login`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Unread counters keyed by sender username.
pub type UnreadCounts = HashMap<String, u64>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_userlist_frame_as_roster() {
        let raw = r#"{"type":"userlist","data":[{"username":"bob","status":"online"},{"username":"carol","status":"offline"}]}"#;
        let event = PushEvent::decode(raw).expect("userlist frame should decode");
        assert_eq!(
            event,
            PushEvent::Roster(vec![
                RosterEntry::new("bob", "online"),
                RosterEntry::new("carol", "offline"),
            ])
        );
    }

    #[test]
    fn decodes_null_userlist_data_as_empty_roster() {
        let event = PushEvent::decode(r#"{"type":"userlist","data":null}"#)
            .expect("null roster should decode");
        assert_eq!(event, PushEvent::Roster(Vec::new()));
    }

    #[test]
    fn decodes_bare_message_frame_as_chat() {
        let raw = r#"{"from":"bob","to":"alice","content":"hi","timestamp":"2024-05-01T10:00:00.000Z"}"#;
        let event = PushEvent::decode(raw).expect("message frame should decode");
        assert_eq!(
            event,
            PushEvent::Chat(Message::new(
                "bob",
                "alice",
                "hi",
                "2024-05-01T10:00:00.000Z"
            ))
        );
    }

    #[test]
    fn rejects_unknown_frame_shapes() {
        let err = PushEvent::decode(r#"{"type":"typing","data":{"user":"bob"}}"#)
            .expect_err("unknown frame must fail");
        assert_eq!(err.code, "invalid_push_frame");
    }

    #[test]
    fn identify_frame_has_empty_peer_and_content() {
        let frame = Message::identify("alice");
        assert_eq!(frame.from, "alice");
        assert!(frame.to.is_empty());
        assert!(frame.content.is_empty());
        assert!(frame.timestamp.ends_with('Z'));
    }

    #[test]
    fn message_serializes_with_wire_field_names() {
        let message = Message::new("alice", "bob", "yo", "2024-05-01T10:00:00.000Z");
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["from"], "alice");
        assert_eq!(value["to"], "bob");
        assert_eq!(value["content"], "yo");
        assert_eq!(value["timestamp"], "2024-05-01T10:00:00.000Z");
    }
}
