//! Core conversation sync contract shared between the runtime and frontends.
//!
//! This crate defines the command/event protocol, the session lifecycle, and
//! the pure conversation state (history cache, pagination, unread counters).
//! It performs no I/O.

/// Async command/event channel primitives.
pub mod channel;
/// Per-peer loaded history and the session-wide conversation cache.
pub mod conversation;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Scroll-driven history paging.
pub mod pagination;
/// Orchestrator over conversation, unread and pagination state.
pub mod session;
/// Session lifecycle state machine.
pub mod state_machine;
/// Frontend-facing protocol types (commands, events, payloads).
pub mod types;
/// Unread counters and the aggregate notification badge.
pub mod unread;

pub use channel::{EventStream, SyncChannelError, SyncChannels};
pub use conversation::{Conversation, ConversationStore};
pub use error::{SyncError, SyncErrorCategory, classify_http_status};
pub use pagination::{PaginationController, bounded_page_size};
pub use session::{ConversationSession, SessionEffect};
pub use state_machine::SessionStateMachine;
pub use types::{
    ConversationOp, HistoryKind, HistoryRequest, LoginReply, Message, PageQuery,
    PaginationConfig, PushEvent, RegisterReply, RosterEntry, ScrollAction, ScrollSignal,
    SessionLifecycleState, SyncCommand, SyncEvent, UnreadCounts, now_timestamp,
};
pub use unread::{NotificationSummary, UnreadRegistry};
