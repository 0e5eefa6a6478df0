//! Network side of the conversation client: HTTP API, push connection and
//! the runtime task tying them to a [`convo_core::ConversationSession`].

pub mod api;
pub mod live;
pub mod runtime;

pub use api::{ChatApi, HttpChatApi};
pub use live::{LiveConnection, LiveEvent, PushConnector, WsConnector, ws_url_from_base};
pub use runtime::{ChatRuntimeHandle, RuntimeConfig, spawn_runtime};
