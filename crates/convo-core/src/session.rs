//! Orchestrator binding the selected peer to history, pagination and unread
//! state.
//!
//! Every method runs synchronously and returns the side effects the caller
//! must perform. Request/response completions re-enter through the
//! `complete_*` methods, which makes the session the only place where
//! conversation state changes.

use tracing::{debug, trace, warn};

use crate::{
    conversation::{Conversation, ConversationStore, chronological_page},
    error::SyncError,
    pagination::PaginationController,
    types::{
        ConversationOp, HistoryKind, HistoryRequest, Message, PaginationConfig, PushEvent,
        RosterEntry, ScrollAction, ScrollSignal, SyncEvent, UnreadCounts,
    },
    unread::{NotificationSummary, UnreadRegistry},
};

/// Work requested by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// Call `conversation` with the request's query.
    FetchHistory(HistoryRequest),
    /// Call `markAsRead` for messages from `peer`.
    MarkRead { peer: String },
    /// Write a chat frame to the push connection.
    Transmit(Message),
    /// Call `users` and feed the result to [`ConversationSession::replace_roster`].
    RefreshRoster,
    /// Publish an event to frontends.
    Emit(SyncEvent),
}

#[derive(Debug, Clone)]
pub struct ConversationSession {
    current_user: String,
    selected: Option<String>,
    store: ConversationStore,
    unread: UnreadRegistry,
    pagination: PaginationController,
    roster: Vec<RosterEntry>,
    view_at_bottom: bool,
}

impl ConversationSession {
    pub fn new(current_user: impl Into<String>, config: PaginationConfig) -> Self {
        let pagination = PaginationController::new(config);
        Self {
            current_user: current_user.into(),
            selected: None,
            store: ConversationStore::new(pagination.page_size()),
            unread: UnreadRegistry::new(),
            pagination,
            roster: Vec::new(),
            view_at_bottom: true,
        }
    }

    pub fn current_user(&self) -> &str {
        &self.current_user
    }

    pub fn selected_peer(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn conversation(&self, peer: &str) -> Option<&Conversation> {
        self.store.get(peer)
    }

    pub fn unread(&self) -> &UnreadRegistry {
        &self.unread
    }

    pub fn summary(&self) -> NotificationSummary {
        self.unread.summary()
    }

    /// Latest roster, local user excluded.
    pub fn roster(&self) -> &[RosterEntry] {
        &self.roster
    }

    pub fn is_fetching(&self, peer: &str) -> bool {
        self.pagination.is_in_flight(peer)
    }

    /// Make `peer` the open conversation and load its newest page.
    ///
    /// Opening the already selected peer does nothing.
    pub fn open_conversation(&mut self, peer: &str) -> Vec<SessionEffect> {
        if self.selected.as_deref() == Some(peer) {
            trace!(%peer, "conversation already open");
            return Vec::new();
        }

        debug!(%peer, "opening conversation");
        self.selected = Some(peer.to_owned());
        self.view_at_bottom = true;
        self.store.open(peer);

        let mut effects = vec![
            SessionEffect::Emit(SyncEvent::ConversationOpened {
                peer: peer.to_owned(),
            }),
            SessionEffect::FetchHistory(self.pagination.begin_initial(peer)),
        ];
        if self.unread.has_entry(peer) {
            effects.push(SessionEffect::MarkRead {
                peer: peer.to_owned(),
            });
        }
        effects
    }

    /// Send `content` to the selected peer with local echo.
    pub fn send_message(&mut self, content: &str) -> Result<Vec<SessionEffect>, SyncError> {
        let Some(peer) = self.selected.clone() else {
            return Err(SyncError::validation("Select a user and type a message."));
        };
        if content.is_empty() {
            return Err(SyncError::validation("Select a user and type a message."));
        }

        let message = Message::outgoing(self.current_user.clone(), peer.clone(), content);
        let op = ConversationOp::Append(message.clone());
        if let Some(conversation) = self.store.get_mut(&peer) {
            conversation.apply_ops(std::slice::from_ref(&op));
        }
        self.view_at_bottom = true;

        Ok(vec![
            SessionEffect::Transmit(message),
            SessionEffect::Emit(SyncEvent::ConversationDelta {
                peer,
                ops: vec![op],
                scroll: ScrollAction::PinToBottom,
            }),
            SessionEffect::RefreshRoster,
        ])
    }

    /// Record the viewport position and load older history when near the top.
    pub fn on_scroll(&mut self, signal: ScrollSignal, now_ms: u64) -> Vec<SessionEffect> {
        self.view_at_bottom = signal.at_bottom;

        let Some(peer) = self.selected.as_deref() else {
            return Vec::new();
        };
        let Some(conversation) = self.store.get(peer) else {
            return Vec::new();
        };

        match self.pagination.on_scroll(conversation, signal, now_ms) {
            Some(request) => {
                debug!(
                    peer = %request.peer,
                    offset = request.query.offset,
                    limit = request.query.limit,
                    "requesting older history"
                );
                vec![SessionEffect::FetchHistory(request)]
            }
            None => Vec::new(),
        }
    }

    /// Route one inbound push frame.
    pub fn handle_push(&mut self, event: PushEvent) -> Vec<SessionEffect> {
        match event {
            PushEvent::Roster(entries) => self.replace_roster(entries),
            PushEvent::Chat(message) => self.route_message(message),
        }
    }

    /// Replace the roster wholesale.
    pub fn replace_roster(&mut self, entries: Vec<RosterEntry>) -> Vec<SessionEffect> {
        self.roster = entries
            .into_iter()
            .filter(|entry| entry.username != self.current_user)
            .collect();
        debug!(count = self.roster.len(), "roster replaced");
        vec![SessionEffect::Emit(SyncEvent::RosterUpdated {
            entries: self.roster.clone(),
        })]
    }

    /// Apply the result of a history fetch.
    pub fn complete_history(
        &mut self,
        request: HistoryRequest,
        result: Result<Vec<Message>, SyncError>,
    ) -> Vec<SessionEffect> {
        if !self.pagination.complete(&request) {
            debug!(
                peer = %request.peer,
                request_id = request.request_id,
                "discarding superseded history page"
            );
            return Vec::new();
        }
        if self.selected.as_deref() != Some(request.peer.as_str()) {
            debug!(
                peer = %request.peer,
                request_id = request.request_id,
                "discarding history page for a conversation that is no longer open"
            );
            return Vec::new();
        }
        let Some(conversation) = self.store.get_mut(&request.peer) else {
            return Vec::new();
        };

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                warn!(
                    peer = %request.peer,
                    offset = request.query.offset,
                    error = %err,
                    "history fetch failed"
                );
                if request.kind == HistoryKind::Initial {
                    // Nothing from the newest page is loaded; let a later
                    // scroll fetch it at the real offset.
                    let loaded = conversation.len() as u64;
                    conversation.set_offset(loaded);
                }
                return vec![request_failed("conversation", err)];
            }
        };

        let exhausted = page.len() < usize::from(request.query.limit);
        let page = chronological_page(page);
        let loaded = page.len();

        let (op, scroll) = match request.kind {
            HistoryKind::Initial => {
                // Live messages and echoes appended while the page was in
                // flight stay at the tail.
                let arrived = conversation.arrived_outside(&page);
                if !arrived.is_empty() {
                    debug!(
                        peer = %request.peer,
                        kept = arrived.len(),
                        "keeping messages newer than first page"
                    );
                }
                let mut merged = page;
                merged.extend(arrived);
                (ConversationOp::Reset(merged), ScrollAction::PinToBottom)
            }
            HistoryKind::Older => (
                ConversationOp::PrependPage(page),
                ScrollAction::PreserveAnchor { prepended: loaded },
            ),
        };
        conversation.apply_ops(std::slice::from_ref(&op));
        if exhausted {
            conversation.mark_all_loaded();
        }
        if scroll == ScrollAction::PinToBottom {
            self.view_at_bottom = true;
        }
        debug!(
            peer = %request.peer,
            loaded,
            offset = conversation.offset(),
            all_loaded = conversation.all_loaded(),
            "history page applied"
        );

        vec![SessionEffect::Emit(SyncEvent::ConversationDelta {
            peer: request.peer,
            ops: vec![op],
            scroll,
        })]
    }

    /// Apply the result of a mark-as-read call.
    pub fn complete_mark_read(
        &mut self,
        peer: &str,
        result: Result<(), SyncError>,
    ) -> Vec<SessionEffect> {
        match result {
            Ok(()) => {
                if !self.unread.clear(peer) {
                    return Vec::new();
                }
                vec![
                    SessionEffect::Emit(SyncEvent::UnreadChanged {
                        peer: peer.to_owned(),
                        count: 0,
                    }),
                    SessionEffect::Emit(SyncEvent::NotificationSummary(self.summary())),
                ]
            }
            Err(err) => {
                warn!(%peer, error = %err, "mark as read failed; unread count kept");
                vec![request_failed("markAsRead", err)]
            }
        }
    }

    /// Seed the registry from the server snapshot taken at session start.
    ///
    /// On failure the registry keeps its current state.
    pub fn seed_unread_counts(
        &mut self,
        result: Result<UnreadCounts, SyncError>,
    ) -> Vec<SessionEffect> {
        match result {
            Ok(counts) => {
                self.unread.replace_all(counts);
                let mut effects: Vec<SessionEffect> = self
                    .unread
                    .iter()
                    .map(|(peer, count)| {
                        SessionEffect::Emit(SyncEvent::UnreadChanged {
                            peer: peer.to_owned(),
                            count,
                        })
                    })
                    .collect();
                effects.push(SessionEffect::Emit(SyncEvent::NotificationSummary(
                    self.summary(),
                )));
                effects
            }
            Err(err) => {
                warn!(error = %err, "unread counts unavailable");
                vec![request_failed("unreadCounts", err)]
            }
        }
    }

    fn route_message(&mut self, message: Message) -> Vec<SessionEffect> {
        if message.to != self.current_user {
            debug!(from = %message.from, to = %message.to, "dropping message for another user");
            return Vec::new();
        }

        if self.selected.as_deref() == Some(message.from.as_str()) {
            let peer = message.from.clone();
            let scroll = if self.view_at_bottom {
                ScrollAction::PinToBottom
            } else {
                ScrollAction::Keep
            };
            let op = ConversationOp::Append(message);
            if let Some(conversation) = self.store.get_mut(&peer) {
                conversation.apply_ops(std::slice::from_ref(&op));
            }
            trace!(%peer, "live message appended to open conversation");
            return vec![SessionEffect::Emit(SyncEvent::ConversationDelta {
                peer,
                ops: vec![op],
                scroll,
            })];
        }

        let count = self.unread.increment(&message.from);
        debug!(from = %message.from, count, "message counted as unread");
        vec![
            SessionEffect::Emit(SyncEvent::UnreadChanged {
                peer: message.from,
                count,
            }),
            SessionEffect::Emit(SyncEvent::NotificationSummary(self.summary())),
        ]
    }
}

fn request_failed(operation: &str, err: SyncError) -> SessionEffect {
    SessionEffect::Emit(SyncEvent::RequestFailed {
        operation: operation.to_owned(),
        code: err.code,
        message: err.message,
    })
}
