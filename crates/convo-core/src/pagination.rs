use std::collections::HashMap;

use tracing::trace;

use crate::{
    conversation::Conversation,
    types::{HistoryKind, HistoryRequest, PageQuery, PaginationConfig, ScrollSignal},
};

const MAX_PAGE_SIZE: u16 = 100;

/// Decides when older history is fetched and keeps at most one fetch in
/// flight per conversation.
#[derive(Debug, Clone)]
pub struct PaginationController {
    config: PaginationConfig,
    in_flight: HashMap<String, u64>,
    last_evaluated_ms: Option<u64>,
    next_request_id: u64,
}

impl PaginationController {
    pub fn new(config: PaginationConfig) -> Self {
        Self {
            config: PaginationConfig {
                page_size: bounded_page_size(config.page_size),
                ..config
            },
            in_flight: HashMap::new(),
            last_evaluated_ms: None,
            next_request_id: 1,
        }
    }

    pub fn page_size(&self) -> u16 {
        self.config.page_size
    }

    pub fn is_in_flight(&self, peer: &str) -> bool {
        self.in_flight.contains_key(peer)
    }

    /// Request the newest page for a freshly opened conversation.
    ///
    /// Replaces any earlier in-flight request for `peer`; its result will be
    /// treated as stale.
    pub fn begin_initial(&mut self, peer: &str) -> HistoryRequest {
        self.begin(peer, HistoryKind::Initial, 0)
    }

    /// Evaluate a scroll signal for the open conversation.
    ///
    /// Returns a request when the viewport is near the top, nothing is in
    /// flight for the conversation and older history may still exist.
    /// Signals arriving faster than the throttle interval are ignored.
    pub fn on_scroll(
        &mut self,
        conversation: &Conversation,
        signal: ScrollSignal,
        now_ms: u64,
    ) -> Option<HistoryRequest> {
        if let Some(last) = self.last_evaluated_ms
            && now_ms.saturating_sub(last) < self.config.throttle_interval_ms
        {
            trace!(now_ms, last, "scroll evaluation throttled");
            return None;
        }
        self.last_evaluated_ms = Some(now_ms);

        if signal.offset_from_top_px >= self.config.near_top_threshold_px {
            return None;
        }
        if self.is_in_flight(conversation.peer()) || conversation.all_loaded() {
            return None;
        }

        Some(self.begin(conversation.peer(), HistoryKind::Older, conversation.offset()))
    }

    /// Clear the in-flight marker for a finished request.
    ///
    /// Returns `false` when the request was superseded and its result must
    /// be discarded.
    pub fn complete(&mut self, request: &HistoryRequest) -> bool {
        match self.in_flight.get(&request.peer) {
            Some(id) if *id == request.request_id => {
                self.in_flight.remove(&request.peer);
                true
            }
            _ => false,
        }
    }

    fn begin(&mut self, peer: &str, kind: HistoryKind, offset: u64) -> HistoryRequest {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.in_flight.insert(peer.to_owned(), request_id);
        HistoryRequest {
            request_id,
            peer: peer.to_owned(),
            query: PageQuery {
                limit: self.config.page_size,
                offset,
            },
            kind,
        }
    }
}

/// Clamp a configured page size into `1..=100`.
pub fn bounded_page_size(requested: u16) -> u16 {
    requested.clamp(1, MAX_PAGE_SIZE)
}
