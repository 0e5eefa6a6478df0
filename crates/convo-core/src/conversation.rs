use std::{cmp::Ordering, collections::HashMap};

use chrono::DateTime;

use crate::types::{ConversationOp, Message};

/// Loaded history with one peer, oldest message first.
///
/// The sequence is always a contiguous run of the peer's history ending at
/// the newest known message: older pages only go to the head, new messages
/// only to the tail.
#[derive(Debug, Clone)]
pub struct Conversation {
    peer: String,
    messages: Vec<Message>,
    offset: u64,
    all_loaded: bool,
}

impl Conversation {
    pub fn new(peer: impl Into<String>, initial_offset: u64) -> Self {
        Self {
            peer: peer.into(),
            messages: Vec::new(),
            offset: initial_offset,
            all_loaded: false,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Count of messages already loaded; the next history page starts here.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// `true` once a page came back shorter than requested.
    pub fn all_loaded(&self) -> bool {
        self.all_loaded
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub(crate) fn mark_all_loaded(&mut self) {
        self.all_loaded = true;
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    /// Drop loaded messages and rewind pagination for a fresh open.
    pub(crate) fn reset_for_open(&mut self, initial_offset: u64) {
        self.messages.clear();
        self.offset = initial_offset;
        self.all_loaded = false;
    }

    /// Messages that reached the tail since the last open and are missing
    /// from `page`. The first page goes in front of these.
    pub(crate) fn arrived_outside(&self, page: &[Message]) -> Vec<Message> {
        self.messages
            .iter()
            .filter(|message| !page.contains(message))
            .cloned()
            .collect()
    }

    /// Apply operations in order.
    pub fn apply_ops(&mut self, ops: &[ConversationOp]) {
        for op in ops {
            match op {
                ConversationOp::Reset(page) => {
                    self.messages = page.clone();
                    self.offset = page.len() as u64;
                }
                ConversationOp::Append(message) => {
                    self.messages.push(message.clone());
                    self.offset += 1;
                }
                ConversationOp::PrependPage(page) => {
                    self.messages.splice(0..0, page.iter().cloned());
                    self.offset += page.len() as u64;
                }
            }
        }
    }

    /// Timestamps never decrease from head to tail.
    pub fn is_chronological(&self) -> bool {
        self.messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    }
}

/// Put a history page in oldest-first order.
///
/// Servers differ in the direction they return a page in, so the direction
/// is read off the page's first and last timestamps.
pub fn chronological_page(mut page: Vec<Message>) -> Vec<Message> {
    if let (Some(first), Some(last)) = (page.first(), page.last())
        && compare_timestamps(&first.timestamp, &last.timestamp) == Ordering::Greater
    {
        page.reverse();
    }
    page
}

fn compare_timestamps(left: &str, right: &str) -> Ordering {
    match (
        DateTime::parse_from_rfc3339(left),
        DateTime::parse_from_rfc3339(right),
    ) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => left.cmp(right),
    }
}

/// Every conversation opened at least once during the session.
///
/// Nothing is evicted; a conversation keeps its messages while another one
/// is selected.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    conversations: HashMap<String, Conversation>,
    initial_offset: u64,
}

impl ConversationStore {
    pub fn new(page_size: u16) -> Self {
        Self {
            conversations: HashMap::new(),
            initial_offset: u64::from(page_size),
        }
    }

    pub fn get(&self, peer: &str) -> Option<&Conversation> {
        self.conversations.get(peer)
    }

    pub fn get_mut(&mut self, peer: &str) -> Option<&mut Conversation> {
        self.conversations.get_mut(peer)
    }

    /// Reset (or create) the conversation for `peer` ahead of its first page.
    pub fn open(&mut self, peer: &str) -> &mut Conversation {
        let initial_offset = self.initial_offset;
        let conversation = self
            .conversations
            .entry(peer.to_owned())
            .or_insert_with(|| Conversation::new(peer, initial_offset));
        conversation.reset_for_open(initial_offset);
        conversation
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(from: &str, to: &str, content: &str, ts: &str) -> Message {
        Message::new(from, to, content, ts)
    }

    #[test]
    fn prepends_pages_before_existing_messages() {
        let mut conversation = Conversation::new("bob", 10);
        conversation.apply_ops(&[
            ConversationOp::Reset(vec![
                msg("bob", "alice", "3", "2024-01-01T00:00:03.000Z"),
                msg("alice", "bob", "4", "2024-01-01T00:00:04.000Z"),
            ]),
            ConversationOp::PrependPage(vec![
                msg("bob", "alice", "1", "2024-01-01T00:00:01.000Z"),
                msg("bob", "alice", "2", "2024-01-01T00:00:02.000Z"),
            ]),
            ConversationOp::Append(msg("bob", "alice", "5", "2024-01-01T00:00:05.000Z")),
        ]);

        let contents: Vec<_> = conversation
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, ["1", "2", "3", "4", "5"]);
        assert_eq!(conversation.offset(), 5);
        assert!(conversation.is_chronological());
    }

    #[test]
    fn orders_pages_oldest_first_in_either_direction() {
        let oldest_first = vec![
            msg("bob", "alice", "1", "2024-01-01T00:00:01.000Z"),
            msg("alice", "bob", "2", "2024-01-01T00:00:02.000Z"),
            msg("bob", "alice", "3", "2024-01-01T00:00:03.000Z"),
        ];
        let mut newest_first = oldest_first.clone();
        newest_first.reverse();

        assert_eq!(chronological_page(oldest_first.clone()), oldest_first);
        assert_eq!(chronological_page(newest_first), oldest_first);
        assert!(chronological_page(Vec::new()).is_empty());
    }

    #[test]
    fn compares_offsets_as_instants() {
        let page = vec![
            msg("bob", "alice", "first", "2024-01-01T01:30:00+02:00"),
            msg("bob", "alice", "second", "2024-01-01T00:00:00.000Z"),
        ];
        let ordered = chronological_page(page);
        assert_eq!(ordered[0].content, "first");
    }

    #[test]
    fn detects_out_of_order_sequences() {
        let mut conversation = Conversation::new("bob", 10);
        conversation.apply_ops(&[
            ConversationOp::Append(msg("bob", "alice", "late", "2024-01-01T00:00:09.000Z")),
            ConversationOp::Append(msg("bob", "alice", "early", "2024-01-01T00:00:01.000Z")),
        ]);
        assert!(!conversation.is_chronological());
    }

    #[test]
    fn reopening_rewinds_pagination_state() {
        let mut store = ConversationStore::new(10);
        {
            let conversation = store.open("bob");
            conversation.apply_ops(&[ConversationOp::Append(msg(
                "bob",
                "alice",
                "x",
                "2024-01-01T00:00:01.000Z",
            ))]);
            conversation.mark_all_loaded();
        }

        let reopened = store.open("bob");
        assert!(reopened.is_empty());
        assert_eq!(reopened.offset(), 10);
        assert!(!reopened.all_loaded());
    }

    #[test]
    fn keeps_other_conversations_while_switching() {
        let mut store = ConversationStore::new(10);
        store.open("bob").apply_ops(&[ConversationOp::Append(msg(
            "bob",
            "alice",
            "x",
            "2024-01-01T00:00:01.000Z",
        ))]);
        store.open("carol");

        assert_eq!(store.len(), 2);
        assert_eq!(store.get("bob").map(Conversation::len), Some(1));
    }
}
