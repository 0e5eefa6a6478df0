use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Per-peer unread counters, independent of the open conversation.
///
/// A peer without an entry has zero unread messages; entries are never
/// stored with a zero count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnreadRegistry {
    counts: HashMap<String, u64>,
}

impl UnreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one unread message from `peer` and return the new count.
    pub fn increment(&mut self, peer: &str) -> u64 {
        let count = self.counts.entry(peer.to_owned()).or_insert(0);
        *count += 1;
        *count
    }

    /// Remove the entry for `peer`. Returns `true` if one existed.
    pub fn clear(&mut self, peer: &str) -> bool {
        self.counts.remove(peer).is_some()
    }

    pub fn count(&self, peer: &str) -> u64 {
        self.counts.get(peer).copied().unwrap_or(0)
    }

    pub fn has_entry(&self, peer: &str) -> bool {
        self.counts.contains_key(peer)
    }

    /// Sum of all counters.
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Overwrite all local state with a server snapshot.
    pub fn replace_all(&mut self, counts: HashMap<String, u64>) {
        self.counts = counts.into_iter().filter(|(_, count)| *count > 0).collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(peer, count)| (peer.as_str(), *count))
    }

    pub fn summary(&self) -> NotificationSummary {
        NotificationSummary {
            total: self.total(),
        }
    }
}

/// Aggregate unread badge projected from [`UnreadRegistry`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationSummary {
    pub total: u64,
}

impl NotificationSummary {
    /// The badge is hidden while nothing is unread.
    pub fn is_visible(&self) -> bool {
        self.total > 0
    }

    pub fn badge_text(&self) -> Option<String> {
        self.is_visible().then(|| self.total.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_one_per_increment() {
        let mut registry = UnreadRegistry::new();
        for _ in 0..4 {
            registry.increment("bob");
        }
        registry.increment("carol");

        assert_eq!(registry.count("bob"), 4);
        assert_eq!(registry.count("carol"), 1);
        assert_eq!(registry.count("dave"), 0);
        assert_eq!(registry.total(), 5);
    }

    #[test]
    fn clear_removes_entry() {
        let mut registry = UnreadRegistry::new();
        registry.increment("bob");
        assert!(registry.clear("bob"));
        assert!(!registry.has_entry("bob"));
        assert!(!registry.clear("bob"));
    }

    #[test]
    fn replace_all_overwrites_and_drops_zero_counts() {
        let mut registry = UnreadRegistry::new();
        registry.increment("stale");
        registry.replace_all(HashMap::from([
            ("bob".to_owned(), 3),
            ("carol".to_owned(), 0),
        ]));

        assert!(!registry.has_entry("stale"));
        assert!(!registry.has_entry("carol"));
        assert_eq!(registry.total(), 3);
    }

    #[test]
    fn summary_is_hidden_at_zero() {
        let mut registry = UnreadRegistry::new();
        assert!(!registry.summary().is_visible());
        assert_eq!(registry.summary().badge_text(), None);

        registry.increment("bob");
        registry.increment("bob");
        assert_eq!(registry.summary().badge_text().as_deref(), Some("2"));
    }
}
