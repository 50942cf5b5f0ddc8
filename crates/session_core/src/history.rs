//! Read-only mirror of the store-owned history for the signed-in identity.

use std::sync::Arc;

use shared::{domain::SessionRecord, stats::HistoryStats};

/// Tags snapshots with the subscription that produced them so pushes from a
/// torn-down feed can be told apart from the live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Snapshots are held behind an `Arc` so every published view shares them
/// instead of copying image payloads; stats are derived once per snapshot.
#[derive(Debug, Clone)]
pub struct HistoryProjection {
    subscription: Option<SubscriptionId>,
    records: Arc<[SessionRecord]>,
    stats: HistoryStats,
}

impl Default for HistoryProjection {
    fn default() -> Self {
        Self {
            subscription: None,
            records: Vec::new().into(),
            stats: HistoryStats::default(),
        }
    }
}

impl HistoryProjection {
    pub fn attach(&mut self, subscription: SubscriptionId) {
        self.subscription = Some(subscription);
        self.replace(Vec::new());
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    /// Replaces the projection wholesale. Returns false for snapshots that do
    /// not belong to the current subscription.
    pub fn apply(&mut self, subscription: SubscriptionId, records: Vec<SessionRecord>) -> bool {
        if self.subscription != Some(subscription) {
            return false;
        }
        self.replace(records);
        true
    }

    pub fn clear(&mut self) {
        self.subscription = None;
        self.replace(Vec::new());
    }

    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn shared(&self) -> Arc<[SessionRecord]> {
        Arc::clone(&self.records)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn recent(&self, window: usize) -> &[SessionRecord] {
        let start = self.records.len().saturating_sub(window);
        &self.records[start..]
    }

    pub fn stats(&self) -> HistoryStats {
        self.stats
    }

    fn replace(&mut self, records: Vec<SessionRecord>) {
        self.stats = HistoryStats::from_records(&records);
        self.records = records.into();
    }
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
