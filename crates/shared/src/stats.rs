use serde::Serialize;

use crate::domain::SessionRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HistoryStats {
    pub total_sessions: usize,
    pub average_score: u8,
    pub best_score: u8,
    pub total_seconds: u64,
}

impl HistoryStats {
    pub fn from_records(records: &[SessionRecord]) -> Self {
        if records.is_empty() {
            return Self::default();
        }

        let total: u64 = records.iter().map(|r| u64::from(r.score.value())).sum();
        let count = records.len() as u64;
        // round half up, matching how scores are shown as whole percentages
        let average = (total * 2 + count) / (count * 2);
        Self {
            total_sessions: records.len(),
            average_score: average as u8,
            best_score: records
                .iter()
                .map(|r| r.score.value())
                .max()
                .unwrap_or_default(),
            total_seconds: records.iter().map(|r| r.duration_seconds).sum(),
        }
    }

    pub fn formatted_total_time(&self) -> String {
        format_duration(self.total_seconds)
    }
}

pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    format!("{hours}h {minutes}m")
}

#[cfg(test)]
#[path = "tests/stats_tests.rs"]
mod tests;
