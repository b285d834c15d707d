//! Aggregation round metrics
//!
//! Tracks per-round aggregation outcomes and long-run shift slot coverage,
//! so uneven training of the full-width model's slots is visible.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome of a single completed aggregation round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundMetrics {
    /// Round number
    pub round: u64,
    /// Number of participants folded
    pub num_participants: u32,
    /// Total contribution weight folded
    pub total_weight: f32,
    /// Shift indices trained this round, with multiplicity
    pub shifts_trained: Vec<usize>,
    /// Round duration in milliseconds
    pub duration_ms: u64,
    /// Timestamp when the round completed
    pub timestamp_ms: u64,
}

/// Long-run counter of how often each shift slot was trained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotCoverage {
    counts: HashMap<usize, u64>,
    total: u64,
}

impl SlotCoverage {
    /// Creates an empty coverage tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one training pass over a slot
    pub fn record(&mut self, slot: usize) {
        *self.counts.entry(slot).or_insert(0) += 1;
        self.total += 1;
    }

    /// Times the given slot was trained
    pub fn count(&self, slot: usize) -> u64 {
        self.counts.get(&slot).copied().unwrap_or(0)
    }

    /// Total training passes across all slots
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Fraction of all passes that hit the given slot
    pub fn fraction(&self, slot: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.count(slot) as f64 / self.total as f64
        }
    }

    /// Ratio of the least-trained to most-trained slot among slots seen so
    /// far, 1.0 meaning perfectly even coverage.
    pub fn balance(&self) -> f64 {
        let min = self.counts.values().copied().min().unwrap_or(0);
        let max = self.counts.values().copied().max().unwrap_or(0);
        if max == 0 {
            0.0
        } else {
            min as f64 / max as f64
        }
    }
}

/// Rolling history of aggregation rounds
pub struct RoundHistory {
    rounds: Vec<RoundMetrics>,
    coverage: SlotCoverage,
    max_history: usize,
}

impl RoundHistory {
    /// Creates a history keeping at most `max_history` rounds
    pub fn new(max_history: usize) -> Self {
        Self {
            rounds: Vec::new(),
            coverage: SlotCoverage::new(),
            max_history,
        }
    }

    /// Records a completed round
    pub fn record(&mut self, metrics: RoundMetrics) {
        for &shift in &metrics.shifts_trained {
            self.coverage.record(shift);
        }
        self.rounds.push(metrics);

        if self.rounds.len() > self.max_history {
            let to_remove = self.rounds.len() - self.max_history;
            self.rounds.drain(0..to_remove);
        }
    }

    /// Retained round history
    pub fn rounds(&self) -> &[RoundMetrics] {
        &self.rounds
    }

    /// Long-run slot coverage across all recorded rounds
    pub fn coverage(&self) -> &SlotCoverage {
        &self.coverage
    }

    /// Exports the history and coverage as JSON
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct HistoryExport<'a> {
            rounds: &'a [RoundMetrics],
            coverage: &'a SlotCoverage,
        }

        serde_json::to_string_pretty(&HistoryExport {
            rounds: &self.rounds,
            coverage: &self.coverage,
        })
    }
}

impl Default for RoundHistory {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Gets current timestamp in milliseconds
pub(crate) fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_metrics(round: u64, shifts: Vec<usize>) -> RoundMetrics {
        RoundMetrics {
            round,
            num_participants: shifts.len() as u32,
            total_weight: 1.0,
            shifts_trained: shifts,
            duration_ms: 5,
            timestamp_ms: round * 1000,
        }
    }

    #[test]
    fn test_slot_coverage_counts() {
        let mut coverage = SlotCoverage::new();
        coverage.record(0);
        coverage.record(0);
        coverage.record(1);

        assert_eq!(coverage.count(0), 2);
        assert_eq!(coverage.count(1), 1);
        assert_eq!(coverage.count(3), 0);
        assert_eq!(coverage.total(), 3);
        assert!((coverage.fraction(0) - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_coverage_balance() {
        let mut coverage = SlotCoverage::new();
        assert_eq!(coverage.balance(), 0.0);

        coverage.record(0);
        coverage.record(1);
        assert_eq!(coverage.balance(), 1.0);

        coverage.record(0);
        assert_eq!(coverage.balance(), 0.5);
    }

    #[test]
    fn test_history_prunes_but_keeps_coverage() {
        let mut history = RoundHistory::new(2);
        for round in 1..=5 {
            history.record(create_test_metrics(round, vec![0, 1]));
        }

        assert_eq!(history.rounds().len(), 2);
        assert_eq!(history.rounds()[0].round, 4);
        // Coverage spans all rounds, including pruned ones.
        assert_eq!(history.coverage().total(), 10);
    }

    #[test]
    fn test_export_json() {
        let mut history = RoundHistory::new(10);
        history.record(create_test_metrics(1, vec![0, 2]));

        let json = history.export_json().unwrap();
        assert!(json.contains("rounds"));
        assert!(json.contains("coverage"));
    }
}
