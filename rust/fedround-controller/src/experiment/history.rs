//! The history of the completed rounds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use fedround_core::{model::Parameters, NodeId, RoundNumber};

use crate::state_machine::round::{CompletedRound, ReplySummary};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// The record of a completed round.
pub struct RoundRecord {
    pub round_number: RoundNumber,
    /// The global parameters resulting from the round.
    pub params: Parameters,
    /// The reply summaries of the participants.
    pub participants: BTreeMap<NodeId, ReplySummary>,
    pub completed_at: DateTime<Utc>,
}

impl RoundRecord {
    pub fn new(round: &CompletedRound) -> Self {
        Self {
            round_number: round.round_number,
            params: round.aggregated.global.clone(),
            participants: round.participants.clone(),
            completed_at: Utc::now(),
        }
    }

    /// Gets the total number of samples the participants trained on, saturating at `u64::MAX`.
    pub fn sample_count(&self) -> u64 {
        self.participants
            .values()
            .fold(0, |total: u64, summary| total.saturating_add(summary.sample_count))
    }
}

#[cfg(test)]
mod tests {
    use fedround_core::{message::Timing, testutils};

    use super::*;

    fn summary(sample_count: u64) -> ReplySummary {
        ReplySummary {
            sample_count,
            timing: Timing::default(),
            rtime_total: 0.,
            metrics: Default::default(),
        }
    }

    fn record(counts: &[u64]) -> RoundRecord {
        RoundRecord {
            round_number: 0,
            params: testutils::parameters(0.),
            participants: counts
                .iter()
                .enumerate()
                .map(|(i, count)| (NodeId::new(format!("node-{}", i)), summary(*count)))
                .collect(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_sample_count() {
        assert_eq!(record(&[]).sample_count(), 0);
        assert_eq!(record(&[10, 20, 30]).sample_count(), 60);
    }

    #[test]
    fn test_sample_count_saturates() {
        assert_eq!(record(&[u64::MAX, 1]).sample_count(), u64::MAX);
    }
}
