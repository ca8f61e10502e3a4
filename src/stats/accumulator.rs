//! Per-pair accumulator over daily totals

use super::RunningMoments;
use crate::model::DailyPairTotal;
use crate::table::PairSummaryRow;

/// Running statistics of one communicating pair
///
/// Each observation is one [`DailyPairTotal`]; the duration and packet streams
/// are tracked separately but always advance together, so they share the
/// sample count.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PairAccumulator {
    duration: RunningMoments,
    packets: RunningMoments,
}

impl PairAccumulator {
    /// Create an accumulator with no observations
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstruct from a persisted row
    pub fn from_row(row: &PairSummaryRow) -> Self {
        Self {
            duration: RunningMoments::from_summary(
                row.count,
                row.avg_flow_duration,
                row.std_flow_duration,
            ),
            packets: RunningMoments::from_summary(row.count, row.avg_fwd_pkts, row.std_fwd_pkts),
        }
    }

    /// Serialize into a persisted row
    pub fn to_row(&self) -> PairSummaryRow {
        let (avg_flow_duration, std_flow_duration) = self.duration.to_summary();
        let (avg_fwd_pkts, std_fwd_pkts) = self.packets.to_summary();
        PairSummaryRow {
            count: self.count(),
            avg_flow_duration,
            std_flow_duration,
            avg_fwd_pkts,
            std_fwd_pkts,
        }
    }

    /// Fold one day's totals in
    pub fn observe(&mut self, total: &DailyPairTotal) {
        self.duration.add(total.total_flow_duration as f64);
        self.packets.add(total.total_fwd_packets as f64);
    }

    /// Combine with another accumulator for the same pair
    pub fn merge(&mut self, other: &Self) {
        self.duration.merge(&other.duration);
        self.packets.merge(&other.packets);
    }

    /// Number of days observed
    pub fn count(&self) -> u64 {
        self.duration.len()
    }

    /// Flow-duration moments
    pub fn duration(&self) -> &RunningMoments {
        &self.duration
    }

    /// Forward-packet moments
    pub fn packets(&self) -> &RunningMoments {
        &self.packets
    }
}
