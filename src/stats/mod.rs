//! Statistical accumulators for daily flow totals
//!
//! Every observation folded in here is one day's total for a pair, not an
//! individual flow. The persisted form keeps only `(count, mean, std)`, so the
//! accumulator is rebuilt from that on every consolidation cycle.
//!
//! # Example
//!
//! ```
//! use pairflow::model::DailyPairTotal;
//! use pairflow::stats::PairAccumulator;
//!
//! let mut acc = PairAccumulator::new();
//! acc.observe(&DailyPairTotal::new(100, 10));
//!
//! let row = acc.to_row();
//! let mut acc = PairAccumulator::from_row(&row);
//! acc.observe(&DailyPairTotal::new(200, 30));
//!
//! assert_eq!(acc.to_row().count, 2);
//! assert_eq!(acc.to_row().avg_fwd_pkts, 20.0);
//! ```

mod accumulator;
mod moments;

pub use accumulator::PairAccumulator;
pub use moments::RunningMoments;
