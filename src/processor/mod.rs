pub mod feature_processor;
pub mod engine;
pub mod features;
pub mod table;
pub(crate) mod flow;

pub use feature_processor::FeatureProcessor;
pub use engine::{SweepClock, SweepSettings};
pub use features::{extract, FeatureVector, FEATURE_COUNT, FEATURE_NAMES};
pub use flow::{
    DirectionStats, FlagCounts, FlowDirection, FlowKey, FlowRecord
};
pub use table::{FlowTable, TableCounters, TerminatedFlow};
