//! Latency statistics collected by jobs and the report printed at the end of a run.

mod quantile;
mod report;

pub use quantile::{ExtendedPSquare, QuantileAccumulator, DEFAULT_QUANTILES};
pub use report::{
    quantile_label, summary_table, JobReport, LatencyReport, RunReport, ShardReport,
};
