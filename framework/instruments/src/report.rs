mod summary_table;

use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;

use crate::quantile::QuantileAccumulator;

pub use summary_table::summary_table;

/// Latency statistics for one job, in whole microseconds.
///
/// Values are truncated, not rounded. Statistics of an empty run are reported as 0.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyReport {
    pub average: u64,
    /// `(probability, latency)` for every tracked probability, in ascending order.
    pub quantiles: Vec<(f64, u64)>,
    pub max: u64,
}

impl LatencyReport {
    pub fn from_accumulator(accumulator: &QuantileAccumulator) -> Self {
        // Float to integer casts saturate, so negative or NaN estimates become 0.
        let usec = |value: Option<f64>| value.unwrap_or_default() as u64;

        Self {
            average: usec(accumulator.mean()),
            quantiles: accumulator
                .probabilities()
                .iter()
                .map(|p| (*p, usec(accumulator.quantile(*p))))
                .collect(),
            max: usec(accumulator.max()),
        }
    }
}

/// The key a quantile is reported under, e.g. `p0.99`.
pub fn quantile_label(probability: f64) -> String {
    format!("p{probability}")
}

impl Serialize for LatencyReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.quantiles.len() + 2))?;
        map.serialize_entry("average", &self.average)?;
        for (probability, value) in &self.quantiles {
            map.serialize_entry(&quantile_label(*probability), value)?;
        }
        map.serialize_entry("max", &self.max)?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobReport {
    /// Completed calls.
    pub messages: u64,
    pub latencies: LatencyReport,
}

/// The results of every job on one shard, in the order the jobs were declared.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardReport {
    pub shard: usize,
    pub jobs: Vec<(String, JobReport)>,
}

impl ShardReport {
    pub fn new(shard: usize) -> Self {
        Self {
            shard,
            jobs: Vec::new(),
        }
    }

    pub fn push_job(&mut self, name: impl Into<String>, report: JobReport) {
        self.jobs.push((name.into(), report));
    }
}

impl Serialize for ShardReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.jobs.len() + 1))?;
        map.serialize_entry("shard", &self.shard)?;
        for (name, report) in &self.jobs {
            map.serialize_entry(name, report)?;
        }
        map.end()
    }
}

/// The document printed at the end of a run: one entry per shard.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct RunReport {
    pub shards: Vec<ShardReport>,
}

impl RunReport {
    /// A single YAML document, opened with an explicit `---` marker.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        Ok(format!("---\n{}", serde_yaml::to_string(self)?))
    }
}
