use tabled::settings::Style;
use tabled::{Table, Tabled};

use super::{quantile_label, RunReport};

#[derive(Tabled)]
struct JobRow {
    shard: usize,
    job: String,
    messages: u64,
    average_us: u64,
    quantiles_us: String,
    max_us: u64,
}

/// A human readable table of a run, one row per job per shard.
pub fn summary_table(report: &RunReport) -> String {
    let rows = report
        .shards
        .iter()
        .flat_map(|shard| {
            shard.jobs.iter().map(|(name, job)| JobRow {
                shard: shard.shard,
                job: name.clone(),
                messages: job.messages,
                average_us: job.latencies.average,
                quantiles_us: job
                    .latencies
                    .quantiles
                    .iter()
                    .map(|(p, value)| format!("{}={value}", quantile_label(*p)))
                    .collect::<Vec<_>>()
                    .join(" "),
                max_us: job.latencies.max,
            })
        })
        .collect::<Vec<_>>();

    let mut table = Table::new(&rows);
    table.with(Style::modern());
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{JobReport, LatencyReport, ShardReport};

    #[test]
    fn one_row_per_job() {
        let mut shard = ShardReport::new(2);
        shard.push_job(
            "echo1",
            JobReport {
                messages: 17,
                latencies: LatencyReport {
                    average: 40,
                    quantiles: vec![(0.5, 35), (0.99, 90)],
                    max: 120,
                },
            },
        );
        let table = summary_table(&RunReport {
            shards: vec![shard],
        });

        assert!(table.contains("average_us"));
        assert!(table.contains("echo1"));
        assert!(table.contains("p0.5=35 p0.99=90"));
        assert!(table.contains("120"));
    }
}
