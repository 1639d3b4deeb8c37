use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::Context;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use rpc_tester_core::prelude::{
    current_scheduling_group, DelegatedShutdownListener, SchedulingGroup,
};
use rpc_tester_instruments::{JobReport, LatencyReport, QuantileAccumulator};
use rpc_tester_transport::{RpcClient, RpcError};

use crate::config::{ConfigError, JobConfig};
use crate::verb::RpcVerb;

/// A named unit of load generation that runs on one shard.
pub trait Job {
    fn name(&self) -> &str;

    fn scheduling_group(&self) -> &SchedulingGroup;

    /// Generate load until the job's duration has elapsed. Fails on the first failed call.
    fn run(&self) -> LocalBoxFuture<'_, anyhow::Result<()>>;

    /// The statistics collected so far. Before [Job::run] this describes an empty run.
    fn emit_result(&self) -> JobReport;
}

/// The remote call an `rpc` job issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCall {
    Echo,
}

impl RpcCall {
    fn from_verb(job: &str, verb: &str) -> Result<Self, ConfigError> {
        match verb {
            "echo" => Ok(Self::Echo),
            _ => Err(ConfigError::UnknownVerb {
                job: job.to_string(),
                verb: verb.to_string(),
            }),
        }
    }

    async fn invoke(&self, client: &RpcClient, loop_index: u64) -> Result<(), RpcError> {
        match self {
            Self::Echo => {
                client.call::<u64, u64>(RpcVerb::Echo, &loop_index).await?;
            }
        }
        Ok(())
    }
}

/// What a [JobConfig] describes, once its `type` has been resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSpec {
    Rpc { call: RpcCall, parallelism: usize },
}

impl JobSpec {
    pub fn from_config(config: &JobConfig) -> Result<Self, ConfigError> {
        match config.kind.as_str() {
            "rpc" => {
                let verb = config
                    .verb
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingField {
                        job: config.name.clone(),
                        field: "verb",
                    })?;
                let parallelism = config.parallelism.ok_or_else(|| ConfigError::MissingField {
                    job: config.name.clone(),
                    field: "parallelism",
                })?;
                if parallelism == 0 {
                    return Err(ConfigError::ZeroParallelism {
                        job: config.name.clone(),
                    });
                }

                Ok(Self::Rpc {
                    call: RpcCall::from_verb(&config.name, verb)?,
                    parallelism,
                })
            }
            kind => Err(ConfigError::UnknownJobType {
                job: config.name.clone(),
                kind: kind.to_string(),
            }),
        }
    }
}

/// Build the job described by `config`, issuing its calls on `client`.
///
/// The job also stops early once `shutdown_listener` is signalled.
pub fn make_job(
    config: &JobConfig,
    client: &RpcClient,
    shutdown_listener: DelegatedShutdownListener,
) -> Result<Box<dyn Job>, ConfigError> {
    match JobSpec::from_config(config)? {
        JobSpec::Rpc { call, parallelism } => Ok(Box::new(RpcJob {
            config: config.clone(),
            call,
            parallelism,
            client: client.clone(),
            shutdown_listener,
            latencies: Mutex::new(QuantileAccumulator::default()),
            total_messages: AtomicU64::new(0),
        })),
    }
}

/// Keeps `parallelism` calls in flight on one connection for the job's duration, timing each
/// round trip.
pub struct RpcJob {
    config: JobConfig,
    call: RpcCall,
    parallelism: usize,
    client: RpcClient,
    shutdown_listener: DelegatedShutdownListener,
    latencies: Mutex<QuantileAccumulator>,
    total_messages: AtomicU64,
}

impl RpcJob {
    async fn call_loop(&self, loop_index: u64, deadline: Instant) -> anyhow::Result<()> {
        loop {
            let started = Instant::now();
            self.call
                .invoke(&self.client, loop_index)
                .await
                .with_context(|| format!("Call failed in job {}", self.config.name))?;
            let latency = started.elapsed().as_micros() as f64;

            self.latencies.lock().observe(latency);
            self.total_messages.fetch_add(1, Ordering::Relaxed);

            if Instant::now() > deadline || self.shutdown_listener.should_shutdown() {
                break;
            }
        }

        log::trace!("Loop {} of job {} finished", loop_index, self.config.name);
        Ok(())
    }
}

impl Job for RpcJob {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn scheduling_group(&self) -> &SchedulingGroup {
        &self.config.scheduling_group
    }

    fn run(&self) -> LocalBoxFuture<'_, anyhow::Result<()>> {
        async move {
            let deadline = Instant::now() + self.config.duration;
            log::debug!(
                "Running job {} with {} loops for {:?} in scheduling group [{}]",
                self.config.name,
                self.parallelism,
                self.config.duration,
                current_scheduling_group().name()
            );

            let loops = (0..self.parallelism as u64)
                .map(|loop_index| self.call_loop(loop_index, deadline));
            futures::future::try_join_all(loops).await?;

            Ok(())
        }
        .boxed_local()
    }

    fn emit_result(&self) -> JobReport {
        JobReport {
            messages: self.total_messages.load(Ordering::Relaxed),
            latencies: LatencyReport::from_accumulator(&self.latencies.lock()),
        }
    }
}
