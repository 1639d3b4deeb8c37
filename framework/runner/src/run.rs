use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rpc_tester_core::prelude::{SchedulingGroups, ShutdownHandle};
use rpc_tester_instruments::{RunReport, ShardReport};
use rpc_tester_transport::{ConnectionDistributor, Incoming};

use crate::cli::RpcTesterCli;
use crate::config::RunConfig;
use crate::context::ShardContext;
use crate::executor::Executor;
use crate::monitor::start_monitor;
use crate::progress::start_progress;
use crate::shutdown::start_shutdown_listener;

/// Run the tester as described by the command line and return the combined report of every
/// shard.
///
/// Fails if any shard fails, or, when connecting, if the jobs are invalid. Jobs are checked
/// before any connection is made.
/// Every shard still stops cleanly before a shard failure is returned.
pub fn run(cli: RpcTesterCli) -> anyhow::Result<RunReport> {
    let listen = cli.listen_addr()?;
    let connect = cli.connect_addr()?;
    let shards = cli.shard_count();
    let duration = Duration::from_secs(cli.duration);

    let mut config = RunConfig::load(&cli.conf)
        .with_context(|| format!("Failed to load config from {}", cli.conf.display()))?
        .with_duration(duration);
    // Jobs only run over a client connection, a server alone never builds them.
    if connect.is_some() {
        config.validate()?;

        let mut groups = SchedulingGroups::new();
        config.assign_scheduling_groups(&mut groups)?;
    }
    let config = Arc::new(config);

    log::info!(
        "Starting {} shards with {} jobs (listen: {:?}, connect: {:?})",
        shards,
        config.jobs.len(),
        listen,
        connect
    );

    // Runs the Ctrl-C listener and the connection acceptor, off the shards' threads.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("acceptor")
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;
    let shutdown_handle = start_shutdown_listener(&runtime);
    // Signalled once every shard has finished.
    let finished = ShutdownHandle::new();

    let mut incoming: Vec<Option<Incoming>> = (0..shards).map(|_| None).collect();
    let mut acceptor = None;
    if let Some(addr) = listen {
        let (distributor, shard_incoming) = ConnectionDistributor::bind(addr, shards)
            .with_context(|| format!("Failed to listen on {addr}"))?;
        log::info!("Listening on {}", distributor.local_addr()?);
        incoming = shard_incoming.into_iter().map(Some).collect();
        acceptor = Some(runtime.spawn(distributor.run(finished.new_listener())));
    }

    if connect.is_some() && !cli.no_progress {
        start_progress(duration, finished.new_listener())?;
    }
    start_monitor(finished.new_listener())?;

    let mut handles = Vec::with_capacity(shards);
    for (shard, incoming) in incoming.into_iter().enumerate() {
        let config = config.clone();
        let shard_shutdown_handle = shutdown_handle.clone();
        let handle = std::thread::Builder::new()
            .name(format!("shard-{shard}"))
            .spawn(move || run_shard(shard, &config, incoming, connect, shard_shutdown_handle));

        match handle {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // Let the shards that did start wind down before giving up.
                shutdown_handle.shutdown();
                for handle in handles {
                    let _ = handle.join();
                }
                finished.shutdown();
                return Err(e)
                    .with_context(|| format!("Failed to spawn thread for shard {shard}"));
            }
        }
    }

    let mut reports = Vec::with_capacity(shards);
    let mut failed = 0;
    for (shard, handle) in handles.into_iter().enumerate() {
        match handle.join() {
            Ok(Ok(report)) => reports.push(report),
            Ok(Err(e)) => {
                log::error!("Shard {shard} failed: {e:?}");
                failed += 1;
            }
            Err(_) => {
                log::error!("Shard {shard} panicked");
                failed += 1;
            }
        }
    }

    finished.shutdown();
    if let Some(acceptor) = acceptor {
        runtime
            .block_on(acceptor)
            .context("Connection acceptor panicked")?
            .context("Connection acceptor failed")?;
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {shards} shards failed");
    }

    Ok(RunReport { shards: reports })
}

/// The whole life of one shard, on its own thread and runtime.
fn run_shard(
    shard: usize,
    config: &RunConfig,
    incoming: Option<Incoming>,
    connect: Option<SocketAddr>,
    shutdown_handle: ShutdownHandle,
) -> anyhow::Result<ShardReport> {
    let executor = Executor::new(shard, shutdown_handle.clone())?;

    let mut context = executor.execute_in_place(ShardContext::new(
        shard,
        config,
        incoming,
        connect,
        shutdown_handle.new_listener(),
    ))?;
    log::debug!("Shard {shard} started");

    let outcome = executor
        .execute_in_place(context.start())
        .and_then(|()| executor.block_on(context.run()));
    let report = context.emit_result();

    executor.block_on(context.stop());
    log::debug!("Shard {shard} stopped");

    outcome.map(|()| report)
}
