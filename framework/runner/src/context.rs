use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use rpc_tester_core::prelude::{DelegatedShutdownListener, FairShareExecutor, ShutdownHandle};
use rpc_tester_instruments::ShardReport;
use rpc_tester_transport::{
    ClientOptions, Incoming, RpcClient, RpcProtocol, RpcServer, ServerOptions,
};

use crate::config::RunConfig;
use crate::job::{make_job, Job, JobSpec};
use crate::verb::RpcVerb;

/// Everything one shard owns: the verb handlers, the server and client connections, and the jobs
/// that run over the client connection.
///
/// The lifecycle is [ShardContext::start], [ShardContext::run], [ShardContext::emit_result] and
/// finally [ShardContext::stop], which must run even if an earlier step failed.
pub struct ShardContext {
    shard: usize,
    server: Option<RpcServer>,
    client: Option<RpcClient>,
    jobs: Vec<Box<dyn Job>>,
    bye: ShutdownHandle,
    shutdown_listener: DelegatedShutdownListener,
}

impl ShardContext {
    /// Serve on `incoming` if it is set and connect to `connect` if it is set. Must be called
    /// from within the shard's runtime.
    pub async fn new(
        shard: usize,
        config: &RunConfig,
        incoming: Option<Incoming>,
        connect: Option<SocketAddr>,
        shutdown_listener: DelegatedShutdownListener,
    ) -> anyhow::Result<Self> {
        if connect.is_some() {
            for job in &config.jobs {
                JobSpec::from_config(job)?;
            }
        }

        let bye = ShutdownHandle::new();
        let protocol = Arc::new(shard_protocol(shard, bye.clone()));

        let server = incoming.map(|incoming| {
            RpcServer::start(
                protocol.clone(),
                ServerOptions {
                    tcp_nodelay: config.server.nodelay,
                    ..Default::default()
                },
                incoming,
            )
        });

        let mut context = Self {
            shard,
            server,
            client: None,
            jobs: Vec::new(),
            bye,
            shutdown_listener,
        };

        if let Some(addr) = connect {
            let client = match RpcClient::connect(
                addr,
                ClientOptions {
                    tcp_nodelay: config.client.nodelay,
                },
            )
            .await
            {
                Ok(client) => client,
                Err(e) => {
                    context.stop().await;
                    return Err(e)
                        .with_context(|| format!("Shard {shard} failed to connect to {addr}"));
                }
            };

            for job in &config.jobs {
                context.jobs.push(make_job(
                    job,
                    &client,
                    context.shutdown_listener.clone(),
                )?);
            }
            context.client = Some(client);
        }

        Ok(context)
    }

    /// Greet the server. Does nothing without a client connection.
    pub async fn start(&self) -> anyhow::Result<()> {
        if let Some(client) = &self.client {
            client
                .call::<(), ()>(RpcVerb::Hello, &())
                .await
                .with_context(|| {
                    format!("Shard {} HELLO to {} failed", self.shard, client.peer_addr())
                })?;
            log::debug!("Shard {} connected to {}", self.shard, client.peer_addr());
        }

        Ok(())
    }

    /// With a client connection, run every job to completion on a fair-share executor. Without
    /// one, serve until the client says BYE or the process is shut down.
    pub async fn run(&self) -> anyhow::Result<()> {
        if self.client.is_some() {
            let mut executor = FairShareExecutor::new();
            for job in &self.jobs {
                executor.spawn(job.scheduling_group(), job.run());
            }
            return executor.run().await;
        }

        if self.server.is_some() {
            let mut bye = self.bye.new_listener();
            let mut shutdown_listener = self.shutdown_listener.clone();
            tokio::select! {
                _ = bye.wait_for_shutdown() => {
                    log::debug!("Shard {} finished serving", self.shard);
                }
                _ = shutdown_listener.wait_for_shutdown() => {
                    log::info!("Shard {} stopped serving on shutdown", self.shard);
                }
            }
        }

        Ok(())
    }

    /// One entry per job, in the order the jobs were configured.
    pub fn emit_result(&self) -> ShardReport {
        let mut report = ShardReport::new(self.shard);
        for job in &self.jobs {
            report.push_job(job.name(), job.emit_result());
        }
        report
    }

    /// Say BYE to the server and close the connection, then stop serving. Failures are logged
    /// rather than returned.
    pub async fn stop(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.call::<(), ()>(RpcVerb::Bye, &()).await {
                log::warn!("Shard {} BYE to {} failed: {e}", self.shard, client.peer_addr());
            }
            client.stop().await;
        }

        if let Some(server) = self.server.take() {
            server.stop().await;
            log::debug!("Shard {} stopped its server", self.shard);
        }
    }
}

fn shard_protocol(shard: usize, bye: ShutdownHandle) -> RpcProtocol {
    let protocol = RpcProtocol::new();

    protocol.register_handler(RpcVerb::Hello, move |()| async move {
        log::info!("Shard {shard} got HELLO message from client");
    });
    protocol.register_handler(RpcVerb::Bye, move |()| {
        let bye = bye.clone();
        async move {
            log::info!("Shard {shard} got BYE message from client, exiting");
            bye.shutdown();
        }
    });
    protocol.register_handler(RpcVerb::Echo, |value: u64| async move { value });

    protocol
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::LocalBoxFuture;
    use futures::FutureExt;
    use rpc_tester_core::prelude::{current_scheduling_group, SchedulingGroup, SchedulingGroups};
    use rpc_tester_instruments::JobReport;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    fn echo_config(duration: Duration) -> RunConfig {
        RunConfig::from_yaml(
            "jobs:\n  - {name: echo1, type: rpc, verb: echo, parallelism: 4}\n  - {name: echo2, type: rpc, verb: echo, parallelism: 1}\n",
        )
        .unwrap()
        .with_duration(duration)
    }

    async fn server_context(
        config: &RunConfig,
        shutdown: &ShutdownHandle,
    ) -> (ShardContext, SocketAddr) {
        let incoming = Incoming::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = incoming.local_addr().unwrap();
        let context = ShardContext::new(0, config, Some(incoming), None, shutdown.new_listener())
            .await
            .unwrap();

        (context, addr)
    }

    #[tokio::test]
    async fn client_and_server_shards() {
        let _ = env_logger::builder().is_test(true).try_init();

        let config = echo_config(Duration::from_millis(200));
        let shutdown = ShutdownHandle::new();
        let (mut server, addr) = server_context(&config, &shutdown).await;
        let mut client = ShardContext::new(1, &config, None, Some(addr), shutdown.new_listener())
            .await
            .unwrap();

        let serving = async {
            server.start().await?;
            server.run().await
        };
        let testing = async {
            client.start().await?;
            client.run().await?;
            let report = client.emit_result();
            client.stop().await;
            Ok::<_, anyhow::Error>(report)
        };
        let (served, report) = tokio::join!(serving, testing);
        served.unwrap();
        let report = report.unwrap();

        assert_eq!(1, report.shard);
        let names = report.jobs.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>();
        assert_eq!(vec!["echo1", "echo2"], names);
        for (_, job) in &report.jobs {
            assert!(job.messages >= 1);
            assert!(job.latencies.max >= job.latencies.average);
        }

        // The server side has no jobs of its own.
        assert!(server.emit_result().jobs.is_empty());
        server.stop().await;
    }

    struct GroupRecordingJob {
        inner: Box<dyn Job>,
        seen: Rc<RefCell<Vec<(String, usize)>>>,
    }

    impl Job for GroupRecordingJob {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn scheduling_group(&self) -> &SchedulingGroup {
            self.inner.scheduling_group()
        }

        fn run(&self) -> LocalBoxFuture<'_, anyhow::Result<()>> {
            async move {
                self.seen
                    .borrow_mut()
                    .push((self.name().to_string(), current_scheduling_group().id()));
                self.inner.run().await
            }
            .boxed_local()
        }

        fn emit_result(&self) -> JobReport {
            self.inner.emit_result()
        }
    }

    #[tokio::test]
    async fn jobs_run_in_their_own_scheduling_group() {
        let mut config = echo_config(Duration::from_millis(100));
        config.jobs[1].shares = 400;
        let mut groups = SchedulingGroups::new();
        config.assign_scheduling_groups(&mut groups).unwrap();

        let shutdown = ShutdownHandle::new();
        let (mut server, addr) = server_context(&config, &shutdown).await;
        let mut client = ShardContext::new(1, &config, None, Some(addr), shutdown.new_listener())
            .await
            .unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        client.jobs = std::mem::take(&mut client.jobs)
            .into_iter()
            .map(|inner| {
                Box::new(GroupRecordingJob {
                    inner,
                    seen: seen.clone(),
                }) as Box<dyn Job>
            })
            .collect();

        let testing = async {
            client.start().await?;
            client.run().await?;
            client.stop().await;
            Ok::<_, anyhow::Error>(())
        };
        let (served, tested) = tokio::join!(server.run(), testing);
        served.unwrap();
        tested.unwrap();
        server.stop().await;

        let mut seen = seen.take();
        seen.sort();
        let echo1 = config.jobs[0].scheduling_group.id();
        let echo2 = config.jobs[1].scheduling_group.id();
        assert_ne!(echo1, echo2);
        assert_ne!(SchedulingGroup::default().id(), echo1);
        assert_eq!(
            vec![("echo1".to_string(), echo1), ("echo2".to_string(), echo2)],
            seen
        );
    }

    #[tokio::test]
    async fn server_serves_until_shutdown() {
        let config = RunConfig::default();
        let shutdown = ShutdownHandle::new();
        let (mut server, _) = server_context(&config, &shutdown).await;

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(5), server.run())
            .await
            .expect("server did not stop on shutdown")
            .unwrap();
        server.stop().await;
    }

    #[tokio::test]
    async fn without_connections_run_returns_immediately() {
        let config = echo_config(Duration::from_secs(3600));
        let mut context =
            ShardContext::new(0, &config, None, None, ShutdownHandle::new().new_listener())
                .await
                .unwrap();

        context.start().await.unwrap();
        context.run().await.unwrap();
        assert!(context.emit_result().jobs.is_empty());
        context.stop().await;
    }

    #[tokio::test]
    async fn invalid_job_fails_before_connecting() {
        let config = RunConfig::from_yaml(
            "jobs:\n  - {name: j, type: rpc, verb: teleport, parallelism: 1}\n",
        )
        .unwrap();
        // Nothing listens here, so any connection attempt would fail differently.
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();

        let shutdown = ShutdownHandle::new();
        let err = ShardContext::new(0, &config, None, Some(addr), shutdown.new_listener())
            .await
            .err()
            .unwrap();
        assert!(
            matches!(
                err.downcast_ref::<crate::config::ConfigError>(),
                Some(crate::config::ConfigError::UnknownVerb { .. })
            ),
            "{err:?}"
        );
    }
}
