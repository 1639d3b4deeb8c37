use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(about, long_about = None)]
pub struct RpcTesterCli {
    /// Address to start the server on. The server is only started when this is set.
    #[clap(long)]
    pub listen: Option<String>,

    /// Address to connect the client to. Jobs are only run when this is set.
    #[clap(long)]
    pub connect: Option<String>,

    /// Port to listen on or connect to
    #[clap(long, default_value_t = 9123)]
    pub port: u16,

    /// Config file with the jobs to run and the connection options
    #[clap(long, default_value = "./conf.yaml")]
    pub conf: PathBuf,

    /// The number of seconds each job runs for
    #[clap(long, default_value_t = 30)]
    pub duration: u64,

    /// The number of shards to run, each with its own connection and its own copy of every job.
    ///
    /// Defaults to the number of available cores. Client and server must run the same number of
    /// shards for every client shard to be paired with its own server shard.
    #[clap(long)]
    pub shards: Option<usize>,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,

    /// Print a summary table of the results to stderr after the YAML report.
    #[clap(long, default_value = "false")]
    pub summary: bool,
}

impl RpcTesterCli {
    pub fn listen_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.listen
            .as_deref()
            .filter(|host| !host.is_empty())
            .map(|host| resolve(host, self.port))
            .transpose()
    }

    pub fn connect_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.connect
            .as_deref()
            .filter(|host| !host.is_empty())
            .map(|host| resolve(host, self.port))
            .transpose()
    }

    pub fn shard_count(&self) -> usize {
        self.shards
            .filter(|shards| *shards > 0)
            .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
            .unwrap_or(1)
    }
}

fn resolve(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve address {host}:{port}"))?
        .next()
        .with_context(|| format!("No address found for {host}:{port}"))
}
