mod cli;
mod config;
mod context;
mod executor;
mod init;
mod job;
mod monitor;
mod progress;
mod run;
mod shutdown;
mod types;
mod verb;

pub mod prelude {
    pub use crate::cli::RpcTesterCli;
    pub use crate::config::{ConfigError, ConnectionConfig, JobConfig, RunConfig};
    pub use crate::context::ShardContext;
    pub use crate::init::init;
    pub use crate::job::{make_job, Job, JobSpec, RpcCall, RpcJob};
    pub use crate::run::run;
    pub use crate::types::RpcTesterResult;
    pub use crate::verb::RpcVerb;
}
