use crate::cli::RpcTesterCli;
use clap::Parser;

/// Initialise the CLI and logging for the RPC tester.
pub fn init() -> RpcTesterCli {
    env_logger::init();

    RpcTesterCli::parse()
}
