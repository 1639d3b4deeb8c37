use anyhow::Context;
use rpc_tester_instruments::summary_table;
use rpc_tester_runner::prelude::*;

fn main() -> RpcTesterResult<()> {
    let cli = init();
    let summary = cli.summary;

    let report = run(cli)?;

    print!("{}", report.to_yaml().context("Failed to render the report")?);
    if summary {
        eprintln!("{}", summary_table(&report));
    }

    Ok(())
}
