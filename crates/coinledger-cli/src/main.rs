use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = coinledger_cli::Cli::parse();
    coinledger_cli::run_cli(cli)
}
