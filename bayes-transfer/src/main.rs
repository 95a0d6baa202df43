use anyhow::Result;
use bayes_transfer::cli::{train, transfer, Cli, Commands};
use clap::Parser;

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train(args) => {
            train::run(args)?;
        }
        Commands::Transfer(args) => {
            transfer::run(args)?;
        }
    }

    Ok(())
}
