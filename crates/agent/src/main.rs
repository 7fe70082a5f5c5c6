#![forbid(unsafe_code)]

mod cli;
mod commands;
mod shutdown;
mod startup;

use anyhow::Result;

use cli::Command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();

    match cli.command {
        Some(Command::Version) => {
            commands::cmd_version();
            Ok(())
        }

        Some(Command::Check) => commands::cmd_check(&cli),

        // No subcommand = run the agent daemon
        None => startup::run(&cli).await,
    }
}
