mod commands;
mod logger;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;

/// Run job-graph pipelines locally
#[derive(Parser, Debug)]
#[command(name = "pipeline", version, about)]
struct Cli {
    /// Show engine diagnostics (repeat for debug output)
    #[arg(long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a pipeline
    Run(commands::run::RunArgs),
    /// Check a pipeline definition without running it
    Validate(commands::validate::ValidateArgs),
    /// Show the job instances a run would schedule
    Plan(commands::plan::PlanArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    logger::init(cli.verbose);

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
        Command::Plan(args) => commands::plan::execute(args),
    }
}
