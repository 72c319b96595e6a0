mod cli;
mod commands;
mod idmapper;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

fn main() {
    let cli = Cli::parse();

    let filter = if cli.global.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let result = match &cli.command {
        Commands::InitStore(args) => commands::init_store::execute(args, &cli.global),
        Commands::Create(args) => commands::create::execute(args, &cli.global),
        Commands::Delete(args) => commands::delete::execute(args, &cli.global),
        Commands::Clean(args) => commands::clean::execute(args, &cli.global),
        Commands::List(args) => commands::list::execute(args, &cli.global),
        Commands::Stats(args) => commands::stats::execute(args, &cli.global),
    };

    if let Err(e) = result {
        eprintln!("strata: {:#}", e);
        std::process::exit(1);
    }
}
