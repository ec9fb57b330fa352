use std::path::PathBuf;

use clap::{Parser, Subcommand};
use memwarden::Config;
use memwarden_cli::commands::{CatalogCommand, PlanCommand, SimulateCommand};
use memwarden_cli::error::CliResult;
use memwarden_cli::output::OutputFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memwarden-cli")]
#[command(about = "Memwarden CLI - Inspect resource types and release plans")]
#[command(version)]
pub struct Cli {
    #[clap(long, short, global = true, help = "Output in JSON format")]
    pub json: bool,

    #[clap(long, short = 'c', global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[clap(about = "Show the resource type catalog")]
    Catalog(CatalogCommand),

    #[clap(about = "Rank a scenario's resources without releasing anything")]
    Plan(PlanCommand),

    #[clap(about = "Run a scenario through pressure and expiry releases")]
    Simulate(SimulateCommand),
}

fn main() {
    init_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,memwarden=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run() -> CliResult<()> {
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Command::Catalog(cmd) => cmd.execute(&config, format),
        Command::Plan(cmd) => cmd.execute(&config, format),
        Command::Simulate(cmd) => cmd.execute(&config, format),
    }
}
