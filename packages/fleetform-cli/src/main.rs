//! Fleetform CLI entry point.

mod cli;
mod commands;

use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt().with_env_filter("debug").init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }

    match commands::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!("{err:#}");
            std::process::exit(1);
        }
    }
}
