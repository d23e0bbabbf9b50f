mod api;
mod cli;
mod error;
mod model;
mod run;
mod text_summary;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::run(args).await
}
