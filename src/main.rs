use anyhow::Result;
use clap::Parser;

mod cli;
mod utils;

use cli::Cli;
use origami::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    tracing::debug!(args = ?std::env::args().collect::<Vec<String>>(), "origami starting");

    match cli.run().await {
        Ok(()) => Ok(()),
        Err(e) => {
            utils::print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}
