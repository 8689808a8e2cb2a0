mod cli;
mod error;
mod launcher;
mod logging;
mod model;
#[cfg(feature = "tui")]
mod orchestrator;
mod params;
#[cfg(feature = "tui")]
mod tui;

use anyhow::Result;
use clap::Parser;

// One thread: the UI loop, the controller and the output relay take turns.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let is_non_tui = args.json || args.text || args.list_parameter_files;

    cli::run(args).await?;

    // Headless modes exit right away even if an abandoned elastix relay is still parked on the runtime.
    if is_non_tui {
        std::process::exit(0);
    }
    Ok(())
}
