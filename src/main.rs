//! Stacksmith CLI — stack lifecycle engine.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "stacksmith",
    version,
    about = "Stack lifecycle engine — dependency-ordered component deploys with a persisted state manifest"
)]
struct Cli {
    #[command(subcommand)]
    command: stacksmith::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = stacksmith::cli::dispatch(cli.command) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
