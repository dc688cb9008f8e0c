use std::process::ExitCode;

use clap::Parser;
use console::style;
use giftcache::cli::Cli;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // 0 = warn, 1 = info, 2 = debug, 3+ = trace; RUST_LOG still wins.
    let level = match cli.verbose {
        0 => "giftcache=warn",
        1 => "giftcache=info",
        2 => "giftcache=debug",
        _ => "giftcache=trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    match giftcache::cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", style("Error:").red().bold());
            ExitCode::FAILURE
        }
    }
}
