mod cli;
mod config;
mod orchestrator;
mod text_summary;

use clap::Parser;
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    // logs go to stderr so solver output on stdout stays clean
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    let args = cli::Cli::parse();
    init_logging(args.verbose);

    match cli::run(args).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e:#}");
            if let Some(kind) = cli::failure_kind(&e) {
                eprintln!("{}", kind.remediation());
            }
            std::process::exit(1);
        }
    }
}
