use clap::Parser;

use registry_transfer::cli::{self, Args};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = registry_transfer::logging::init(&args.log_options()) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = cli::run(args).await {
        tracing::error!("error: {:#}", e);
        std::process::exit(1);
    }
}
