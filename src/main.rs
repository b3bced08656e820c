use std::env;

use clap::Parser;
use planwise::api::{Cli, load_registry, run_cli, run_http_server};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::from("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();

    let raw_args: Vec<String> = env::args().collect();
    if raw_args.get(1).map(|s| s.as_str()) == Some("serve") {
        let port = raw_args
            .get(2)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(8080);
        let registry = match load_registry(None) {
            Ok(registry) => registry,
            Err(e) => {
                error!("Failed to load tax tables: {e}");
                std::process::exit(1);
            }
        };
        if let Err(e) = run_http_server(port, registry).await {
            error!("Server error: {e}");
            std::process::exit(1);
        }
        return;
    }

    let cli = Cli::parse();
    if let Err(e) = run_cli(cli) {
        error!("Error running projection: {e}");
        std::process::exit(1);
    }
}
