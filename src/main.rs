use clap::Parser;
use tracing_subscriber::EnvFilter;

use bothost::bootstrap::load_bothost_env;
use bothost::cli::Cli;

const DEFAULT_LOG_FILTER: &str = "bothost=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_bothost_env();
    init_tracing();

    Cli::parse().run().await
}

fn init_tracing() {
    // Fall back to the default filter if RUST_LOG is unset or invalid.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
