use clap::Parser;
use tracing_subscriber::EnvFilter;

use odoo_mcp::config::{Cli, Settings};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let settings = match Settings::load(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    // Logs go to stderr so the stdio transport keeps stdout clean.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let parts = match odoo_mcp::server::bootstrap(&settings).await {
        Ok(parts) => parts,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = odoo_mcp::server::serve(&settings, parts).await {
        tracing::error!(error = %e, "server failed");
        std::process::exit(1);
    }
}
