#[cfg(feature = "cli")]
use clap::Parser;
#[cfg(feature = "cli")]
use sqlpilot::{config::Config, run_server};

/// Serve the NL-to-SQL pipeline over HTTP.
#[cfg(feature = "cli")]
#[derive(Debug, Parser)]
#[command(name = "sqlpilot", version, about)]
struct Cli {
    /// Bind host, overriding API_HOST
    #[arg(long)]
    host: Option<String>,

    /// Bind port, overriding API_PORT
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database to query, overriding DATA_DB_PATH
    #[arg(long)]
    data_db: Option<std::path::PathBuf>,

    /// Feedback store file, overriding STORE_DB_PATH
    #[arg(long)]
    store_db: Option<std::path::PathBuf>,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut cfg = Config::from_env()?;
    if let Some(host) = cli.host {
        cfg.api_host = host;
    }
    if let Some(port) = cli.port {
        cfg.api_port = port;
    }
    if let Some(path) = cli.data_db {
        cfg.data_db_path = path;
    }
    if let Some(path) = cli.store_db {
        cfg.store_db_path = path;
    }

    run_server(cfg).await
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
