use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use bitk::config::Config;
use bitk::server::{start_server, ServerOptions};

#[derive(Parser)]
#[command(name = "bitk")]
#[command(version, about = "Local issue tracker that drives AI coding CLIs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "4400")]
        port: u16,

        /// Database path (overrides DB_PATH)
        #[arg(long)]
        db_path: Option<std::path::PathBuf>,

        /// Dev mode: bind all interfaces and allow CORS for a local UI
        /// dev server
        #[arg(long)]
        dev: bool,
    },
    /// Delete the database and its WAL/SHM/journal siblings
    #[command(name = "db:reset")]
    DbReset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::from_env();

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            if let Some(db_path) = db_path {
                config.db_path = db_path;
            }
            start_server(
                config,
                ServerOptions {
                    port,
                    dev_mode: dev,
                },
            )
            .await
        }
        Commands::DbReset => db_reset(&config),
    }
}

/// Remove the database and whatever sidecar files SQLite left behind,
/// reporting what happened as JSON.
fn db_reset(config: &Config) -> Result<()> {
    let mut targets = vec![config.db_path.clone()];
    targets.extend(config.db_sidecar_paths());

    let mut deleted = Vec::new();
    let mut missing = Vec::new();
    for path in targets {
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to delete {}", path.display()))?;
            deleted.push(path.display().to_string());
        } else {
            missing.push(path.display().to_string());
        }
    }

    let report = serde_json::json!({
        "deleted": deleted,
        "missing": missing,
        "timestamp": bitk::models::now_iso(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
