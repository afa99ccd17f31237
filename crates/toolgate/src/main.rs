//! toolgate - connect to MCP servers and call their tools.
//!
//! Loads a server file, registers every server with the connection manager,
//! waits for the connections to settle and then runs one command.

mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::ServerFile;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use toolgate_mcp::{
    ConnectionManager, MemoryTokenStore, ServerStatus, ServersTool, ToolRouter,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "toolgate")]
#[command(author, version, about = "Connect to MCP servers and call their tools", long_about = None)]
struct Cli {
    /// Server file (defaults to <config dir>/toolgate/servers.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Seconds to wait for servers to connect
    #[arg(long, default_value_t = 30, global = true)]
    wait: u64,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show every server and its status
    Servers,
    /// List every tool that can be called
    Tools,
    /// Call a tool by name (`mcp:<server>:<tool>` or a bare name)
    Call {
        /// Tool name
        name: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Print execution statistics after the call
        #[arg(long)]
        stats: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let path = cli.config.clone().unwrap_or_else(config::default_path);
    let file = ServerFile::load(&path)?;
    info!(path = %path.display(), servers = file.servers.len(), "Loaded server file");

    let manager = ConnectionManager::new(Arc::new(MemoryTokenStore::new()));
    connect_all(&manager, file, Duration::from_secs(cli.wait)).await?;

    let mut router = ToolRouter::new(manager.clone());
    router.register(Arc::new(ServersTool::new(manager.clone())));

    let result = run(&cli.command, &manager, &router).await;
    manager.shutdown().await;
    result
}

async fn run(command: &Commands, manager: &ConnectionManager, router: &ToolRouter) -> Result<()> {
    match command {
        Commands::Servers => {
            let mut reports = Vec::new();
            for summary in manager.list().await {
                reports.push(manager.get_status(&summary.id).await?);
            }
            print_json(&reports)?;
        }
        Commands::Tools => {
            print_json(&router.list_tools().await)?;
        }
        Commands::Call { name, args, stats } => {
            let args: serde_json::Value =
                serde_json::from_str(args).context("--args must be valid JSON")?;
            let result = router.execute(name, args).await?;
            print_json(&result)?;
            if *stats {
                print_json(&router.stats().await)?;
            }
        }
    }
    Ok(())
}

/// Register every server and wait until none is still connecting.
async fn connect_all(manager: &ConnectionManager, file: ServerFile, wait: Duration) -> Result<()> {
    let mut ids = Vec::new();
    for server in file.servers {
        let name = server.name.clone();
        let registration = manager
            .register(server)
            .await
            .with_context(|| format!("Failed to register {name}"))?;
        ids.push((name, registration.id));
    }

    for (name, id) in ids {
        let status = manager.wait_settled(&id, wait).await?;
        match status {
            ServerStatus::Active => info!(server = %name, "Connected"),
            ServerStatus::PendingAuth => {
                let report = manager.get_status(&id).await?;
                warn!(server = %name, "Authorization required");
                if let Some(url) = report.auth_url {
                    eprintln!("Open this URL to authorize {name}:\n  {url}");
                }
            }
            ServerStatus::Error => {
                let report = manager.get_status(&id).await?;
                warn!(
                    server = %name,
                    error = report.error.as_deref().unwrap_or("unknown"),
                    "Connection failed"
                );
            }
            ServerStatus::Connecting => warn!(server = %name, "Still connecting, giving up"),
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
