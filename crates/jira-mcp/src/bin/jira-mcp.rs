//! jira-mcp - MCP stdio server for Jira tickets and attachments
//!
//! Launched by an MCP client. stdout carries the protocol, so all logging
//! goes to stderr and optionally to a daily-rotated file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use jira_mcp::{JiraToolHandler, McpServer};
use jira_mcp_core::config::default_attachments_root;
use jira_mcp_core::{Config, EventLog, JiraService};

#[derive(Debug, Parser)]
#[command(name = "jira-mcp", version, about = "MCP server for Jira tickets and attachments")]
struct Cli {
    /// Print the resolved attachment directory and configuration, then exit
    #[arg(long)]
    print_paths: bool,

    /// Load environment variables from this file instead of ./.env
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("JIRA_MCP_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" | "critical" => "error".to_string(),
            "warning" => "warn".to_string(),
            other => other.to_ascii_lowercase(),
        }
    } else {
        "warn".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

/// The returned guard flushes the file writer on drop
fn init_logging() -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match std::env::var_os("JIRA_MCP_LOG_DIR") {
        Some(dir) => {
            let dir = PathBuf::from(dir);
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(&dir, "jira-mcp.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn print_paths() {
    println!("Jira MCP path information");
    println!("-------------------------");
    match std::env::current_dir() {
        Ok(cwd) => println!("Current working directory: {}", cwd.display()),
        Err(e) => println!("Current working directory: unavailable ({e})"),
    }

    match Config::from_env() {
        Ok(config) => {
            println!("Attachments directory: {}", config.attachments.root.display());
            for instance in config.instances() {
                let prefixes = if instance.prefixes.is_empty() {
                    "default route".to_string()
                } else {
                    instance.prefixes.join(", ")
                };
                println!(
                    "Jira instance '{}': {} ({}; {})",
                    instance.label,
                    instance.host,
                    instance.credential.scheme(),
                    prefixes
                );
            }
            println!("Ollama: {} (model {})", config.ollama.base_url, config.ollama.model);
        }
        Err(e) => {
            let root = std::env::var_os("MCP_ATTACHMENTS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_attachments_root);
            println!("Attachments directory: {}", root.display());
            println!("Configuration is incomplete: {e}");
        }
    }

    match std::env::var("MCP_ATTACHMENTS_PATH") {
        Ok(v) => println!("MCP_ATTACHMENTS_PATH: set to {v}"),
        Err(_) => println!("MCP_ATTACHMENTS_PATH: not set"),
    }
    println!("\nTo use a custom directory: export MCP_ATTACHMENTS_PATH=/your/custom/path");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    if cli.print_paths {
        print_paths();
        return Ok(());
    }

    let _log_guard = init_logging()?;

    let config = Config::from_env().context("Invalid configuration")?;
    config.log_summary();

    let service = JiraService::from_config(&config, Arc::new(EventLog::new()))
        .await
        .context("Failed to initialize Jira service")?;
    if !service.completion_available().await {
        warn!(
            url = %config.ollama.base_url,
            "Ollama is not reachable; summarize and analyze tools will fail until it is"
        );
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting jira-mcp");
    McpServer::new(JiraToolHandler::new(Arc::new(service)))
        .run()
        .await
}
