//! CLI entry point for LedgerLink.
//!
//! The `ledgerlink` command connects and disconnects providers, keeps
//! their tokens fresh, issues authenticated API calls, and inspects sync
//! checkpoints.

mod app;
mod config;

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ledgerlink_auth_engine::Provider;
use ledgerlink_client::RequestOptions;
use ledgerlink_store::SyncCheckpointManager;
use reqwest::Method;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::config::Config;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// LedgerLink: OAuth connections to accounting and expense providers.
#[derive(Parser)]
#[command(
    name = "ledgerlink",
    version,
    about = "LedgerLink: provider connections, token refresh and sync checkpoints"
)]
struct Cli {
    /// Configuration file (defaults to config/ledgerlink.toml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the OAuth flow and print the authorization URL.
    Connect {
        #[arg(value_parser = parse_provider)]
        provider: Provider,
    },

    /// Complete the OAuth flow with the parameters from the redirect.
    Callback {
        #[arg(value_parser = parse_provider)]
        provider: Provider,
        #[arg(long)]
        code: String,
        #[arg(long)]
        state: String,
        /// Extra redirect parameters, e.g. `--param realmId=123`.
        #[arg(long = "param", value_parser = parse_key_value)]
        params: Vec<(String, String)>,
    },

    /// Revoke and forget a provider's tokens.
    Disconnect {
        #[arg(value_parser = parse_provider)]
        provider: Provider,
    },

    /// Show the connection status of every stored credential.
    Status,

    /// Refresh one provider now, or run a single refresh sweep.
    Refresh {
        #[arg(value_parser = parse_provider)]
        provider: Option<Provider>,
    },

    /// Run the background refresh scheduler until interrupted.
    Daemon,

    /// Call a provider API with managed tokens and retries.
    Request {
        #[arg(value_parser = parse_provider)]
        provider: Provider,
        /// HTTP method (GET, POST, PUT, PATCH, DELETE).
        #[arg(value_parser = parse_method)]
        method: Method,
        /// Path relative to the provider API base.
        endpoint: String,
        /// JSON request body.
        #[arg(long)]
        body: Option<String>,
        #[arg(long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,
    },

    /// Show recent audit events.
    Audit {
        #[arg(long, value_parser = parse_provider)]
        provider: Option<Provider>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Inspect and manage sync checkpoints.
    Sync {
        #[command(subcommand)]
        command: SyncCommands,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Progress of one checkpoint.
    Progress { checkpoint_id: String },

    /// Pause a running sync before its next batch.
    Pause { checkpoint_id: String },

    /// Resume a paused or failed sync and print its cursor.
    Resume { checkpoint_id: String },

    /// Delete old completed checkpoints, keeping the newest ones.
    Cleanup {
        integration: String,
        sync_type: String,
        #[arg(long, default_value_t = 10)]
        keep: usize,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _ = dotenvy::dotenv();
    init_tracing("info", cli.json);

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Sync { command } => cmd_sync(&config, command).await,
        Commands::Connect { provider } => cmd_connect(&App::open(config).await?, provider).await,
        Commands::Callback {
            provider,
            code,
            state,
            params,
        } => cmd_callback(&App::open(config).await?, provider, &code, &state, params).await,
        Commands::Disconnect { provider } => {
            cmd_disconnect(&App::open(config).await?, provider).await
        }
        Commands::Status => cmd_status(&App::open(config).await?).await,
        Commands::Refresh { provider } => cmd_refresh(&App::open(config).await?, provider).await,
        Commands::Daemon => cmd_daemon(&App::open(config).await?).await,
        Commands::Request {
            provider,
            method,
            endpoint,
            body,
            query,
        } => {
            cmd_request(
                &App::open(config).await?,
                provider,
                method,
                &endpoint,
                body,
                query,
            )
            .await
        }
        Commands::Audit { provider, limit } => {
            cmd_audit(&App::open(config).await?, provider, limit).await
        }
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` wins over `default_level`.
fn init_tracing(default_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

// ---------------------------------------------------------------------------
// OAuth flow
// ---------------------------------------------------------------------------

async fn cmd_connect(app: &App, provider: Provider) -> Result<()> {
    let request = app
        .flow()
        .initiate(provider)
        .await
        .with_context(|| format!("failed to start {provider} authorization"))?;

    println!("Open this URL to authorize {provider}:");
    println!();
    println!("  {}", request.auth_url);
    println!();
    println!("State expires at {}.", request.expires_at.to_rfc3339());
    Ok(())
}

async fn cmd_callback(
    app: &App,
    provider: Provider,
    code: &str,
    state: &str,
    params: Vec<(String, String)>,
) -> Result<()> {
    let extras: serde_json::Map<String, serde_json::Value> = params
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();

    let tokens = app
        .flow()
        .handle_callback(provider, code, state, &extras)
        .await
        .with_context(|| format!("failed to complete {provider} authorization"))?;

    info!(provider = %provider, "provider connected");
    println!("{provider} connected.");
    match tokens.expires_at {
        Some(expires_at) => println!("Access token expires at {}.", expires_at.to_rfc3339()),
        None => println!("Access token has no expiry."),
    }
    Ok(())
}

async fn cmd_disconnect(app: &App, provider: Provider) -> Result<()> {
    app.flow()
        .disconnect(provider)
        .await
        .with_context(|| format!("failed to disconnect {provider}"))?;
    println!("{provider} disconnected.");
    Ok(())
}

// ---------------------------------------------------------------------------
// Status and audit
// ---------------------------------------------------------------------------

async fn cmd_status(app: &App) -> Result<()> {
    let statuses = app
        .credentials
        .list_statuses()
        .await
        .context("failed to read credentials")?;

    let registered = app.registry.providers();
    println!(
        "Configured providers: {}",
        if registered.is_empty() {
            "none".to_string()
        } else {
            registered
                .iter()
                .map(Provider::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        }
    );
    println!();

    if statuses.is_empty() {
        println!("No stored credentials.");
        return Ok(());
    }

    println!("{:<12} {:<14} {:<27} ERROR", "PROVIDER", "STATUS", "EXPIRES");
    for summary in statuses {
        let expires = summary
            .expires_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<12} {:<14} {:<27} {}",
            summary.provider,
            summary.status.as_str(),
            expires,
            summary.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_audit(app: &App, provider: Option<Provider>, limit: usize) -> Result<()> {
    let entries = app
        .audit
        .query_recent(provider.as_ref().map(Provider::as_str), limit)
        .await
        .context("failed to read audit log")?;

    for entry in entries {
        println!(
            "{}  {:<12} {:<26} {}",
            entry.timestamp.to_rfc3339(),
            entry.provider,
            entry.action.as_str(),
            entry.detail.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

async fn cmd_refresh(app: &App, provider: Option<Provider>) -> Result<()> {
    match provider {
        Some(provider) => {
            app.refresher
                .refresh_provider_tokens(provider)
                .await
                .with_context(|| format!("failed to refresh {provider} tokens"))?;
            println!("{provider} tokens refreshed.");
        }
        None => {
            let report = app
                .scheduler()
                .sweep_once()
                .await
                .context("refresh sweep failed")?;
            println!(
                "Checked {}, refreshed {}, failed {}.",
                report.checked, report.refreshed, report.failed
            );
        }
    }
    Ok(())
}

async fn cmd_daemon(app: &App) -> Result<()> {
    let scheduler = app.scheduler();
    scheduler.start().context("failed to start refresh scheduler")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("shutdown requested");
    scheduler.stop().await;
    Ok(())
}

// ---------------------------------------------------------------------------
// API requests
// ---------------------------------------------------------------------------

async fn cmd_request(
    app: &App,
    provider: Provider,
    method: Method,
    endpoint: &str,
    body: Option<String>,
    query: Vec<(String, String)>,
) -> Result<()> {
    let client = app.api_client(provider).await?;

    let mut options = RequestOptions::new(method);
    if let Some(body) = body {
        let json: serde_json::Value =
            serde_json::from_str(&body).context("--body is not valid JSON")?;
        options = options.json(json);
    }
    for (key, value) in query {
        options = options.query(key, value);
    }

    let response = client.request(endpoint, options).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.success {
        bail!(
            "request failed after {} attempt(s)",
            response.meta.attempts
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sync checkpoints
// ---------------------------------------------------------------------------

async fn cmd_sync(config: &Config, command: SyncCommands) -> Result<()> {
    let checkpoints = SyncCheckpointManager::new(app::open_database(config).await?);

    match command {
        SyncCommands::Progress { checkpoint_id } => {
            let progress = checkpoints
                .get_progress(&checkpoint_id)
                .await
                .with_context(|| format!("failed to read checkpoint {checkpoint_id}"))?;
            println!("{}", serde_json::to_string_pretty(&progress)?);
        }
        SyncCommands::Pause { checkpoint_id } => {
            checkpoints
                .pause(&checkpoint_id)
                .await
                .with_context(|| format!("failed to pause checkpoint {checkpoint_id}"))?;
            println!("Checkpoint {checkpoint_id} paused.");
        }
        SyncCommands::Resume { checkpoint_id } => {
            let cursor = checkpoints
                .resume(&checkpoint_id)
                .await
                .with_context(|| format!("failed to resume checkpoint {checkpoint_id}"))?;
            println!(
                "Checkpoint {checkpoint_id} resumed from {}.",
                cursor.as_deref().unwrap_or("the beginning")
            );
        }
        SyncCommands::Cleanup {
            integration,
            sync_type,
            keep,
        } => {
            let deleted = checkpoints
                .cleanup_old(&integration, &sync_type, keep)
                .await
                .context("failed to clean up checkpoints")?;
            println!("Deleted {deleted} checkpoint(s).");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Argument parsing
// ---------------------------------------------------------------------------

fn parse_provider(s: &str) -> std::result::Result<Provider, String> {
    Provider::from_str(&s.to_ascii_lowercase()).map_err(|e| e.to_string())
}

fn parse_method(s: &str) -> std::result::Result<Method, String> {
    Method::from_str(&s.to_ascii_uppercase()).map_err(|e| e.to_string())
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{s}`")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
