//! # redstring-daemon
//!
//! Runs the Redstring workspace registry and serves the command bridge as
//! newline-delimited JSON on stdio. The host UI writes commands to stdin
//! and reads responses and status pushes from stdout.
//!
//! ## Credentials
//!
//! The remote tier is enabled when a GitHub token is present:
//!
//! - `REDSTRING_GITHUB_TOKEN`: OAuth token.
//! - `REDSTRING_GITHUB_APP_TOKEN` (+ optional RFC 3339
//!   `REDSTRING_GITHUB_APP_TOKEN_EXPIRES`): app-installation token.
//!
//! Without either, workspaces run on the local-file and cache tiers only.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use redstring_bridge::{serve_lines, BridgeServer};
use redstring_storage::{AuthContext, GitHubProvider, StaticCredentials, SystemClock};
use redstring_workspace::{RegistryConfig, WorkspaceRegistry};

/// Installation tokens live for an hour when no expiry is given.
const DEFAULT_APP_TOKEN_TTL_MINS: i64 = 60;

/// Redstring workspace registry daemon.
#[derive(Parser)]
#[command(name = "redstring-daemon", about = "Redstring workspace registry over stdio")]
struct Cli {
    /// State directory (workspace list, cache, relative local files).
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Config file (defaults to <state-dir>/redstring.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so they don't interfere with the bridge on stdout.
    let filter = EnvFilter::from_default_env()
        .add_directive("redstring_daemon=info".parse()?)
        .add_directive("redstring_workspace=info".parse()?)
        .add_directive("redstring_sync=info".parse()?)
        .add_directive("redstring_storage=info".parse()?)
        .add_directive("redstring_bridge=info".parse()?);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = load_config(&cli)?;
    tracing::info!("Starting Redstring daemon");
    tracing::info!("State dir: {}", config.state_dir.display());

    let mut builder = WorkspaceRegistry::builder(config.clone());
    let token = credentials(
        std::env::var("REDSTRING_GITHUB_TOKEN").ok(),
        std::env::var("REDSTRING_GITHUB_APP_TOKEN").ok(),
        std::env::var("REDSTRING_GITHUB_APP_TOKEN_EXPIRES").ok(),
        Utc::now(),
    )?;
    match token {
        Some(auth) => {
            tracing::info!(method = ?auth.method, "GitHub credentials found; remote tier enabled");
            let clock = SystemClock::shared();
            let provider = GitHubProvider::new(
                config.provider.clone(),
                Arc::new(StaticCredentials::new(auth).with_clock(clock.clone())),
                clock,
            )?;
            builder = builder.provider(Arc::new(provider));
        }
        None => tracing::info!("no GitHub credentials; remote tier disabled"),
    }

    let registry = Arc::new(builder.build()?);
    let server = Arc::new(BridgeServer::new(registry));

    tracing::info!("bridge ready, waiting for commands on stdin");
    serve_lines(server, tokio::io::stdin(), tokio::io::stdout())
        .await
        .inspect_err(|e| tracing::error!("serving error: {:?}", e))?;

    tracing::info!("Redstring daemon shutting down");
    Ok(())
}

fn load_config(cli: &Cli) -> Result<RegistryConfig> {
    let mut config = match &cli.config {
        Some(path) => RegistryConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => {
            let state_dir = cli
                .state_dir
                .clone()
                .unwrap_or_else(|| RegistryConfig::default().state_dir);
            RegistryConfig::load_or_default(&state_dir.join("redstring.toml"))
        }
    };
    if let Some(state_dir) = &cli.state_dir {
        config.state_dir = state_dir.clone();
    }
    Ok(config)
}

/// An OAuth token wins over an installation token.
fn credentials(
    oauth: Option<String>,
    app: Option<String>,
    app_expires: Option<String>,
    now: DateTime<Utc>,
) -> Result<Option<AuthContext>> {
    let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

    if let Some(token) = non_empty(oauth) {
        return Ok(Some(AuthContext::oauth(token.trim())));
    }
    let Some(token) = non_empty(app) else {
        return Ok(None);
    };
    let expires_at = match non_empty(app_expires) {
        Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .with_context(|| format!("invalid REDSTRING_GITHUB_APP_TOKEN_EXPIRES: {}", raw))?
            .with_timezone(&Utc),
        None => now + Duration::minutes(DEFAULT_APP_TOKEN_TTL_MINS),
    };
    Ok(Some(AuthContext::app_installation(token.trim(), expires_at)))
}
