//! Intel collector entrypoint.
//!
//! Runs the ingestion server against the in-memory store. Production
//! deployments swap in a relational [`intel_server::store::Store`]
//! implementation behind the same façade.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use intel_server::api::{create_router, ApiState};
use intel_server::report::GitAuthProvider;
use intel_server::store::mem::MemStore;
use rand::distributions::{Alphanumeric, DistString};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "intel-server")]
#[command(author, version, about = "Intel collector - invocation telemetry ingestion")]
struct Cli {
    /// Address to bind the HTTP listener on.
    #[arg(long, env = "INTEL_SERVER_ADDRESS", default_value = "127.0.0.1:3284")]
    address: SocketAddr,

    /// Session token agents must present. Generated when omitted.
    #[arg(long, env = "INTEL_SERVER_TOKEN")]
    token: Option<String>,

    /// Directory of prebuilt shim binaries served under /bin.
    #[arg(long, env = "INTEL_SERVER_BIN_DIRECTORY")]
    bin_directory: Option<PathBuf>,

    /// Git auth provider as <id>=<url-regex>, repeatable. Order matters:
    /// the first matching provider wins in reports.
    #[arg(long = "git-auth-provider", value_parser = GitAuthProvider::parse)]
    git_auth_providers: Vec<GitAuthProvider>,

    /// Interval between store flushes per session, in milliseconds.
    #[arg(long, env = "INTEL_SERVER_FLUSH_INTERVAL_MS", default_value_t = 60_000)]
    flush_interval_ms: u64,

    /// Maximum queued invocations per session before drops.
    #[arg(long, env = "INTEL_SERVER_QUEUE_LIMIT", default_value_t = 1000)]
    queue_limit: usize,

    /// Output debug-level logs.
    #[arg(long, env = "INTEL_SERVER_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(if cli.verbose { "debug" } else { "info" }))
        .init();

    let token = cli
        .token
        .clone()
        .unwrap_or_else(|| Alphanumeric.sample_string(&mut rand::thread_rng(), 32));
    let state = Arc::new(ApiState {
        store: Arc::new(MemStore::new()),
        token: token.clone(),
        default_organization: Uuid::new_v4(),
        default_user: Uuid::new_v4(),
        git_auth_providers: cli.git_auth_providers.clone(),
        flush_interval: Duration::from_millis(cli.flush_interval_ms),
        queue_limit: cli.queue_limit,
        bin_directory: cli.bin_directory.clone(),
    });

    let listener = tokio::net::TcpListener::bind(cli.address)
        .await
        .with_context(|| format!("bind {}", cli.address))?;
    info!(
        address = %cli.address,
        organization = %state.default_organization,
        "intel collector listening",
    );
    if cli.token.is_none() {
        info!(%token, "generated session token");
    }

    axum::serve(
        listener,
        create_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serve")?;
    Ok(())
}
