//! Intel agent daemon entrypoint.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use inteld::client::Connector;
use inteld::daemon::{Daemon, DaemonOptions};
use intel_common::loopback;
use intel_common::queue::DEFAULT_QUEUE_LIMIT;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Parser)]
#[command(name = "inteld")]
#[command(author, version, about = "Intel daemon - developer command telemetry agent")]
struct Cli {
    /// URL of the collector deployment.
    #[arg(long, env = "CODER_URL")]
    url: String,

    /// Session token used to authenticate with the collector.
    #[arg(long, env = "CODER_SESSION_TOKEN")]
    token: String,

    /// Organization to report under.
    #[arg(long, env = "CODER_ORGANIZATION", default_value = "default")]
    organization: String,

    /// Output debug-level logs.
    #[arg(long, env = "CODER_INTEL_DAEMON_VERBOSE")]
    verbose: bool,

    /// Output human-readable logs to a given file instead of stderr.
    #[arg(long, env = "CODER_INTEL_DAEMON_LOGGING_HUMAN")]
    log_human: Option<PathBuf>,

    /// Output JSON logs to a given file.
    #[arg(long, env = "CODER_INTEL_DAEMON_LOGGING_JSON")]
    log_json: Option<PathBuf>,

    /// Filter logs with an EnvFilter directive, e.g. "inteld=debug".
    #[arg(long, env = "CODER_INTEL_DAEMON_LOG_FILTER")]
    log_filter: Option<String>,

    /// The directory where binaries are aliased to and overridden in the
    /// $PATH so they can be tracked.
    #[arg(long, env = "CODER_INTEL_DAEMON_INVOKE_DIRECTORY")]
    invoke_directory: Option<PathBuf>,

    /// The instance ID of the machine running the intel daemon. This is
    /// used to identify the machine.
    #[arg(long, env = "CODER_INTEL_DAEMON_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Extra machine metadata as key=value, repeatable.
    #[arg(long = "metadata", value_parser = parse_key_value)]
    metadata: Vec<(String, String)>,

    /// Interval between invocation uploads, in milliseconds.
    #[arg(long, env = "CODER_INTEL_DAEMON_FLUSH_INTERVAL_MS", default_value_t = 30_000)]
    flush_interval_ms: u64,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

fn default_invoke_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".coder-intel")
        .join("bin")
}

fn init_logging(cli: &Cli) -> Result<()> {
    let filter = match &cli.log_filter {
        Some(directive) => EnvFilter::try_new(directive)?,
        None if cli.verbose => EnvFilter::new("debug"),
        None => EnvFilter::new("info"),
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    match &cli.log_human {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            layers.push(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .boxed(),
            );
        }
        None => layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .boxed(),
        ),
    }
    if let Some(path) = &cli.log_json {
        let file =
            File::create(path).with_context(|| format!("open log file {}", path.display()))?;
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Arc::new(file))
                .boxed(),
        );
    }

    tracing_subscriber::registry().with(layers).with(filter).init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let invoke_directory = cli
        .invoke_directory
        .clone()
        .unwrap_or_else(default_invoke_directory);
    let instance_id = cli
        .instance_id
        .clone()
        .unwrap_or_else(inteld::host::default_instance_id);
    info!(
        invoke_directory = %invoke_directory.display(),
        instance_id = %instance_id,
        "starting intel daemon",
    );

    let daemon = Daemon::start(DaemonOptions {
        connector: Connector {
            base_url: cli.url.clone(),
            token: cli.token.clone(),
            organization: cli.organization.clone(),
            instance_id,
        },
        invoke_directory,
        flush_interval: Duration::from_millis(cli.flush_interval_ms),
        queue_limit: DEFAULT_QUEUE_LIMIT,
        extra_metadata: cli.metadata.iter().cloned().collect::<HashMap<_, _>>(),
        manage_path: true,
    });

    let listener = {
        let queue = daemon.queue().clone();
        loopback::listen_for_invocations(move |req| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(req).await });
        })
        .context("listen for invocations")?
    };

    let mut wait_for_reporting = false;
    tokio::select! {
        _ = daemon.stopped() => {}
        _ = interrupt() => {
            eprintln!("Interrupt caught, gracefully exiting. Send again to force quit");
        }
        _ = terminate() => {
            eprintln!("Stop caught, waiting for intel to report and gracefully exiting. Send again to force quit");
            wait_for_reporting = true;
        }
    }
    // TODO: drain the queue before shutdown when wait_for_reporting is set.
    let _ = wait_for_reporting;

    // A second signal skips the graceful drain entirely.
    tokio::spawn(async {
        tokio::select! {
            _ = interrupt() => {}
            _ = terminate() => {}
        }
        std::process::exit(1);
    });

    listener.close();
    let fatal = daemon.fatal_error();
    daemon.close().await;
    if let Some(err) = fatal {
        error!(error = %err, "daemon stopped");
        return Err(err.into());
    }
    Ok(())
}

async fn interrupt() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(unix)]
async fn terminate() {
    let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(_) => return std::future::pending().await,
    };
    signal.recv().await;
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending().await
}
