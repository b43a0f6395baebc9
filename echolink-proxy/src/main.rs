#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use echolink_proxy_lib::config::load_from_path;
use echolink_proxy_lib::orchestrator::Proxy;
use echolink_proxy_lib::ProxyError;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// EchoLink proxy server: authenticates EchoLink clients and relays
/// their TCP/UDP traffic to arbitrary EchoLink hosts.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(default_value = "echolink-proxy.toml")]
    config: PathBuf,

    /// Enable debug-level logging, overriding the config file's filter.
    #[arg(long)]
    debug: bool,

    /// Only log warnings and errors, overriding the config file's filter.
    #[arg(long)]
    quiet: bool,

    /// Write logs to this file in addition to stdout.
    ///
    /// Accepted for CLI compatibility; logging-medium selection beyond
    /// the default stdout subscriber is out of scope, so this path is
    /// recorded but unused.
    #[arg(short = 'L', long = "log-file", value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Remain in the foreground. This implementation never daemonizes,
    /// so this flag is accepted but has no effect.
    #[arg(short = 'F', long = "foreground")]
    foreground: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_from_path(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            // The subscriber isn't installed yet; fall back to the
            // CLI-only filter so a bad config file is still reported.
            init_tracing(&cli, None);
            error!(error = %e, path = ?cli.config, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    init_tracing(&cli, Some(&config.logging));

    if cli.log_file.is_some() {
        info!(log_file = ?cli.log_file, "log-file option is accepted but not wired up; logging goes to stdout");
    }
    if cli.foreground {
        info!("--foreground has no effect: this build never daemonizes");
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "proxy exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: echolink_proxy_lib::ProxyConfig) -> Result<(), ProxyError> {
    let mut proxy = Proxy::init(config)?;
    let listener = proxy.open().await?;
    proxy.start(listener).await?;
    info!("proxy running, press ctrl-c to shut down");

    tokio::signal::ctrl_c().await.ok();
    info!("ctrl-c received, shutting down");

    proxy.shutdown().await;
    proxy.close().await;
    info!("shutdown complete");
    Ok(())
}

/// Builds the `EnvFilter` in priority order: `RUST_LOG` env var, then
/// `--debug`/`--quiet`, then the config file's `logging.filter`, then
/// `"info"`. `logging` is `None` when the config file failed to load.
fn init_tracing(cli: &Cli, logging: Option<&echolink_proxy_lib::config::LoggingConfig>) {
    let default_filter = if cli.debug {
        "debug".to_string()
    } else if cli.quiet {
        "warn".to_string()
    } else {
        logging.map(|l| l.filter.clone()).unwrap_or_else(|| "info".to_string())
    };
    let show_target = logging.map(|l| l.show_target).unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(show_target).init();
}
