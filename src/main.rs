mod config;
mod dashboard;
mod dashboard_core;
mod model_routing;
mod proxy;
mod state;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio::sync::watch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, ConfigError};
use crate::proxy::{ProxyService, RuntimeMapping, build_http_client, router as proxy_router};
use crate::state::RequestStats;

#[derive(Parser, Debug)]
#[command(name = "fallback-relay", version)]
#[command(
    about = "Chat-completion proxy that retries empty replies on a fallback upstream",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub enum CliError {
    /// Missing or invalid settings (TOML file, environment, flags)
    Config(String),
    /// Generic fallback for other failures
    Other(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Config error: {}", msg),
            CliError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        CliError::Other(format!("{e:#}"))
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the proxy (default when no subcommand is given)
    Serve(ServeArgs),
    /// Print the resolved configuration and exit; fails if it does not validate
    CheckConfig {
        /// TOML config file (defaults to ~/.fallback-relay/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args, Debug, Default)]
struct ServeArgs {
    /// TOML config file (defaults to ~/.fallback-relay/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Listen host (overrides LISTEN_HOST)
    #[arg(long)]
    host: Option<String>,
    /// Proxy listen port (overrides SERVER_PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Stats listen port, 0 disables it (overrides WEBUI_PORT)
    #[arg(long)]
    stats_port: Option<u16>,
    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = real_main().await {
        eprintln!("{}", err.to_string().red());
        std::process::exit(1);
    }
}

async fn real_main() -> CliResult<()> {
    // A missing .env is fine; real environment variables still win over it.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::CheckConfig { config }) => check_config(config.as_deref()),
        Some(Command::Serve(args)) => serve(args).await,
        None => serve(ServeArgs::default()).await,
    }
}

fn check_config(path: Option<&Path>) -> CliResult<()> {
    let cfg = AppConfig::load(path)?;
    println!("{}", "configuration OK".green());
    for line in cfg.describe() {
        println!("  {line}");
    }
    Ok(())
}

async fn serve(args: ServeArgs) -> CliResult<()> {
    let _log_guard = init_tracing(args.log_file.as_deref())?;

    let mut cfg = AppConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        cfg.listen_host = host;
    }
    if let Some(port) = args.port {
        cfg.server_port = port;
    }
    if let Some(port) = args.stats_port {
        cfg.stats_port = port;
    }

    run_server(cfg).await?;
    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> CliResult<Option<WorkerGuard>> {
    // RUST_LOG wins; LOG_LEVEL (INFO, DEBUG, ...) is accepted as a simpler knob.
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            std::env::var("LOG_LEVEL")
                .map_err(|e| e.to_string())
                .and_then(|lvl| EnvFilter::try_new(lvl.trim().to_lowercase()).map_err(|e| e.to_string()))
        })
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(atty::is(atty::Stream::Stderr))
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| CliError::Config(format!("invalid --log-file path: {}", path.display())))?;
    std::fs::create_dir_all(&dir).map_err(|e| {
        CliError::Other(format!("failed to create log directory {}: {e}", dir.display()))
    })?;

    let file_appender = tracing_appender::rolling::never(&dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .with_writer(non_blocking)
        .init();
    Ok(Some(guard))
}

async fn run_server(cfg: AppConfig) -> anyhow::Result<()> {
    cfg.log_summary();

    let client = build_http_client(cfg.timeouts)?;
    let stats = Arc::new(RequestStats::default());
    let mappings = Arc::new(
        RuntimeMapping::load(cfg.model_mapping_file.clone(), cfg.mapping_auto_reload).await,
    );

    let proxy = ProxyService::new(client, &cfg, mappings, stats.clone());
    let app: Router = proxy_router(proxy);

    let listener = bind_listener_or_explain(&cfg.listen_host, cfg.server_port, "proxy").await?;
    tracing::info!(
        "fallback-relay listening on http://{}:{}",
        cfg.listen_host,
        cfg.server_port
    );

    let stats_listener = if cfg.stats_port == 0 {
        tracing::info!("stats listener disabled");
        None
    } else {
        let l = bind_listener_or_explain(&cfg.listen_host, cfg.stats_port, "stats").await?;
        tracing::info!(
            "stats available on http://{}:{}/api/stats",
            cfg.listen_host,
            cfg.stats_port
        );
        Some(l)
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received; draining connections");
        let _ = shutdown_tx.send(true);
    });

    let stats_rx = shutdown_rx.clone();
    let proxy_server = serve_until_shutdown(listener, app, shutdown_rx);
    let stats_server = async move {
        match stats_listener {
            Some(l) => serve_until_shutdown(l, dashboard::router(stats), stats_rx).await,
            None => Ok(()),
        }
    };
    tokio::try_join!(proxy_server, stats_server)?;

    tracing::info!("fallback-relay stopped");
    Ok(())
}

async fn serve_until_shutdown(
    listener: tokio::net::TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;
    Ok(())
}

async fn bind_listener_or_explain(
    host: &str,
    port: u16,
    listener_name: &'static str,
) -> anyhow::Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|err| {
            let help = listener_bind_help(host, port, listener_name, &err);
            anyhow::Error::new(err).context(help)
        })
}

fn listener_bind_help(host: &str, port: u16, listener_name: &str, err: &std::io::Error) -> String {
    let example_port = port.saturating_add(1);
    let flag = if listener_name == "stats" {
        "--stats-port"
    } else {
        "--port"
    };
    let example_cmd = format!("fallback-relay serve {flag} {example_port}");

    match err.kind() {
        ErrorKind::AddrInUse => format!(
            "cannot listen on http://{host}:{port} ({listener_name}): port {port} is already in use.\n\
- stop the process holding it, or pick another port, e.g. `{example_cmd}`"
        ),
        ErrorKind::PermissionDenied => format!(
            "cannot listen on http://{host}:{port} ({listener_name}): permission denied for port {port}.\n\
- ports below 1024 usually need elevated privileges; try `{example_cmd}`"
        ),
        _ => format!(
            "cannot listen on http://{host}:{port} ({listener_name}).\n\
- try another port, e.g. `{example_cmd}`"
        ),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = sigterm.recv() => {},
                }
            }
            _ => {
                // Fallback: at least handle Ctrl+C.
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
