use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use tunnelmux::config::Config;
use tunnelmux::gateway::{EchoBackend, MultiplexGateway, serve};
use tunnelmux::logging::{self, LogConfig};
use tunnelmux::tunnel::{self, ProxyRequest, ProxyResponse, RequestHandler, TunnelOptions};

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "tunnelmux",
    version,
    about = "Multiplexing WebSocket gateway and reconnecting devhook tunnel"
)]
struct Cli {
    /// Config file (default: ~/.tunnelmux/config.toml)
    #[arg(long, short, global = true, value_name = "PATH", env = "TUNNELMUX_CONFIG")]
    config: Option<PathBuf>,
    /// Debug logging for tunnelmux
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the gateway in the foreground with the built-in echo backend
    Gateway(GatewayArgs),
    /// Expose a local HTTP server through a relay
    Tunnel(TunnelArgs),
    /// Manage the config file
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Write a config file with every setting at its default
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, clap::Args)]
struct GatewayArgs {
    /// Listen address (host:port or ws://host:port)
    #[arg(long, alias = "ws", value_name = "ADDR")]
    listen: Option<String>,
    /// Per-client outbound buffer limit in bytes
    #[arg(long, value_name = "BYTES")]
    max_buffered_bytes: Option<usize>,
}

#[derive(Debug, clap::Args)]
struct TunnelArgs {
    /// Relay base URL
    #[arg(long, value_name = "URL")]
    relay: Option<String>,
    /// Tunnel id, appended to the relay URL
    #[arg(long)]
    id: Option<String>,
    /// Local origin proxied requests are forwarded to
    #[arg(long, value_name = "URL")]
    target: Option<String>,
    /// WebSocket ping interval in seconds (0 disables)
    #[arg(long, value_name = "SECS")]
    keepalive: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::from_env();
    if cli.verbose {
        log_config = log_config.verbose();
    }
    logging::init(log_config);

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    if let Commands::Config(ConfigCommand::Init { force }) = cli.command {
        return init_config(&config_path, force);
    }
    let mut config = Config::load(Some(config_path))?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(tokio::signal::ctrl_c(), cancel.clone()));

    match cli.command {
        Commands::Gateway(args) => {
            if let Some(listen) = args.listen {
                config.gateway.listen = listen;
            }
            if let Some(limit) = args.max_buffered_bytes {
                config.gateway.max_buffered_bytes = limit;
            }
            run_gateway(&config, cancel).await
        }
        Commands::Tunnel(args) => {
            let tunnel = &mut config.tunnel;
            tunnel.relay_url = args.relay.or(tunnel.relay_url.take());
            tunnel.id = args.id.or(tunnel.id.take());
            tunnel.target = args.target.or(tunnel.target.take());
            if args.keepalive.is_some() {
                tunnel.keepalive_secs = args.keepalive;
            }
            run_tunnel(&config, cancel).await
        }
        Commands::Config(_) => Ok(()),
    }
}

/// Cancel once `signal` fires. If the signal cannot be listened for, the
/// token is never cancelled and the process runs until killed.
async fn cancel_on_signal<F>(signal: F, cancel: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = signal.await {
        tracing::error!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("interrupt received, shutting down");
    cancel.cancel();
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to replace it",
            path.display()
        );
    }
    Config::default().save(path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

// ── Gateway ─────────────────────────────────────────────────────────────────

async fn run_gateway(config: &Config, cancel: CancellationToken) -> Result<()> {
    let options = config.gateway.options()?;
    let gateway = MultiplexGateway::start(options, EchoBackend::new);
    serve(gateway, cancel).await
}

// ── Tunnel ──────────────────────────────────────────────────────────────────

async fn run_tunnel(config: &Config, cancel: CancellationToken) -> Result<()> {
    let settings = &config.tunnel;
    let relay = settings
        .relay_url
        .clone()
        .context("No relay URL: pass --relay or set tunnel.relay_url")?;
    let id = settings
        .id
        .clone()
        .context("No tunnel id: pass --id or set tunnel.id")?;
    let target = settings
        .target
        .as_deref()
        .context("No target: pass --target or set tunnel.target")?;
    let target = Url::parse(target).with_context(|| format!("Invalid target URL {}", target))?;

    let handler = forwarding_handler(target.clone(), reqwest::Client::new());
    let mut options = TunnelOptions::new(relay, id.clone(), handler)
        .with_policy(settings.reconnect.clone())
        .on_connect(|| tracing::info!("tunnel connected"))
        .on_disconnect(|info| {
            tracing::info!(code = ?info.code, reason = %info.reason, "tunnel disconnected")
        })
        .on_error(|err| tracing::warn!(error = %err, "tunnel error"));
    if let Some(interval) = settings.keepalive() {
        options = options.with_keepalive(interval);
    }

    let handle = tunnel::listen(options)?;
    tracing::info!(%id, upstream = %target, "tunnel started");

    cancel.cancelled().await;
    handle.dispose();
    if tokio::time::timeout(Duration::from_secs(5), handle.wait_closed())
        .await
        .is_err()
    {
        tracing::warn!("tunnel did not close in time");
    }
    Ok(())
}

/// Forward every proxied request to `target`, keeping path and query.
fn forwarding_handler(target: Url, client: reqwest::Client) -> Arc<dyn RequestHandler> {
    Arc::new(move |request: ProxyRequest| {
        let client = client.clone();
        let target = target.clone();
        async move { forward(&client, &target, request).await }
    })
}

async fn forward(
    client: &reqwest::Client,
    target: &Url,
    request: ProxyRequest,
) -> Result<ProxyResponse> {
    let (parts, body) = request.into_parts();
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = target
        .join(path)
        .with_context(|| format!("Cannot map {} onto {}", path, target))?;

    let mut headers = parts.headers;
    headers.remove(http::header::HOST);
    tracing::debug!(method = %parts.method, %url, "forwarding request");

    let upstream = client
        .request(parts.method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.map(Ok::<_, std::io::Error>)))
        .send()
        .await
        .context("Local target request failed")?;

    let status = upstream.status();
    let headers = upstream.headers().clone();
    let bytes = upstream
        .bytes()
        .await
        .context("Failed to read local target response")?;

    let mut response = http::Response::new(bytes);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
